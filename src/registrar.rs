//! C2 — the ambient registrar (spec.md §4.C2).
//!
//! `describe`/`it`/`before`/`let`/`get` are free-standing: there is no
//! explicit "runner" argument threaded through script code. Declaration
//! time keeps a thread-local stack whose top is the context currently
//! accepting declarations; execution time keeps a task-local holding the
//! `LetScope` for whichever spec is currently running. Both are correctly
//! scoped because declaration is single-threaded per file and execution
//! gives each spec body exclusive ownership of its task for the body's
//! duration (spec.md §5).

use std::{
    cell::RefCell,
    collections::HashSet,
    future::Future,
    panic::Location,
    path::PathBuf,
    rc::Rc,
    sync::Arc,
};

use futures::FutureExt;

use crate::error::{FailureDetail, Kind};
use crate::tree::{
    BodyThunk, BuildContext, BuildSpec, FixtureFactory, FixtureValue, HookKind, HookThunk,
    LetScope, SpecContext,
};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Rc<RefCell<BuildContext>>>> = RefCell::new(Vec::new());
    static TAG_STACK: RefCell<Vec<HashSet<String>>> = RefCell::new(Vec::new());
    static DECL_ERRORS: RefCell<Vec<Kind>> = RefCell::new(Vec::new());
}

tokio::task_local! {
    static CURRENT_LET_SCOPE: Arc<LetScope>;
}

fn current_context() -> Rc<RefCell<BuildContext>> {
    CONTEXT_STACK.with(|s| {
        s.borrow()
            .last()
            .cloned()
            .expect("describe/it/before/let called outside a declaration run")
    })
}

fn current_tags() -> HashSet<String> {
    TAG_STACK.with(|s| s.borrow().last().cloned().unwrap_or_default())
}

fn record_decl_error(kind: Kind) {
    DECL_ERRORS.with(|e| e.borrow_mut().push(kind));
}

/// Runs `f`, which is expected to call `describe`/`it`/etc, as a single
/// declaration phase, and freezes the resulting tree. Mirrors being handed
/// the root `SpecContext` a script evaluator would return (spec.md §6
/// "Script evaluator boundary").
pub fn declare(f: impl FnOnce()) -> Result<Arc<SpecContext>, Kind> {
    let root = BuildContext::new_root();
    CONTEXT_STACK.with(|s| {
        assert!(
            s.borrow().is_empty(),
            "declare() called while another declaration run is in progress on this thread"
        );
        s.borrow_mut().push(root.clone());
    });
    DECL_ERRORS.with(|e| e.borrow_mut().clear());

    f();

    CONTEXT_STACK.with(|s| s.borrow_mut().clear());
    let errs = DECL_ERRORS.with(|e| std::mem::take(&mut *e.borrow_mut()));
    if let Some(first) = errs.into_iter().next() {
        return Err(first);
    }
    Ok(crate::tree::freeze(root))
}

/// Push a new child context, run `f` with it on top of the stack, pop.
pub fn describe(description: impl Into<String>, f: impl FnOnce()) {
    let parent = current_context();
    let tags = current_tags();
    let child = BuildContext::new_child(&parent, description.into(), tags);
    CONTEXT_STACK.with(|s| s.borrow_mut().push(child));
    f();
    CONTEXT_STACK.with(|s| {
        s.borrow_mut().pop();
    });
}

/// Alias used by script bodies that prefer `context(...)` over
/// `describe(...)` for nested (non-top-level) groups - purely stylistic in
/// the source dialect, identical behaviour.
pub fn context(description: impl Into<String>, f: impl FnOnce()) {
    describe(description, f)
}

fn add_spec(
    description: String,
    body: Option<BodyThunk>,
    focused: bool,
    skipped: bool,
    loc: &'static Location<'static>,
) {
    if description.is_empty() && body.is_some() {
        record_decl_error(Kind::InvalidSpec(
            "spec description must not be empty unless pending".to_owned(),
        ));
        return;
    }
    let ctx = current_context();
    BuildContext::add_spec(
        &ctx,
        BuildSpec {
            description,
            source_file: PathBuf::from(loc.file()),
            line: loc.line(),
            body,
            focused,
            skipped,
            tags: current_tags(),
        },
    );
}

fn wrap_body<F, Fut>(body: F) -> BodyThunk
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || body().boxed())
}

/// A spec with no body is pending (spec.md §3 "absent ⇒ pending").
#[track_caller]
pub fn it<F, Fut>(description: impl Into<String>, body: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    add_spec(
        description.into(),
        Some(wrap_body(body)),
        false,
        false,
        Location::caller(),
    );
}

#[track_caller]
pub fn xit(description: impl Into<String>) {
    add_spec(description.into(), None, false, false, Location::caller());
}

#[track_caller]
pub fn fit<F, Fut>(description: impl Into<String>, body: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    add_spec(
        description.into(),
        Some(wrap_body(body)),
        true,
        false,
        Location::caller(),
    );
}

/// Explicitly skipped spec with a body (distinct from `xit`'s "pending"):
/// the body exists but is never run, reason `explicitly-skipped`.
#[track_caller]
pub fn skip<F, Fut>(description: impl Into<String>, body: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    add_spec(
        description.into(),
        Some(wrap_body(body)),
        false,
        true,
        Location::caller(),
    );
}

fn wrap_hook<F, Fut>(hook: F) -> HookThunk
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || hook().boxed())
}

pub fn before<F, Fut>(hook: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    BuildContext::add_hook(&current_context(), HookKind::BeforeEach, wrap_hook(hook));
}

pub fn before_all<F, Fut>(hook: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    BuildContext::add_hook(&current_context(), HookKind::BeforeAll, wrap_hook(hook));
}

pub fn after<F, Fut>(hook: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    BuildContext::add_hook(&current_context(), HookKind::AfterEach, wrap_hook(hook));
}

pub fn after_all<F, Fut>(hook: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    BuildContext::add_hook(&current_context(), HookKind::AfterAll, wrap_hook(hook));
}

/// Nested `tag`/`tags` calls union with ancestors for the duration of `f`.
pub fn tag(tags: &[&str], f: impl FnOnce()) {
    let mut set = current_tags();
    set.extend(tags.iter().map(|s| s.to_string()));
    TAG_STACK.with(|s| s.borrow_mut().push(set));
    f();
    TAG_STACK.with(|s| {
        s.borrow_mut().pop();
    });
}

pub fn tags(tags: &[&str], f: impl FnOnce()) {
    tag(tags, f)
}

/// Declares a lazy fixture on the enclosing context. Duplicate names
/// within one context are recorded as `InvalidSpec` (spec.md §4.C1 Fail)
/// and surface when `declare()` returns.
pub fn let_fixture<T, F, Fut>(name: impl Into<String>, factory: F)
where
    T: std::any::Any + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let name = name.into();
    let factory: FixtureFactory = Arc::new(move || {
        let fut = factory();
        Box::pin(async move { fut.await.map(|v| Arc::new(v) as FixtureValue) })
    });
    if let Err(kind) =
        BuildContext::add_fixture(&current_context(), name, factory, std::any::type_name::<T>())
    {
        record_decl_error(kind);
    }
}

/// Consults the execution-phase `LetScope.current`; outside a running spec
/// body this is `InvalidLifecycle` (spec.md §4.C2 Fail).
pub async fn get<T: std::any::Any + Send + Sync + 'static>(
    name: &str,
) -> Result<Arc<T>, FailureDetail> {
    let scope = CURRENT_LET_SCOPE
        .try_with(|s| s.clone())
        .map_err(|_| FailureDetail::new(Kind::InvalidLifecycle, "get() called outside a spec body"))?;
    scope.get::<T>(name).await
}

/// Runs `fut` with `scope` installed as the ambient `LetScope.current` -
/// called by the scheduler's base layer around each spec body (and its
/// hook chain, so hooks can also use `get`).
pub async fn with_let_scope<Fut, T>(scope: Arc<LetScope>, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    CURRENT_LET_SCOPE.scope(scope, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::flatten;

    #[test]
    fn declaration_builds_interleaved_tree_and_picks_up_tags() {
        let tree = declare(|| {
            tag(&["slow"], || {
                it("a", || async { Ok(()) });
            });
            describe("Group", || {
                it("b", || async { Ok(()) });
            });
        })
        .unwrap();

        let flat = flatten(&tree);
        assert_eq!(flat.len(), 2);
        assert!(flat[0].tags.contains("slow"));
        assert!(!flat[1].tags.contains("slow"));
        assert_eq!(flat[1].id.display_name(), "Group > b");
    }

    #[test]
    fn pending_spec_has_no_body() {
        let tree = declare(|| {
            xit("someday");
        })
        .unwrap();
        let flat = flatten(&tree);
        assert!(flat[0].pending());
    }

    #[test]
    fn duplicate_fixture_fails_declaration() {
        let err = declare(|| {
            let_fixture::<i32, _, _>("x", || async { Ok(1) });
            let_fixture::<i32, _, _>("x", || async { Ok(2) });
            it("uses it", || async { Ok(()) });
        })
        .unwrap_err();
        assert!(matches!(err, Kind::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn get_outside_spec_body_is_invalid_lifecycle() {
        let err = get::<i32>("whatever").await.unwrap_err();
        assert_eq!(err.kind, Kind::InvalidLifecycle);
    }

    #[tokio::test]
    async fn get_inside_spec_body_resolves_fixture() {
        let tree = declare(|| {
            let_fixture::<i32, _, _>("answer", || async { Ok(42) });
            it("uses fixture", || async {
                let v = get::<i32>("answer").await.map_err(|e| anyhow::anyhow!("{e}"))?;
                anyhow::ensure!(*v == 42);
                Ok(())
            });
        })
        .unwrap();
        let flat = flatten(&tree);
        let spec = &flat[0];
        let scope = Arc::new(LetScope::new(spec.parent.upgrade().unwrap()));
        let body = spec.body.clone().unwrap();
        with_let_scope(scope, body()).await.unwrap();
    }
}
