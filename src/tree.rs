//! C1 — the spec tree data model (spec.md §3, §4.C1).
//!
//! Declaration builds a mutable arena of `Rc<RefCell<...>>` nodes (cheap,
//! single-threaded, exactly the shape the ambient registrar's thread-local
//! stack wants to push/pop into). Once the file's declarations finish,
//! `Builder::freeze` walks that arena once and produces an immutable,
//! `Arc`-based tree that is `Send + Sync` and can be handed to a
//! bounded-parallel scheduler. Nothing under `frozen` is ever mutated again
//! for the lifetime of the run - that's the "declaration is single
//! threaded, the tree is shared read-only afterwards" contract from §5.

use std::{
    any::Any,
    cell::RefCell,
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    rc::{Rc, Weak as RcWeak},
    sync::{Arc, Weak},
    time::Duration,
};

use futures::future::BoxFuture;

use crate::error::{FailureDetail, Kind};
use crate::id::SpecId;

pub type HookThunk = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type BodyThunk = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type FixtureValue = Arc<dyn Any + Send + Sync>;
pub type FixtureFactory =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<FixtureValue>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

/// Ordered list per kind, registered in declaration order. spec.md §9
/// explicitly calls out that the observed source overwrites on
/// re-declaration and instructs us *not* to replicate that - this is the
/// redesigned, append-only behaviour.
#[derive(Default)]
pub struct HookSet {
    pub before_all: Vec<HookThunk>,
    pub after_all: Vec<HookThunk>,
    pub before_each: Vec<HookThunk>,
    pub after_each: Vec<HookThunk>,
}

impl HookSet {
    fn push(&mut self, kind: HookKind, thunk: HookThunk) {
        match kind {
            HookKind::BeforeAll => self.before_all.push(thunk),
            HookKind::AfterAll => self.after_all.push(thunk),
            HookKind::BeforeEach => self.before_each.push(thunk),
            HookKind::AfterEach => self.after_each.push(thunk),
        }
    }
}

struct FixtureDef {
    factory: FixtureFactory,
    type_name: &'static str,
}

// --- Declaration-phase (mutable) arena -------------------------------------

pub(crate) struct BuildContext {
    description: String,
    parent: Option<RcWeak<RefCell<BuildContext>>>,
    children: Vec<BuildNode>,
    hooks: HookSet,
    tags: HashSet<String>,
    fixtures: HashMap<String, FixtureDef>,
}

pub(crate) enum BuildNode {
    Context(Rc<RefCell<BuildContext>>),
    Spec(BuildSpec),
}

pub(crate) struct BuildSpec {
    pub description: String,
    pub source_file: PathBuf,
    pub line: u32,
    pub body: Option<BodyThunk>,
    pub focused: bool,
    pub skipped: bool,
    pub tags: HashSet<String>,
}

impl BuildContext {
    pub(crate) fn new_root() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            description: String::new(),
            parent: None,
            children: Vec::new(),
            hooks: HookSet::default(),
            tags: HashSet::new(),
            fixtures: HashMap::new(),
        }))
    }

    pub(crate) fn new_child(
        parent: &Rc<RefCell<BuildContext>>,
        description: String,
        tags: HashSet<String>,
    ) -> Rc<RefCell<Self>> {
        let child = Rc::new(RefCell::new(Self {
            description,
            parent: Some(Rc::downgrade(parent)),
            children: Vec::new(),
            hooks: HookSet::default(),
            tags,
            fixtures: HashMap::new(),
        }));
        parent
            .borrow_mut()
            .children
            .push(BuildNode::Context(child.clone()));
        child
    }

    pub(crate) fn add_spec(ctx: &Rc<RefCell<BuildContext>>, spec: BuildSpec) {
        ctx.borrow_mut().children.push(BuildNode::Spec(spec));
    }

    pub(crate) fn add_hook(ctx: &Rc<RefCell<BuildContext>>, kind: HookKind, thunk: HookThunk) {
        ctx.borrow_mut().hooks.push(kind, thunk);
    }

    /// Declaring a duplicate fixture name within the same context is a
    /// declaration-phase error (spec.md §4.C1 "Fail").
    pub(crate) fn add_fixture(
        ctx: &Rc<RefCell<BuildContext>>,
        name: String,
        factory: FixtureFactory,
        type_name: &'static str,
    ) -> Result<(), Kind> {
        let mut ctx = ctx.borrow_mut();
        if ctx.fixtures.contains_key(&name) {
            return Err(Kind::InvalidSpec(format!(
                "duplicate fixture {name:?} declared twice in the same context"
            )));
        }
        ctx.fixtures.insert(name, FixtureDef { factory, type_name });
        Ok(())
    }
}

/// Consumes a built arena rooted at `root` and produces the immutable tree.
/// Each leaf carries its own `source_file` (captured at the `it`/`fit`/`xit`
/// call site via `#[track_caller]` - see `registrar.rs`), so a single
/// declaration run may in principle span more than one physical file.
pub fn freeze(root: Rc<RefCell<BuildContext>>) -> Arc<SpecContext> {
    freeze_ctx(&root, Weak::new(), &[])
}

fn freeze_ctx(
    build: &Rc<RefCell<BuildContext>>,
    parent: Weak<SpecContext>,
    path_so_far: &[String],
) -> Arc<SpecContext> {
    let data = build.borrow();
    let mut path = path_so_far.to_vec();
    if !data.description.is_empty() {
        path.push(data.description.clone());
    }

    Arc::new_cyclic(|weak_self| {
        let children = data
            .children
            .iter()
            .map(|node| match node {
                BuildNode::Context(child) => {
                    Node::Context(freeze_ctx(child, weak_self.clone(), &path))
                }
                BuildNode::Spec(spec) => Node::Spec(Arc::new(SpecDefinition {
                    id: SpecId::new(spec.source_file.clone(), path.clone(), &spec.description),
                    parent: weak_self.clone(),
                    line: spec.line,
                    body: spec.body.clone(),
                    focused: spec.focused,
                    skipped: spec.skipped,
                    tags: spec.tags.clone(),
                })),
            })
            .collect();

        SpecContext {
            description: data.description.clone(),
            parent,
            children,
            hooks: HookSet {
                before_all: data.hooks.before_all.clone(),
                after_all: data.hooks.after_all.clone(),
                before_each: data.hooks.before_each.clone(),
                after_each: data.hooks.after_each.clone(),
            },
            tags: data.tags.clone(),
            fixtures: data
                .fixtures
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        FixtureDef {
                            factory: v.factory.clone(),
                            type_name: v.type_name,
                        },
                    )
                })
                .collect(),
        }
    })
}

// --- Execution-phase (immutable) tree --------------------------------------

pub struct SpecContext {
    pub description: String,
    pub parent: Weak<SpecContext>,
    pub children: Vec<Node>,
    pub hooks: HookSet,
    pub tags: HashSet<String>,
    fixtures: HashMap<String, FixtureDef>,
}

pub enum Node {
    Context(Arc<SpecContext>),
    Spec(Arc<SpecDefinition>),
}

pub struct SpecDefinition {
    pub id: SpecId,
    pub parent: Weak<SpecContext>,
    pub line: u32,
    pub body: Option<BodyThunk>,
    pub focused: bool,
    pub skipped: bool,
    pub tags: HashSet<String>,
}

impl SpecDefinition {
    pub fn pending(&self) -> bool {
        self.body.is_none()
    }

    pub fn description(&self) -> &str {
        &self.id.description
    }

    /// Ancestor chain from root to this spec's immediate parent context,
    /// needed for hook traversal (spec.md §4.C6 "Hook ordering").
    pub fn ancestor_chain(&self) -> Vec<Arc<SpecContext>> {
        let mut chain = Vec::new();
        let mut cur = self.parent.upgrade();
        while let Some(ctx) = cur {
            cur = ctx.parent.upgrade();
            chain.push(ctx);
        }
        chain.reverse();
        chain
    }
}

/// Search this context's fixture definitions, then the parent chain;
/// return the first match (spec.md §4.C1 lazy-fixture lookup: "names may
/// shadow ancestors but never collide within one context").
fn lookup_fixture(ctx: &Arc<SpecContext>, name: &str) -> Option<(FixtureFactory, &'static str)> {
    let mut cur = Some(ctx.clone());
    while let Some(c) = cur {
        if let Some(def) = c.fixtures.get(name) {
            return Some((def.factory.clone(), def.type_name));
        }
        cur = c.parent.upgrade();
    }
    None
}

/// Flat, ordered, pre-order traversal that interleaves specs and child
/// contexts in declaration order - the "candidate specs" list C6 asks C5
/// to reduce (spec.md §3 Data flow).
pub fn flatten(root: &Arc<SpecContext>) -> Vec<Arc<SpecDefinition>> {
    let mut out = Vec::new();
    flatten_into(root, &mut out);
    out
}

fn flatten_into(ctx: &Arc<SpecContext>, out: &mut Vec<Arc<SpecDefinition>>) {
    for child in &ctx.children {
        match child {
            Node::Spec(spec) => out.push(spec.clone()),
            Node::Context(sub) => flatten_into(sub, out),
        }
    }
}

// --- Result & per-spec memoization scope ------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Passed,
    Failed,
    Pending,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryMeta {
    pub attempts: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct SpecResult {
    pub id: SpecId,
    pub status: Status,
    pub duration: Duration,
    pub failure: Option<FailureDetail>,
    pub retry: Option<RetryMeta>,
    pub coverage_delta: Option<serde_json::Value>,
    pub flaky: bool,
}

impl SpecResult {
    pub fn passed(id: SpecId, duration: Duration) -> Self {
        Self {
            id,
            status: Status::Passed,
            duration,
            failure: None,
            retry: None,
            coverage_delta: None,
            flaky: false,
        }
    }

    pub fn failed(id: SpecId, duration: Duration, failure: FailureDetail) -> Self {
        Self {
            id,
            status: Status::Failed,
            duration,
            failure: Some(failure),
            retry: None,
            coverage_delta: None,
            flaky: false,
        }
    }

    pub fn pending(id: SpecId) -> Self {
        Self {
            id,
            status: Status::Pending,
            duration: Duration::ZERO,
            failure: None,
            retry: None,
            coverage_delta: None,
            flaky: false,
        }
    }

    pub fn skipped(id: SpecId) -> Self {
        Self {
            id,
            status: Status::Skipped,
            duration: Duration::ZERO,
            failure: None,
            retry: None,
            coverage_delta: None,
            flaky: false,
        }
    }
}

/// Per-spec lazy-fixture memoization scope (spec.md §3 "LetScope"). Created
/// fresh for each spec, released when its `after_each` chain completes.
pub struct LetScope {
    ctx: Arc<SpecContext>,
    memo: parking_lot::Mutex<HashMap<String, FixtureValue>>,
}

impl LetScope {
    pub fn new(ctx: Arc<SpecContext>) -> Self {
        Self {
            ctx,
            memo: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Instantiate on first call, memoize for the lifetime of this scope.
    /// `get<T>` with no matching name is `UnknownFixture`; a type mismatch
    /// against a previously-memoized value of the same name is
    /// `FixtureTypeMismatch`.
    pub async fn get<T: Any + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, FailureDetail> {
        if let Some(existing) = self.memo.lock().get(name).cloned() {
            return existing
                .downcast::<T>()
                .map_err(|_| FailureDetail::new(Kind::FixtureTypeMismatch(name.to_owned()), ""));
        }

        let (factory, type_name) = lookup_fixture(&self.ctx, name)
            .ok_or_else(|| FailureDetail::new(Kind::UnknownFixture(name.to_owned()), ""))?;

        let value = factory()
            .await
            .map_err(|e| FailureDetail::new(Kind::Runtime, format!("{e:#}")))?;

        let typed = value.clone().downcast::<T>().map_err(|_| {
            FailureDetail::new(
                Kind::FixtureTypeMismatch(name.to_owned()),
                format!("fixture {name:?} is a {type_name}"),
            )
        })?;

        self.memo.lock().insert(name.to_owned(), value);
        Ok(typed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn leaf_spec(description: &str, body: Option<BodyThunk>) -> BuildSpec {
        BuildSpec {
            description: description.to_owned(),
            source_file: PathBuf::from("root.spec"),
            line: 1,
            body,
            focused: false,
            skipped: false,
            tags: HashSet::new(),
        }
    }

    fn ok_body() -> BodyThunk {
        Arc::new(|| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn flatten_interleaves_in_declaration_order() {
        let root = BuildContext::new_root();
        BuildContext::add_spec(&root, leaf_spec("a", Some(ok_body())));
        let child = BuildContext::new_child(&root, "C".to_owned(), HashSet::new());
        BuildContext::add_spec(&child, leaf_spec("b", Some(ok_body())));
        BuildContext::add_spec(&root, leaf_spec("c", Some(ok_body())));

        let frozen = freeze(root);
        let flat = flatten(&frozen);
        let names: Vec<_> = flat.iter().map(|s| s.description().to_owned()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(flat[1].id.display_name(), "C > b");
    }

    #[test]
    fn duplicate_fixture_name_is_invalid_spec() {
        let root = BuildContext::new_root();
        let factory: FixtureFactory = Arc::new(|| Box::pin(async { Ok(Arc::new(1i32) as _) }));
        BuildContext::add_fixture(&root, "x".to_owned(), factory.clone(), "i32").unwrap();
        let err = BuildContext::add_fixture(&root, "x".to_owned(), factory, "i32").unwrap_err();
        assert!(matches!(err, Kind::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn let_scope_memoizes_and_shadows() {
        let root = BuildContext::new_root();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let factory: FixtureFactory = Arc::new(move || {
            let calls = calls2.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(42i32) as FixtureValue)
            })
        });
        BuildContext::add_fixture(&root, "answer".to_owned(), factory, "i32").unwrap();

        let child = BuildContext::new_child(&root, "Child".to_owned(), HashSet::new());
        let shadow_factory: FixtureFactory =
            Arc::new(|| Box::pin(async { Ok(Arc::new(7i32) as FixtureValue) }));
        BuildContext::add_fixture(&child, "answer".to_owned(), shadow_factory, "i32").unwrap();
        BuildContext::add_spec(&child, leaf_spec("uses fixture", Some(ok_body())));

        let frozen = freeze(root);
        let flat = flatten(&frozen);
        let spec_ctx = flat[0].parent.upgrade().unwrap();

        let scope = LetScope::new(spec_ctx);
        let first = scope.get::<i32>("answer").await.unwrap();
        let second = scope.get::<i32>("answer").await.unwrap();
        assert_eq!(*first, 7, "child fixture should shadow the ancestor's");
        assert_eq!(*second, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "ancestor factory never called");

        let missing = scope.get::<i32>("nope").await.unwrap_err();
        assert_eq!(missing.kind, Kind::UnknownFixture("nope".to_owned()));

        let wrong_type = scope.get::<String>("answer").await.unwrap_err();
        assert!(matches!(wrong_type.kind, Kind::FixtureTypeMismatch(_)));
    }
}
