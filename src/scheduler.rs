//! C6 — the scheduler (spec.md §4.C6 "Hook ordering" / "Bail" /
//! "Scheduler", §5 concurrency model).
//!
//! Builds the base layer the middleware chain wraps (hook traversal +
//! `LetScope` + body invocation), accounts for `before_all`/`after_all`
//! exactly-once-per-context semantics across concurrent workers, and runs
//! the resulting pipeline either sequentially or over a bounded worker
//! pool, reordering results back into declaration order on the way out.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::error::{FailureDetail, Kind, Phase};
use crate::middleware::{self, ExecContext, Middleware, Next};
use crate::registrar;
use crate::tree::{HookThunk, LetScope, SpecContext, SpecDefinition, SpecResult};
use crate::util::ErrGroup;

async fn run_sequence(hooks: &[HookThunk], phase: Phase, stop_on_first_error: bool) -> Option<FailureDetail> {
    let mut first = None;
    for hook in hooks {
        if let Err(e) = hook().await {
            if first.is_none() {
                first = Some(FailureDetail::new(Kind::Hook(phase.clone()), format!("{e:#}")));
            }
            if stop_on_first_error {
                break;
            }
        }
    }
    first
}

struct ContextEntry {
    before_all: OnceCell<Option<FailureDetail>>,
    after_all: OnceCell<Option<FailureDetail>>,
    remaining: AtomicUsize,
}

/// Tracks, for every ancestor context of the runnable set, how many of its
/// descendant specs are still outstanding, so `after_all` fires exactly
/// once per context - when its last runnable spec finishes - under
/// concurrent workers (spec.md §5 "per-context hook state... guarded by a
/// context-scoped mutex"; here a per-context atomic counter plus
/// `OnceCell` serves the same purpose without a held lock across awaits).
struct HookCoordinator {
    entries: HashMap<usize, Arc<ContextEntry>>,
}

impl HookCoordinator {
    fn build(specs: &[Arc<SpecDefinition>]) -> Self {
        let mut entries: HashMap<usize, Arc<ContextEntry>> = HashMap::new();
        for spec in specs {
            for ctx in spec.ancestor_chain() {
                let key = Arc::as_ptr(&ctx) as usize;
                let entry = entries
                    .entry(key)
                    .or_insert_with(|| {
                        Arc::new(ContextEntry {
                            before_all: OnceCell::new(),
                            after_all: OnceCell::new(),
                            remaining: AtomicUsize::new(0),
                        })
                    })
                    .clone();
                entry.remaining.fetch_add(1, Ordering::SeqCst);
            }
        }
        Self { entries }
    }

    fn entry(&self, ctx: &Arc<SpecContext>) -> Arc<ContextEntry> {
        self.entries
            .get(&(Arc::as_ptr(ctx) as usize))
            .expect("every ancestor of a runnable spec has an entry")
            .clone()
    }
}

/// Runs, in order, whichever `before_all` hooks (outer to inner) haven't
/// already run for this chain. Each context's hooks run exactly once
/// across however many specs/retries reach it.
async fn ensure_before_all(coordinator: &HookCoordinator, chain: &[Arc<SpecContext>]) -> Option<FailureDetail> {
    for ctx in chain {
        let entry = coordinator.entry(ctx);
        let result =
            entry.before_all.get_or_init(|| async { run_sequence(&ctx.hooks.before_all, Phase::Setup, true).await }).await;
        if let Some(detail) = result {
            return Some(detail.clone());
        }
    }
    None
}

async fn run_before_each(chain: &[Arc<SpecContext>]) -> Option<FailureDetail> {
    for ctx in chain {
        if let Some(detail) = run_sequence(&ctx.hooks.before_each, Phase::Setup, true).await {
            return Some(detail);
        }
    }
    None
}

async fn run_after_each(chain: &[Arc<SpecContext>]) -> Option<FailureDetail> {
    let mut first = None;
    for ctx in chain.iter().rev() {
        if let Some(detail) = run_sequence(&ctx.hooks.after_each, Phase::Teardown, false).await {
            if first.is_none() {
                first = Some(detail);
            }
        }
    }
    first
}

/// Decrements the outstanding-spec counter for each ancestor (inner to
/// outer) and fires `after_all` for any context whose count just hit zero.
async fn exhaust_contexts(coordinator: &HookCoordinator, chain: &[Arc<SpecContext>]) -> Option<FailureDetail> {
    let mut first = None;
    for ctx in chain.iter().rev() {
        let entry = coordinator.entry(ctx);
        let remaining = entry.remaining.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let result =
                entry.after_all.get_or_init(|| async { run_sequence(&ctx.hooks.after_all, Phase::Teardown, false).await }).await;
            if let Some(detail) = result {
                if first.is_none() {
                    first = Some(detail.clone());
                }
            }
        }
    }
    first
}

/// Builds the base layer (innermost `Next`): hook traversal, a fresh
/// `LetScope` per invocation, and the body call itself.
fn base_layer(coordinator: Arc<HookCoordinator>) -> Next {
    Arc::new(move |ectx: ExecContext| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            let spec = ectx.spec.clone();
            let start = Instant::now();
            let chain = spec.ancestor_chain();

            if let Some(detail) = ensure_before_all(&coordinator, &chain).await {
                exhaust_contexts(&coordinator, &chain).await;
                return SpecResult::failed(spec.id.clone(), start.elapsed(), detail);
            }

            let Some(parent_ctx) = spec.parent.upgrade() else {
                return SpecResult::failed(
                    spec.id.clone(),
                    start.elapsed(),
                    FailureDetail::new(Kind::Runtime, "spec outlived its parent context"),
                );
            };
            let scope = Arc::new(LetScope::new(parent_ctx));

            let mut failure = run_before_each(&chain).await;

            if failure.is_none() {
                if let Some(body) = spec.body.clone() {
                    let outcome = registrar::with_let_scope(scope.clone(), body()).await;
                    if let Err(e) = outcome {
                        failure = Some(FailureDetail::runtime(&e));
                    }
                }
            }

            let teardown_failure = registrar::with_let_scope(scope, run_after_each(&chain)).await;
            let failure = failure.or(teardown_failure);

            let after_all_failure = exhaust_contexts(&coordinator, &chain).await;
            let failure = failure.or(after_all_failure);

            match failure {
                Some(detail) => SpecResult::failed(spec.id.clone(), start.elapsed(), detail),
                None => SpecResult::passed(spec.id.clone(), start.elapsed()),
            }
        })
    })
}

/// How many specs to run at once. `requested == 0` (or negative, upstream)
/// is coerced to the host's logical CPU count (spec.md §4.C6 "Default
/// degree").
#[derive(Debug, Clone, Copy)]
pub enum Concurrency {
    Sequential,
    Parallel(usize),
}

impl Concurrency {
    pub fn parallel_with_default(requested: usize) -> Self {
        if requested == 0 {
            Concurrency::Parallel(num_cpus())
        } else {
            Concurrency::Parallel(requested)
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub struct Scheduler {
    pub layers: Vec<Arc<dyn Middleware>>,
    pub concurrency: Concurrency,
    pub bail: bool,
}

impl Scheduler {
    /// Runs `specs` (already reduced to the runnable set by `filter::select`)
    /// through the pipeline, invoking `on_result` as each completes, in
    /// declaration order, matching the positions in `specs`.
    pub async fn run(
        &self,
        specs: Vec<Arc<SpecDefinition>>,
        mut on_result: impl FnMut(SpecResult) + Send,
    ) -> anyhow::Result<()> {
        let coordinator = Arc::new(HookCoordinator::build(&specs));
        let base = base_layer(coordinator);
        let bail_flag = middleware::bail_flag();

        let mut layers = self.layers.clone();
        if self.bail {
            // Outermost: check before doing any of the configured
            // middlewares' work, not just before the base layer.
            let flag = bail_flag.clone();
            layers.insert(
                0,
                Arc::new(middleware::FilterMiddleware {
                    predicate: Arc::new(move |_| !flag.load(Ordering::SeqCst)),
                }),
            );
        }
        let chain = middleware::compose(layers, base);

        match self.concurrency {
            Concurrency::Sequential => {
                for (position, spec) in specs.into_iter().enumerate() {
                    let ectx = ExecContext {
                        spec,
                        position,
                        cancellation: CancellationToken::new(),
                        bag: middleware::new_bag(),
                    };
                    let result = chain(ectx).await;
                    if self.bail && result.status == crate::tree::Status::Failed {
                        bail_flag.store(true, Ordering::SeqCst);
                    }
                    on_result(result);
                }
            }
            Concurrency::Parallel(degree) => {
                self.run_parallel(specs, degree, chain, bail_flag, &mut on_result).await?;
            }
        }

        Ok(())
    }

    /// Bounded-parallel execution: `degree` workers pull from a shared
    /// channel of `(position, spec)`, send results back as they finish, and
    /// a reorder buffer on this side only emits results to `on_result` once
    /// every lower position has already been emitted (spec.md §5 "Results
    /// visible to reporters are in declaration order, even under
    /// parallelism").
    async fn run_parallel(
        &self,
        specs: Vec<Arc<SpecDefinition>>,
        degree: usize,
        chain: Next,
        bail_flag: Arc<AtomicBool>,
        on_result: &mut (impl FnMut(SpecResult) + Send),
    ) -> anyhow::Result<()> {
        let total = specs.len();
        let queue: Arc<parking_lot::Mutex<std::collections::VecDeque<(usize, Arc<SpecDefinition>)>>> =
            Arc::new(parking_lot::Mutex::new(specs.into_iter().enumerate().collect()));

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, SpecResult)>();
        let ct = CancellationToken::new();
        let mut group = ErrGroup::new(ct.clone());

        for _ in 0..degree.max(1) {
            let queue = queue.clone();
            let result_tx = result_tx.clone();
            let chain = chain.clone();
            let ct = ct.clone();
            group.spawn(async move {
                loop {
                    if ct.is_cancelled() {
                        break;
                    }
                    let Some((position, spec)) = queue.lock().pop_front() else { break };
                    let ectx = ExecContext {
                        spec,
                        position,
                        cancellation: CancellationToken::new(),
                        bag: middleware::new_bag(),
                    };
                    let result = chain(ectx).await;
                    if result_tx.send((position, result)).is_err() {
                        break;
                    }
                }
                Ok(())
            });
        }
        drop(result_tx);

        let mut pending: HashMap<usize, SpecResult> = HashMap::new();
        let mut next_to_emit = 0usize;
        while let Some((position, result)) = result_rx.recv().await {
            if self.bail && result.status == crate::tree::Status::Failed {
                bail_flag.store(true, Ordering::SeqCst);
            }
            pending.insert(position, result);
            while let Some(result) = pending.remove(&next_to_emit) {
                on_result(result);
                next_to_emit += 1;
            }
        }
        debug_assert_eq!(next_to_emit, total, "every runnable spec must produce exactly one result");

        group.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    use crate::registrar::{before, before_all, declare, describe, it};
    use crate::tree::flatten;

    fn bare_scheduler(concurrency: Concurrency, bail: bool) -> Scheduler {
        Scheduler { layers: Vec::new(), concurrency, bail }
    }

    #[tokio::test]
    async fn s3_interleaved_declaration_order_is_execution_order() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let a = order.clone();
        let b = order.clone();
        let c = order.clone();
        let tree = declare(|| {
            it("a", move || {
                let a = a.clone();
                async move {
                    a.lock().unwrap().push("a");
                    Ok(())
                }
            });
            describe("C", || {
                it("b", {
                    let b = b.clone();
                    move || {
                        let b = b.clone();
                        async move {
                            b.lock().unwrap().push("b");
                            Ok(())
                        }
                    }
                });
            });
            it("c", move || {
                let c = c.clone();
                async move {
                    c.lock().unwrap().push("c");
                    Ok(())
                }
            });
        })
        .unwrap();

        let specs = flatten(&tree);
        let scheduler = bare_scheduler(Concurrency::Sequential, false);
        let mut results = Vec::new();
        scheduler.run(specs, |r| results.push(r)).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn s2_parallel_results_land_in_declaration_order_despite_finishing_out_of_order() {
        let tree = declare(|| {
            it("slow", || async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok(())
            });
            it("fast", || async { Ok(()) });
            it("medium", || async {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                Ok(())
            });
        })
        .unwrap();
        let specs = flatten(&tree);
        let scheduler = bare_scheduler(Concurrency::Parallel(3), false);
        let results = Arc::new(StdMutex::new(Vec::new()));
        let collected = results.clone();
        scheduler
            .run(specs, move |r| collected.lock().unwrap().push(r.id.display_name()))
            .await
            .unwrap();

        assert_eq!(*results.lock().unwrap(), vec!["slow".to_owned(), "fast".to_owned(), "medium".to_owned()]);
    }

    #[tokio::test]
    async fn s4_bail_cascade_skips_unclaimed_specs_sequentially() {
        let tree = declare(|| {
            it("p1", || async { Ok(()) });
            it("p2", || async { Ok(()) });
            it("fail", || async { anyhow::bail!("nope") });
            it("p4", || async { Ok(()) });
            it("p5", || async { Ok(()) });
        })
        .unwrap();
        let specs = flatten(&tree);
        let scheduler = bare_scheduler(Concurrency::Sequential, true);
        let mut results = Vec::new();
        scheduler.run(specs, |r| results.push(r)).await.unwrap();

        let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                crate::tree::Status::Passed,
                crate::tree::Status::Passed,
                crate::tree::Status::Failed,
                crate::tree::Status::Skipped,
                crate::tree::Status::Skipped,
            ]
        );
    }

    #[tokio::test]
    async fn bail_also_skips_specs_still_queued_behind_a_parallel_failure() {
        // Enough trailing specs that tokio's cooperative per-task poll budget
        // forces the worker loop to yield back to the scheduler at least once
        // while draining the queue, giving the bail flag set by the "fail"
        // result a chance to land before the queue is exhausted. This is the
        // harder case than the sequential cascade: these specs were sitting
        // in the shared queue, not already claimed and running, when bail
        // tripped.
        const TRAILING: usize = 300;
        let names: Vec<String> = (0..TRAILING).map(|i| format!("t{i}")).collect();
        let tree = declare(|| {
            it("fail", || async { anyhow::bail!("nope") });
            for name in &names {
                it(name.clone(), || async { Ok(()) });
            }
        })
        .unwrap();
        let specs = flatten(&tree);
        let scheduler = bare_scheduler(Concurrency::Parallel(2), true);
        let mut results = Vec::new();
        scheduler.run(specs, |r| results.push(r)).await.unwrap();

        assert_eq!(results.len(), TRAILING + 1);
        let failed = results.iter().filter(|r| r.status == crate::tree::Status::Failed).count();
        let skipped = results.iter().filter(|r| r.status == crate::tree::Status::Skipped).count();
        assert_eq!(failed, 1, "only the intentionally failing spec should fail");
        assert!(skipped > 0, "specs still queued behind a parallel failure must be skipped too, not just ones claimed after it completed");
    }

    #[tokio::test]
    async fn before_all_runs_exactly_once_for_its_context() {
        let calls = Arc::new(AtomicU32::new(0));
        let inner = calls.clone();
        let tree = declare(|| {
            describe("Group", move || {
                let inner = inner.clone();
                before_all(move || {
                    let inner = inner.clone();
                    async move {
                        inner.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                });
                it("a", || async { Ok(()) });
                it("b", || async { Ok(()) });
            });
        })
        .unwrap();
        let specs = flatten(&tree);
        let scheduler = bare_scheduler(Concurrency::Sequential, false);
        let mut results = Vec::new();
        scheduler.run(specs, |r| results.push(r)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.status == crate::tree::Status::Passed));
    }

    #[tokio::test]
    async fn before_each_failure_still_runs_after_each() {
        let after_ran = Arc::new(AtomicBool::new(false));
        let flag = after_ran.clone();
        let tree = declare(|| {
            before(|| async { anyhow::bail!("setup broke") });
            crate::registrar::after(move || {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });
            it("x", || async { Ok(()) });
        })
        .unwrap();
        let specs = flatten(&tree);
        let scheduler = bare_scheduler(Concurrency::Sequential, false);
        let mut results = Vec::new();
        scheduler.run(specs, |r| results.push(r)).await.unwrap();

        assert_eq!(results[0].status, crate::tree::Status::Failed);
        assert!(after_ran.load(Ordering::SeqCst));
    }
}
