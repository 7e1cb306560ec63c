//! C6 — the middleware pipeline (spec.md §4.C6 "Execution model" /
//! "Standard middlewares").
//!
//! A middleware is `(ctx, next) -> SpecResult`; middlewares compose outward
//! in registration order - the first one registered is outermost, so it
//! runs first on the way in and last on the way out. `compose` wires a
//! `Vec` of them around whatever `Next` the scheduler's base layer is.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::FailureDetail;
use crate::snapshot::SnapshotRegistry;
use crate::tree::{RetryMeta, SpecDefinition, SpecResult, Status};

/// Cross-middleware scratch space (coverage tracker handles, retry attempt
/// counts) - spec.md's "mutable, typed item-bag for cross-middleware
/// communication".
pub type Bag = Arc<Mutex<HashMap<TypeId, Box<dyn Any + Send>>>>;

pub fn new_bag() -> Bag {
    Arc::new(Mutex::new(HashMap::new()))
}

pub fn bag_insert<T: Send + 'static>(bag: &Bag, value: T) {
    bag.lock().insert(TypeId::of::<T>(), Box::new(value));
}

pub fn bag_get<T: Clone + Send + 'static>(bag: &Bag) -> Option<T> {
    bag.lock().get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref::<T>()).cloned()
}

#[derive(Clone)]
pub struct ExecContext {
    pub spec: Arc<SpecDefinition>,
    pub position: usize,
    pub cancellation: CancellationToken,
    pub bag: Bag,
}

pub type Next = Arc<dyn Fn(ExecContext) -> BoxFuture<'static, SpecResult> + Send + Sync>;

pub trait Middleware: Send + Sync {
    fn call(&self, ectx: ExecContext, next: Next) -> BoxFuture<'static, SpecResult>;
}

/// `layers[0]` ends up outermost: it sees the `ExecContext` first and
/// decides whether/how to call into `layers[1]`, down to `base`.
pub fn compose(layers: Vec<Arc<dyn Middleware>>, base: Next) -> Next {
    layers.into_iter().rev().fold(base, |inner, mw| {
        Arc::new(move |ectx: ExecContext| mw.call(ectx, inner.clone())) as Next
    })
}

/// Short-circuits to `skipped` without invoking `next` when `predicate`
/// returns false. The scheduler uses this for bail: once tripped, unclaimed
/// specs are skipped at this layer rather than entering the base layer.
pub struct FilterMiddleware {
    pub predicate: Arc<dyn Fn(&ExecContext) -> bool + Send + Sync>,
}

impl Middleware for FilterMiddleware {
    fn call(&self, ectx: ExecContext, next: Next) -> BoxFuture<'static, SpecResult> {
        let predicate = self.predicate.clone();
        Box::pin(async move {
            if predicate(&ectx) {
                next(ectx).await
            } else {
                SpecResult::skipped(ectx.spec.id.clone())
            }
        })
    }
}

/// Races `next()` against a delay. No timeout configured ⇒ pass through
/// untouched (spec.md "Default policy: no timeout unless configured").
pub struct TimeoutMiddleware {
    pub default_timeout: Option<Duration>,
}

impl Middleware for TimeoutMiddleware {
    fn call(&self, ectx: ExecContext, next: Next) -> BoxFuture<'static, SpecResult> {
        let Some(duration) = self.default_timeout else { return next(ectx) };
        Box::pin(async move {
            let cancellation = ectx.cancellation.clone();
            let spec_id = ectx.spec.id.clone();
            let start = Instant::now();
            tokio::select! {
                result = next(ectx) => result,
                _ = tokio::time::sleep(duration) => {
                    cancellation.cancel();
                    SpecResult::failed(spec_id, start.elapsed(), FailureDetail::timeout(duration))
                }
            }
        })
    }
}

/// Invokes `next()` up to `max_retries + 1` times while the result is
/// `failed`, attaching `{attempts, max_retries}` metadata to whichever
/// attempt is kept.
pub struct RetryMiddleware {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Middleware for RetryMiddleware {
    fn call(&self, ectx: ExecContext, next: Next) -> BoxFuture<'static, SpecResult> {
        let max_retries = self.max_retries;
        let delay = self.delay;
        Box::pin(async move {
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                let mut result = next(ectx.clone()).await;
                let exhausted = attempts > max_retries;
                if result.status != Status::Failed || exhausted {
                    if max_retries > 0 {
                        result.retry = Some(RetryMeta { attempts, max_retries });
                    }
                    return result;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        })
    }
}

/// Installs a `SnapshotSession` as the ambient task-local for the duration
/// of `next()` (so `snapshot::expect_matches` works inside the body) and
/// flushes any writes afterward.
pub struct SnapshotMiddleware {
    pub registry: Arc<SnapshotRegistry>,
    pub update_mode: bool,
}

impl Middleware for SnapshotMiddleware {
    fn call(&self, ectx: ExecContext, next: Next) -> BoxFuture<'static, SpecResult> {
        let registry = self.registry.clone();
        let update_mode = self.update_mode;
        Box::pin(async move {
            let session = registry.session(&ectx.spec.id.source_file, update_mode);
            let result = crate::snapshot::with_session(session.clone(), next(ectx)).await;
            let _ = registry.flush(&session);
            result
        })
    }
}

/// Source of a before/after coverage snapshot. The core takes no position
/// on how coverage is actually collected (spec.md's Non-goals exclude
/// "coverage-file parsing") - this is the seam a caller plugs a real
/// tracker into.
pub trait CoverageTracker: Send + Sync {
    fn snapshot(&self) -> serde_json::Value;
    fn delta(&self, before: &serde_json::Value, after: &serde_json::Value) -> serde_json::Value;
}

pub struct CoverageMiddleware {
    pub tracker: Arc<dyn CoverageTracker>,
}

impl Middleware for CoverageMiddleware {
    fn call(&self, ectx: ExecContext, next: Next) -> BoxFuture<'static, SpecResult> {
        let tracker = self.tracker.clone();
        Box::pin(async move {
            let before = tracker.snapshot();
            let mut result = next(ectx).await;
            let after = tracker.snapshot();
            result.coverage_delta = Some(tracker.delta(&before, &after));
            result
        })
    }
}

/// Flips to `true` the moment any spec fails under a bailing run; read by
/// the `FilterMiddleware` predicate the scheduler installs.
pub fn bail_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use crate::id::SpecId;
    use crate::tree::SpecDefinition;

    fn spec_def(name: &str) -> Arc<SpecDefinition> {
        Arc::new(SpecDefinition {
            id: SpecId::new("f.spec", vec![], name),
            parent: std::sync::Weak::new(),
            line: 1,
            body: Some(Arc::new(|| Box::pin(async { Ok(()) }))),
            focused: false,
            skipped: false,
            tags: Default::default(),
        })
    }

    fn ectx(spec: Arc<SpecDefinition>) -> ExecContext {
        ExecContext { spec, position: 0, cancellation: CancellationToken::new(), bag: new_bag() }
    }

    fn ok_base() -> Next {
        Arc::new(|ectx: ExecContext| {
            Box::pin(async move { SpecResult::passed(ectx.spec.id.clone(), StdDuration::ZERO) })
        })
    }

    fn failing_base(remaining_failures: Arc<std::sync::atomic::AtomicU32>) -> Next {
        Arc::new(move |ectx: ExecContext| {
            let remaining_failures = remaining_failures.clone();
            Box::pin(async move {
                if remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                    SpecResult::failed(
                        ectx.spec.id.clone(),
                        StdDuration::ZERO,
                        FailureDetail::new(crate::error::Kind::Assertion, "nope"),
                    )
                } else {
                    SpecResult::passed(ectx.spec.id.clone(), StdDuration::ZERO)
                }
            })
        })
    }

    #[tokio::test]
    async fn filter_middleware_skips_without_calling_next() {
        let mw = FilterMiddleware { predicate: Arc::new(|_| false) };
        let result = mw.call(ectx(spec_def("x")), ok_base()).await;
        assert_eq!(result.status, Status::Skipped);
    }

    #[tokio::test]
    async fn retry_succeeds_on_third_attempt() {
        let mw = RetryMiddleware { max_retries: 2, delay: StdDuration::ZERO };
        let base = failing_base(Arc::new(std::sync::atomic::AtomicU32::new(2)));
        let result = mw.call(ectx(spec_def("x")), base).await;
        assert_eq!(result.status, Status::Passed);
        assert_eq!(result.retry, Some(RetryMeta { attempts: 3, max_retries: 2 }));
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let mw = RetryMiddleware { max_retries: 1, delay: StdDuration::ZERO };
        let base = failing_base(Arc::new(std::sync::atomic::AtomicU32::new(99)));
        let result = mw.call(ectx(spec_def("x")), base).await;
        assert_eq!(result.status, Status::Failed);
        assert_eq!(result.retry, Some(RetryMeta { attempts: 2, max_retries: 1 }));
    }

    #[tokio::test]
    async fn timeout_wins_and_cancels() {
        let mw = TimeoutMiddleware { default_timeout: Some(StdDuration::from_millis(5)) };
        let hang_forever: Next = Arc::new(|_| Box::pin(std::future::pending()));
        let result = mw.call(ectx(spec_def("x")), hang_forever).await;
        assert_eq!(result.status, Status::Failed);
        assert_eq!(result.failure.unwrap().kind, crate::error::Kind::Timeout);
    }

    #[tokio::test]
    async fn compose_runs_outer_layer_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        struct Tag(Arc<Mutex<Vec<&'static str>>>, &'static str);
        impl Middleware for Tag {
            fn call(&self, ectx: ExecContext, next: Next) -> BoxFuture<'static, SpecResult> {
                self.0.lock().push(self.1);
                next(ectx)
            }
        }
        let layers: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(Tag(order.clone(), "outer")), Arc::new(Tag(order.clone(), "inner"))];
        let chain = compose(layers, ok_base());
        chain(ectx(spec_def("x"))).await;
        assert_eq!(*order.lock(), vec!["outer", "inner"]);
    }
}
