//! Utility glue tying C5 (Selection & Filters) and C6 (Scheduler) to the
//! reporter boundary (spec.md §6) and to execution history (§10.7 flaky
//! detection). `cli.rs`'s `run` command and `watch.rs`'s per-batch runs both
//! go through here so the declaration-order/flaky/summary bookkeeping lives
//! in exactly one place.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Instant, SystemTime},
};

use crate::filter::{select, FilterSpec, Selection};
use crate::history::HistoryStore;
use crate::id::SpecId;
use crate::reporter::{Reporter, Summary};
use crate::scheduler::Scheduler;
use crate::tree::{SpecDefinition, SpecResult};

/// `filter::select`'s excluded-spec reasons are reported as `skipped` or
/// `pending`, per spec.md §4.C5 ("Excluded specs still appear in results
/// with the appropriate terminal status").
fn excluded_result(spec: &Arc<SpecDefinition>, reason: crate::filter::ExclusionReason) -> SpecResult {
    if matches!(reason, crate::filter::ExclusionReason::Pending) {
        SpecResult::pending(spec.id.clone())
    } else {
        SpecResult::skipped(spec.id.clone())
    }
}

/// Runs `specs` (the full declaration-ordered candidate list, pre-filtering)
/// through selection then the scheduler, streaming results to `reporter` in
/// declaration order regardless of which specs actually executed versus
/// were excluded up front - the two result sources are merged by original
/// position before reaching the reporter.
pub async fn execute(
    specs: Vec<Arc<SpecDefinition>>,
    filter: &FilterSpec,
    scheduler: &Scheduler,
    history: Option<&HistoryStore>,
    reporter: &mut dyn Reporter,
) -> anyhow::Result<Summary> {
    let total = specs.len();
    let start_time = SystemTime::now();
    let start = Instant::now();
    reporter.run_starting(total, start_time);

    let selection = select(&specs, filter);
    debug_assert_eq!(selection.len(), total);

    let mut position_of: HashMap<SpecId, usize> = HashMap::with_capacity(total);
    let mut runnable = Vec::new();
    let mut pending: HashMap<usize, SpecResult> = HashMap::new();

    for (position, sel) in selection.into_iter().enumerate() {
        match sel {
            Selection::Runnable(spec) => {
                position_of.insert(spec.id.clone(), position);
                runnable.push(spec);
            }
            Selection::Excluded(spec, reason) => {
                position_of.insert(spec.id.clone(), position);
                pending.insert(position, excluded_result(&spec, reason));
            }
        }
    }

    fn drain(
        pending: &mut HashMap<usize, SpecResult>,
        next_to_emit: &mut usize,
        summary: &mut Summary,
        reporter: &mut dyn Reporter,
    ) {
        while let Some(result) = pending.remove(next_to_emit) {
            summary.record(&result);
            reporter.spec_completed(&result);
            *next_to_emit += 1;
        }
    }

    let mut summary = Summary::default();
    let mut next_to_emit = 0usize;
    drain(&mut pending, &mut next_to_emit, &mut summary, reporter);

    scheduler
        .run(runnable, |mut result| {
            if let Some(history) = history {
                let _ = history.append(&result.id, result.status, SystemTime::now());
                result.flaky = history.is_flaky(&result.id);
            }
            let position = *position_of
                .get(&result.id)
                .expect("every scheduled spec was assigned a position during selection");
            pending.insert(position, result);
            drain(&mut pending, &mut next_to_emit, &mut summary, reporter);
        })
        .await?;

    debug_assert_eq!(next_to_emit, total, "every spec must produce exactly one result");
    let duration = start.elapsed();
    reporter.run_completed(summary, duration);
    Ok(summary)
}

/// CLI exit-code logic (spec.md §6): a run with any failing spec exits 1.
pub fn has_failures(summary: &Summary) -> bool {
    summary.failed > 0
}

/// `run`'s exit code (spec.md §6): 1 beats 2 beats 0 - a failing run is
/// always reported as a failure even if focus mode also happened to be
/// active, since that's the more actionable signal.
pub fn run_exit_code(summary: &Summary, focus_mode_active: bool, stats_only: bool) -> i32 {
    if has_failures(summary) {
        1
    } else if stats_only && focus_mode_active {
        2
    } else {
        0
    }
}
