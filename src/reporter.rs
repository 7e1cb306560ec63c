//! The reporter boundary (spec.md §6 "Reporter boundary"): `run_starting`,
//! `spec_completed` streamed in declaration order, `run_completed` with a
//! summary. The scheduler owns calling these; this module only defines the
//! trait plus one concrete implementation.

use std::io::Write;
use std::time::{Duration, SystemTime};

use colored::Colorize;

use crate::tree::{SpecResult, Status};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
    pub skipped: usize,
    pub flaky: usize,
}

impl Summary {
    pub fn record(&mut self, result: &SpecResult) {
        self.total += 1;
        match result.status {
            Status::Passed => self.passed += 1,
            Status::Failed => self.failed += 1,
            Status::Pending => self.pending += 1,
            Status::Skipped => self.skipped += 1,
        }
        if result.flaky {
            self.flaky += 1;
        }
    }
}

pub trait Reporter: Send {
    fn run_starting(&mut self, total_specs: usize, start_time: SystemTime);
    fn spec_completed(&mut self, result: &SpecResult);
    fn run_completed(&mut self, summary: Summary, duration: Duration);
}

/// Line-at-a-time console reporter: one line per completed spec, then a
/// summary line. Grounded on the shape of the teacher's `Tracker` (a
/// stateful accumulator fed one notification at a time) with the git-graph
/// rendering dropped, since there's no commit DAG here.
pub struct ConsoleReporter<W: Write + Send> {
    output: W,
    start: Option<SystemTime>,
}

impl<W: Write + Send> ConsoleReporter<W> {
    pub fn new(output: W) -> Self {
        Self { output, start: None }
    }

    fn write_line(&mut self, result: &SpecResult) {
        let name = result.id.display_name();
        let line = match result.status {
            Status::Passed => format!("{} {}", "✓".green(), name),
            Status::Failed => {
                let detail = result.failure.as_ref().map(|f| f.to_string()).unwrap_or_default();
                format!("{} {}\n    {}", "✗".red(), name, detail.red())
            }
            Status::Pending => format!("{} {}", "-".yellow(), name.yellow()),
            Status::Skipped => format!("{} {}", "-".dimmed(), name.dimmed()),
        };
        let flaky_tag = if result.flaky { " (flaky)".yellow().to_string() } else { String::new() };
        let _ = writeln!(&mut self.output, "{line}{flaky_tag}");
    }
}

impl<W: Write + Send> Reporter for ConsoleReporter<W> {
    fn run_starting(&mut self, total_specs: usize, start_time: SystemTime) {
        self.start = Some(start_time);
        let _ = writeln!(&mut self.output, "running {total_specs} specs");
    }

    fn spec_completed(&mut self, result: &SpecResult) {
        self.write_line(result);
    }

    fn run_completed(&mut self, summary: Summary, duration: Duration) {
        let line = format!(
            "{} passed, {} failed, {} pending, {} skipped in {:.2}s",
            summary.passed,
            summary.failed,
            summary.pending,
            summary.skipped,
            duration.as_secs_f64()
        );
        let colored_line = if summary.failed > 0 { line.red().to_string() } else { line.green().to_string() };
        let _ = writeln!(&mut self.output, "{colored_line}");
    }
}

/// Fans results out to every reporter in the list. `spec.md`'s `run`
/// command takes a "reporters list" - this is the multiplexer that lets the
/// scheduler treat it as a single `Reporter`.
pub struct BroadcastReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl BroadcastReporter {
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for BroadcastReporter {
    fn run_starting(&mut self, total_specs: usize, start_time: SystemTime) {
        for r in &mut self.reporters {
            r.run_starting(total_specs, start_time);
        }
    }

    fn spec_completed(&mut self, result: &SpecResult) {
        for r in &mut self.reporters {
            r.spec_completed(result);
        }
    }

    fn run_completed(&mut self, summary: Summary, duration: Duration) {
        for r in &mut self.reporters {
            r.run_completed(summary, duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SpecId;
    use std::time::Duration as StdDuration;

    fn result(status: Status) -> SpecResult {
        match status {
            Status::Passed => SpecResult::passed(SpecId::new("f", vec![], "x"), StdDuration::ZERO),
            Status::Failed => SpecResult::failed(
                SpecId::new("f", vec![], "x"),
                StdDuration::ZERO,
                crate::error::FailureDetail::new(crate::error::Kind::Assertion, "nope"),
            ),
            Status::Pending => SpecResult::pending(SpecId::new("f", vec![], "x")),
            Status::Skipped => SpecResult::skipped(SpecId::new("f", vec![], "x")),
        }
    }

    #[test]
    fn summary_counts_each_terminal_status_once() {
        let mut summary = Summary::default();
        summary.record(&result(Status::Passed));
        summary.record(&result(Status::Failed));
        summary.record(&result(Status::Pending));
        summary.record(&result(Status::Skipped));
        assert_eq!(summary, Summary { total: 4, passed: 1, failed: 1, pending: 1, skipped: 1, flaky: 0 });
    }

    #[test]
    fn summary_tracks_flaky_separately_from_terminal_status() {
        let mut summary = Summary::default();
        let mut flaky_pass = result(Status::Passed);
        flaky_pass.flaky = true;
        summary.record(&flaky_pass);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.flaky, 1);
    }

    #[test]
    fn console_reporter_writes_one_line_per_result_plus_a_summary() {
        colored::control::SHOULD_COLORIZE.set_override(false);
        let mut buf = Vec::new();
        {
            let mut reporter = ConsoleReporter::new(&mut buf);
            reporter.run_starting(2, SystemTime::now());
            reporter.spec_completed(&result(Status::Passed));
            reporter.spec_completed(&result(Status::Failed));
            let mut summary = Summary::default();
            summary.record(&result(Status::Passed));
            summary.record(&result(Status::Failed));
            reporter.run_completed(summary, StdDuration::from_millis(5));
        }
        colored::control::SHOULD_COLORIZE.unset_override();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("running 2 specs"));
        assert!(out.contains("1 passed, 1 failed"));
    }

    #[test]
    fn broadcast_reporter_forwards_to_every_child() {
        struct CountingReporter(std::sync::Arc<std::sync::atomic::AtomicUsize>);
        impl Reporter for CountingReporter {
            fn run_starting(&mut self, _: usize, _: SystemTime) {}
            fn spec_completed(&mut self, _: &SpecResult) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            fn run_completed(&mut self, _: Summary, _: Duration) {}
        }
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut broadcast = BroadcastReporter::new(vec![
            Box::new(CountingReporter(count.clone())),
            Box::new(CountingReporter(count.clone())),
        ]);
        broadcast.spec_completed(&result(Status::Passed));
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
