//! Execution history for flaky detection (spec.md §6 "`.draftspec/
//! history.json`... for flaky detection", expanded at §10.7: the file must
//! actually drive a `flaky` annotation, not just store runs inertly).
//!
//! One bounded-window (default 20) list of `{status, timestamp}` per spec
//! identity, keyed by `SpecId::digest()`. A spec is flaky when its window
//! contains both a `passed` and a `failed` run.

use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::id::SpecId;
use crate::tree::Status;

pub const DEFAULT_WINDOW: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub status: String,
    pub timestamp: i64,
}

pub fn status_str(status: Status) -> &'static str {
    match status {
        Status::Passed => "passed",
        Status::Failed => "failed",
        Status::Pending => "pending",
        Status::Skipped => "skipped",
    }
}

pub struct HistoryStore {
    path: PathBuf,
    window: usize,
    guard: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: PathBuf, window: usize) -> Self {
        Self { path, window: window.max(1), guard: Mutex::new(()) }
    }

    fn load(&self) -> HashMap<String, VecDeque<RunRecord>> {
        let Ok(raw) = fs::read_to_string(&self.path) else { return HashMap::new() };
        let flat: HashMap<String, Vec<RunRecord>> = serde_json::from_str(&raw).unwrap_or_default();
        flat.into_iter().map(|(k, v)| (k, VecDeque::from(v))).collect()
    }

    fn save(&self, all: &HashMap<String, VecDeque<RunRecord>>) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let flat: HashMap<&String, &VecDeque<RunRecord>> = all.iter().collect();
        let json = serde_json::to_string_pretty(&flat)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }

    /// Appends one run record, evicting from the front once the window is
    /// exceeded ("history append then read yields the appended record at
    /// the tail" - spec.md §8 round-trip law).
    pub fn append(&self, spec_id: &SpecId, status: Status, at: SystemTime) -> std::io::Result<()> {
        let _held = self.guard.lock();
        let mut all = self.load();
        let key = spec_id.digest();
        let records = all.entry(key).or_default();
        let timestamp = at.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
        records.push_back(RunRecord { status: status_str(status).to_owned(), timestamp });
        while records.len() > self.window {
            records.pop_front();
        }
        self.save(&all)
    }

    pub fn recent(&self, spec_id: &SpecId) -> Vec<RunRecord> {
        let _held = self.guard.lock();
        self.load().remove(&spec_id.digest()).map(|v| v.into_iter().collect()).unwrap_or_default()
    }

    /// A spec is flaky when its recorded window contains both a pass and a
    /// fail - not "most recent status differs from the one before", which
    /// would also flag a spec that was simply fixed or broken once.
    pub fn is_flaky(&self, spec_id: &SpecId) -> bool {
        let records = self.recent(spec_id);
        let has_pass = records.iter().any(|r| r.status == "passed");
        let has_fail = records.iter().any(|r| r.status == "failed");
        has_pass && has_fail
    }
}
