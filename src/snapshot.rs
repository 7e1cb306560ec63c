//! Snapshot comparison (spec.md §6 "On-disk state: Snapshots", §4.C6
//! "Snapshot" middleware, §10.7 update mode).
//!
//! One JSON file per spec source file, `__snapshots__/<stem>.snap.json`,
//! a flat sanitized-key → value map. A `SnapshotSession` is installed as a
//! task-local for the duration of one spec body (mirrors the `LetScope`
//! task-local in `registrar.rs`) so spec bodies can call `expect_matches`
//! without threading anything through the DSL surface.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{FailureDetail, Kind};
use crate::util::sanitize_path_component;

pub const UPDATE_ENV_VAR: &str = "DRAFTSPEC_UPDATE_SNAPSHOTS";

pub fn update_mode_from_env() -> bool {
    std::env::var(UPDATE_ENV_VAR).is_ok_and(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

fn snapshot_file_for(source_file: &Path, snapshot_dir: Option<&Path>) -> PathBuf {
    let stem = source_file.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let dir = match snapshot_dir {
        Some(d) => d.to_path_buf(),
        None => source_file.parent().unwrap_or_else(|| Path::new(".")).join("__snapshots__"),
    };
    dir.join(format!("{stem}.snap.json"))
}

fn load(path: &Path) -> BTreeMap<String, Value> {
    fs::read_to_string(path).ok().and_then(|raw| serde_json::from_str(&raw).ok()).unwrap_or_default()
}

fn save(path: &Path, store: &BTreeMap<String, Value>) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(store).expect("BTreeMap<String, Value> always serializes");
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

/// Shared across a whole run: caches one loaded store per snapshot file so
/// concurrent specs in the same file see each other's writes immediately.
#[derive(Default)]
pub struct SnapshotRegistry {
    snapshot_dir: Option<PathBuf>,
    stores: Mutex<std::collections::HashMap<PathBuf, Arc<Mutex<BTreeMap<String, Value>>>>>,
}

impl SnapshotRegistry {
    pub fn new(snapshot_dir: Option<PathBuf>) -> Self {
        Self { snapshot_dir, stores: Mutex::new(std::collections::HashMap::new()) }
    }

    fn store_for(&self, source_file: &Path) -> (PathBuf, Arc<Mutex<BTreeMap<String, Value>>>) {
        let path = snapshot_file_for(source_file, self.snapshot_dir.as_deref());
        let mut stores = self.stores.lock();
        let store = stores.entry(path.clone()).or_insert_with(|| Arc::new(Mutex::new(load(&path)))).clone();
        (path, store)
    }

    pub fn session(&self, source_file: &Path, update_mode: bool) -> SnapshotSession {
        let (path, store) = self.store_for(source_file);
        SnapshotSession { path, store, update_mode, dirty: Arc::new(AtomicBool::new(false)) }
    }

    /// Persists a session's store to disk if `expect_matches` recorded any
    /// new or rewritten entries since it was created.
    pub fn flush(&self, session: &SnapshotSession) -> std::io::Result<()> {
        if session.dirty.load(Ordering::SeqCst) {
            save(&session.path, &session.store.lock())?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SnapshotSession {
    path: PathBuf,
    store: Arc<Mutex<BTreeMap<String, Value>>>,
    update_mode: bool,
    dirty: Arc<AtomicBool>,
}

impl SnapshotSession {
    pub fn check(&self, key: &str, actual: impl Serialize) -> Result<(), FailureDetail> {
        let value = serde_json::to_value(actual)
            .map_err(|e| FailureDetail::new(Kind::Runtime, format!("snapshot value not serializable: {e}")))?;
        let sanitized = sanitize_path_component(key);
        let mut store = self.store.lock();
        match store.get(&sanitized) {
            Some(existing) if *existing == value => Ok(()),
            Some(existing) if self.update_mode => {
                let _ = existing;
                store.insert(sanitized, value);
                self.dirty.store(true, Ordering::SeqCst);
                Ok(())
            }
            Some(existing) => Err(FailureDetail::mismatch(
                Kind::Assertion,
                format!("snapshot {key:?} mismatch"),
                existing.to_string(),
                value.to_string(),
            )),
            None => {
                store.insert(sanitized, value);
                self.dirty.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

tokio::task_local! {
    static CURRENT_SNAPSHOT: SnapshotSession;
}

pub async fn with_session<Fut: std::future::Future>(session: SnapshotSession, fut: Fut) -> Fut::Output {
    CURRENT_SNAPSHOT.scope(session, fut).await
}

/// Called from a spec body: compares `actual` against the stored snapshot
/// for `key`, recording a mismatch (or, in update mode, rewriting it).
pub fn expect_matches(key: &str, actual: impl Serialize) -> Result<(), FailureDetail> {
    let session = CURRENT_SNAPSHOT
        .try_with(|s| s.clone())
        .map_err(|_| FailureDetail::new(Kind::InvalidLifecycle, "expect_matches called outside a spec body"))?;
    session.check(key, actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_seeds_the_store_and_marks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SnapshotRegistry::new(Some(dir.path().to_path_buf()));
        let session = registry.session(Path::new("a.spec"), false);
        session.check("greeting", "hello").unwrap();
        registry.flush(&session).unwrap();

        let path = snapshot_file_for(Path::new("a.spec"), Some(dir.path()));
        let stored = load(&path);
        assert_eq!(stored.get("greeting").unwrap(), &Value::String("hello".to_owned()));
    }

    #[test]
    fn mismatch_without_update_mode_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SnapshotRegistry::new(Some(dir.path().to_path_buf()));
        let session = registry.session(Path::new("a.spec"), false);
        session.check("greeting", "hello").unwrap();

        let second = registry.session(Path::new("a.spec"), false);
        let err = second.check("greeting", "goodbye").unwrap_err();
        assert_eq!(err.kind, Kind::Assertion);
        assert_eq!(err.expected.as_deref(), Some("\"hello\""));
        assert_eq!(err.actual.as_deref(), Some("\"goodbye\""));
    }

    #[test]
    fn update_mode_rewrites_and_passes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SnapshotRegistry::new(Some(dir.path().to_path_buf()));
        let session = registry.session(Path::new("a.spec"), false);
        session.check("greeting", "hello").unwrap();

        let updater = registry.session(Path::new("a.spec"), true);
        updater.check("greeting", "goodbye").unwrap();
        registry.flush(&updater).unwrap();

        let path = snapshot_file_for(Path::new("a.spec"), Some(dir.path()));
        let stored = load(&path);
        assert_eq!(stored.get("greeting").unwrap(), &Value::String("goodbye".to_owned()));
    }
}
