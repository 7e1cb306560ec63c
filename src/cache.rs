//! Shared parse/dependency cache (spec.md §5: "keyed by `(absolute_path,
//! content_hash, mtime)`; concurrent reads are safe, writes are
//! single-writer under an entry-level lock").
//!
//! Used by both the static parser and the dependency graph so that a
//! `list`/`validate`/`watch` pass over an unchanged tree never re-parses a
//! file it's already seen this process.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::id::content_hash;
use crate::parser::StaticParseResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub mtime: Option<SystemTime>,
}

impl CacheKey {
    /// Reads `path`'s current contents and metadata to build the key used
    /// to look up (or populate) a cache entry.
    pub fn read(path: &Path) -> std::io::Result<(Self, String)> {
        let absolute = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let source = fs::read_to_string(path)?;
        let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok((
            Self { absolute_path: absolute, content_hash: content_hash(source.as_bytes()), mtime },
            source,
        ))
    }
}

/// On-disk shape of a cache entry (spec.md §10.5: `.draftspec/cache/parsing/
/// <hash>.{meta,result}.json`). `meta` carries the key so a stale entry
/// (content hash changed) can be detected without re-parsing; `result` is
/// the parser's output, serialized for reuse across process runs.
#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    absolute_path: PathBuf,
    content_hash: String,
}

/// Per-file parse cache. One `ParseCache` is shared across a `list`/
/// `validate`/`watch` invocation; an in-memory map backs repeated lookups
/// within a process, an optional on-disk directory persists across runs.
pub struct ParseCache {
    dir: Option<PathBuf>,
    memory: Mutex<HashMap<PathBuf, Arc<(CacheKey, StaticParseResult)>>>,
}

impl ParseCache {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir, memory: Mutex::new(HashMap::new()) }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn entry_paths(&self, key: &CacheKey) -> Option<(PathBuf, PathBuf)> {
        let dir = self.dir.as_ref()?;
        let digest = key.content_hash.clone();
        Some((dir.join(format!("{digest}.meta.json")), dir.join(format!("{digest}.result.json"))))
    }

    /// Returns the cached parse result for `path` if its content hash
    /// still matches what's recorded, checking the in-memory map first and
    /// falling back to the on-disk cache directory.
    pub fn get(&self, path: &Path, key: &CacheKey) -> Option<StaticParseResult> {
        if let Some(cached) = self.memory.lock().get(path) {
            if &cached.0 == key {
                return Some(cached.1.clone());
            }
        }

        let (meta_path, result_path) = self.entry_paths(key)?;
        let meta_raw = fs::read_to_string(&meta_path).ok()?;
        let meta: CacheMeta = serde_json::from_str(&meta_raw).ok()?;
        if meta.absolute_path != key.absolute_path || meta.content_hash != key.content_hash {
            return None;
        }
        let result_raw = fs::read_to_string(&result_path).ok()?;
        let result: StoredResult = serde_json::from_str(&result_raw).ok()?;
        let parsed = result.into_parse_result();
        self.memory.lock().insert(path.to_path_buf(), Arc::new((key.clone(), parsed.clone())));
        Some(parsed)
    }

    /// Records a fresh parse result under `key`, in memory and (if
    /// configured) on disk. Single-writer per entry: the in-memory map's
    /// mutex serializes concurrent writers for the same path; on-disk
    /// writes go through a temp-file-then-rename so a reader never
    /// observes a half-written entry.
    pub fn put(&self, path: &Path, key: CacheKey, result: StaticParseResult) {
        self.memory.lock().insert(path.to_path_buf(), Arc::new((key.clone(), result.clone())));

        let Some((meta_path, result_path)) = self.entry_paths(&key) else { return };
        let Some(dir) = meta_path.parent() else { return };
        if fs::create_dir_all(dir).is_err() {
            return;
        }
        let meta =
            CacheMeta { absolute_path: key.absolute_path.clone(), content_hash: key.content_hash.clone() };
        let stored = StoredResult::from_parse_result(&result);
        if let (Ok(meta_json), Ok(result_json)) =
            (serde_json::to_string_pretty(&meta), serde_json::to_string_pretty(&stored))
        {
            let _ = write_atomic(&meta_path, &meta_json);
            let _ = write_atomic(&result_path, &result_json);
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// Serializable mirror of `StaticParseResult` (the parser's own types don't
/// derive `Serialize`/`Deserialize` since nothing in the live execution
/// path needs that; only the on-disk cache does).
#[derive(Serialize, Deserialize)]
struct StoredResult {
    specs: Vec<StoredSpec>,
    warnings: Vec<StoredWarning>,
    loads: Vec<StoredLoad>,
    complete: bool,
}

#[derive(Serialize, Deserialize)]
struct StoredSpec {
    description: String,
    context_path: Vec<String>,
    line: u32,
    kind: String,
    pending: bool,
}

#[derive(Serialize, Deserialize)]
struct StoredWarning {
    line: u32,
    reason: String,
}

#[derive(Serialize, Deserialize)]
struct StoredLoad {
    line: u32,
    raw_path: String,
}

impl StoredResult {
    fn from_parse_result(r: &StaticParseResult) -> Self {
        use crate::parser::SpecKind;
        Self {
            specs: r
                .specs
                .iter()
                .map(|s| StoredSpec {
                    description: s.description.clone(),
                    context_path: s.context_path.clone(),
                    line: s.line,
                    kind: match s.kind {
                        SpecKind::Regular => "regular",
                        SpecKind::Focused => "focused",
                        SpecKind::Skipped => "skipped",
                    }
                    .to_owned(),
                    pending: s.pending,
                })
                .collect(),
            warnings: r
                .warnings
                .iter()
                .map(|w| StoredWarning { line: w.line, reason: w.reason.clone() })
                .collect(),
            loads: r.loads.iter().map(|l| StoredLoad { line: l.line, raw_path: l.raw_path.clone() }).collect(),
            complete: r.complete,
        }
    }

    fn into_parse_result(self) -> StaticParseResult {
        use crate::parser::{LoadDirective, SpecKind, StaticParseWarning, StaticSpec};
        StaticParseResult {
            specs: self
                .specs
                .into_iter()
                .map(|s| StaticSpec {
                    description: s.description,
                    context_path: s.context_path,
                    line: s.line,
                    kind: match s.kind.as_str() {
                        "focused" => SpecKind::Focused,
                        "skipped" => SpecKind::Skipped,
                        _ => SpecKind::Regular,
                    },
                    pending: s.pending,
                })
                .collect(),
            warnings: self
                .warnings
                .into_iter()
                .map(|w| StaticParseWarning { line: w.line, reason: w.reason })
                .collect(),
            loads: self
                .loads
                .into_iter()
                .map(|l| LoadDirective { line: l.line, raw_path: l.raw_path })
                .collect(),
            complete: self.complete,
        }
    }
}
