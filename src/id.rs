use std::path::{Path, PathBuf};

use serde::Serialize;
use sha3::{Digest, Sha3_256};

/// Identity of a spec, stable across runs: `(source_file, context_path,
/// description)` per spec.md §3. Two specs with this triple equal are the
/// "same spec" for history/flaky tracking and for watch-mode result
/// matching, even if the tree around them changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SpecId {
    pub source_file: PathBuf,
    pub context_path: Vec<String>,
    pub description: String,
}

impl SpecId {
    pub fn new(
        source_file: impl Into<PathBuf>,
        context_path: Vec<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            source_file: source_file.into(),
            context_path,
            description: description.into(),
        }
    }

    /// Context descriptions joined by " > " then " > " + description, per
    /// the name-rule definition in spec.md §4.C5.
    pub fn display_name(&self) -> String {
        let mut parts = self.context_path.clone();
        parts.push(self.description.clone());
        parts.join(" > ")
    }

    /// Stable digest, used as the key for history records and cache
    /// entries. Hex-encoded SHA3-256, same style as the teacher's
    /// `config_hash` in config.rs.
    pub fn digest(&self) -> String {
        let mut hasher = Sha3_256::new();
        hasher.update(self.source_file.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        for seg in &self.context_path {
            hasher.update(seg.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.description.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Content hash used as part of the parsing/dependency cache key, per
/// spec.md §5: "keyed by (absolute_path, content_hash, mtime)".
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn canonicalize_best_effort(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
