//! Project-level settings (spec.md §10.3): default timeout, default
//! parallel degree, snapshot directory, history window, watch debounce
//! window, and default tag filters. Mirrors the teacher's `Config`/`Test`
//! shape: `serde(deny_unknown_fields)`, a generated JSON schema via
//! `schemars`, `#[serde(default = "fn")]` for every optional field, and
//! `Hash` on the nested structs.
//!
//! This is deliberately not a CLI flag parser (out of scope per spec.md §1)
//! - `src/cli.rs` builds a `FilterSpec`/`Concurrency` from a parsed `Config`
//! plus whatever flags were actually passed, with flags taking precedence.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::scheduler::Concurrency;

#[derive(Deserialize, JsonSchema, Debug, Hash, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
pub enum Parallel {
    /// `parallel = true` or `parallel = false`.
    Enabled(bool),
    /// `parallel = 4` - an explicit worker count. 0 is coerced to the host's
    /// logical CPU count, same as an explicit CLI `--parallel 0`.
    Degree(usize),
}

impl Default for Parallel {
    fn default() -> Self {
        Parallel::Enabled(false)
    }
}

impl Parallel {
    pub fn to_concurrency(&self) -> Concurrency {
        match self {
            Parallel::Enabled(false) => Concurrency::Sequential,
            Parallel::Enabled(true) => Concurrency::parallel_with_default(0),
            Parallel::Degree(n) => Concurrency::parallel_with_default(*n),
        }
    }
}

#[derive(Deserialize, JsonSchema, Debug, Hash, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TagDefaults {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TagDefaults {
    pub fn include_set(&self) -> HashSet<String> {
        self.include.iter().cloned().collect()
    }

    pub fn exclude_set(&self) -> HashSet<String> {
        self.exclude.iter().cloned().collect()
    }
}

#[derive(Deserialize, JsonSchema, Debug, Hash, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 0, delay_ms: 0 }
    }
}

#[derive(Deserialize, JsonSchema, Debug, Hash, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Default per-spec timeout. Absent ⇒ "no timeout" (spec.md §4.C6
    /// "Default policy: no timeout unless configured").
    #[serde(default)]
    pub timeout_s: Option<u64>,

    #[serde(default)]
    pub parallel: Parallel,

    #[serde(default)]
    pub bail: bool,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Relative to the project root unless absolute. `None` ⇒ each spec
    /// file's own `__snapshots__` sibling directory.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,

    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default)]
    pub tags: TagDefaults,
}

fn default_history_window() -> usize {
    crate::history::DEFAULT_WINDOW
}

fn default_debounce_ms() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_s: None,
            parallel: Parallel::default(),
            bail: false,
            retry: RetryConfig::default(),
            snapshot_dir: None,
            history_window: default_history_window(),
            debounce_ms: default_debounce_ms(),
            tags: TagDefaults::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.timeout_s.map(Duration::from_secs)
    }

    pub fn concurrency(&self) -> Concurrency {
        self.parallel.to_concurrency()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.delay_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[googletest::test]
    fn defaults_when_toml_is_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_that!(config.default_timeout(), none());
        assert_that!(config.concurrency(), matches_pattern!(Concurrency::Sequential));
    }

    #[test_case("parallel = true", Concurrency::Parallel(1000); "bool true coerces to cpu count")]
    #[test_case("parallel = false", Concurrency::Sequential; "bool false is sequential")]
    #[test_case("parallel = 4", Concurrency::Parallel(4); "explicit degree is kept")]
    #[test_case("parallel = 0", Concurrency::Parallel(1000); "explicit zero coerces to cpu count")]
    fn parallel_setting_resolves_to_concurrency(toml_snippet: &str, want: Concurrency) {
        let config: Config = toml::from_str(toml_snippet).unwrap();
        match (config.concurrency(), want) {
            (Concurrency::Sequential, Concurrency::Sequential) => {}
            (Concurrency::Parallel(got), Concurrency::Parallel(expected)) => {
                // "cpu count" cases pass a sentinel (1000) meaning "any N > 0".
                if expected == 1000 {
                    assert!(got > 0);
                } else {
                    assert_eq!(got, expected);
                }
            }
            (got, expected) => panic!("concurrency mismatch: got {got:?}, want {expected:?}"),
        }
    }

    #[googletest::test]
    fn unknown_field_is_rejected() {
        let err = toml::from_str::<Config>("bogus_field = 1").unwrap_err();
        assert_that!(err.to_string(), contains_substring("unknown field"));
    }

    #[googletest::test]
    fn tag_defaults_round_trip_into_sets() {
        let config: Config = toml::from_str(
            r#"
            [tags]
            include = ["fast"]
            exclude = ["slow", "flaky"]
            "#,
        )
        .unwrap();
        assert_eq!(config.tags.include_set(), HashSet::from(["fast".to_owned()]));
        assert_eq!(
            config.tags.exclude_set(),
            HashSet::from(["slow".to_owned(), "flaky".to_owned()])
        );
    }
}
