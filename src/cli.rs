//! CLI argument grammar (spec.md §6, §10.4). Thin by design: this module
//! only defines the six commands' flags; `main.rs` turns them into a
//! `Config`/`FilterSpec` and calls into the library crate. Mirrors
//! `chant`'s `cli.rs`/`main.rs` split - the teacher itself ships as a
//! library with no bundled CLI, so the shape of the argument grammar is
//! grounded on the other example repo that does.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "draftspec")]
#[command(version)]
#[command(about = "A behavior-driven spec runner", long_about = None)]
pub struct Cli {
    /// Path to a config file. Defaults to `draftspec.toml` in the current
    /// directory if present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute specs.
    Run {
        /// Spec file or directory to run. Defaults to the current directory.
        path: Option<PathBuf>,
        /// Only run specs carrying one of these tags.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Exclude specs carrying one of these tags.
        #[arg(long = "exclude-tag")]
        exclude_tags: Vec<String>,
        /// Only run specs whose display name matches this regex.
        #[arg(long)]
        name: Option<String>,
        /// Exclude specs whose display name matches this regex.
        #[arg(long)]
        exclude_name: Option<String>,
        /// Run specs concurrently. A bare `--parallel` means one worker
        /// per logical CPU; `--parallel 4` pins the worker count.
        #[arg(long, num_args = 0..=1, default_missing_value = "0")]
        parallel: Option<usize>,
        /// Stop scheduling new specs after the first failure.
        #[arg(long)]
        bail: bool,
        /// Bypass the incremental parse cache for this run.
        #[arg(long)]
        no_cache: bool,
        /// Print only the summary line, not per-spec output.
        #[arg(long)]
        stats_only: bool,
    },
    /// Enumerate specs via the static parser, without executing them.
    List {
        path: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "tree")]
        format: ListFormat,
    },
    /// Statically parse spec files and report warnings/errors.
    Validate {
        /// Files to validate. Defaults to every `.spec` file under the
        /// current directory when empty.
        files: Vec<PathBuf>,
        /// Treat warnings as failures (exit code 2).
        #[arg(long)]
        strict: bool,
        /// Suppress the per-warning detail lines.
        #[arg(long)]
        quiet: bool,
    },
    /// Watch the spec root and re-run affected specs on change.
    Watch {
        path: Option<PathBuf>,
        /// Only re-evaluate specs affected by the changed files (via the
        /// dependency graph) instead of the whole suite.
        #[arg(long)]
        incremental: bool,
        /// Source directory whose files may declare namespaces specs use.
        #[arg(long)]
        source_root: Option<PathBuf>,
    },
    /// Create a new spec file from a template.
    New {
        /// Name of the new spec, e.g. `widgets` creates `widgets.spec`.
        name: String,
    },
    /// Scaffold a `spec_helper` file in the current directory.
    Init,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ListFormat {
    Tree,
    Flat,
    Json,
}
