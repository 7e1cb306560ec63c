//! Binary entry point (spec.md §10.4). Parses `cli::Cli`, initializes
//! logging, and dispatches to the handlers below. The library crate
//! (`draftspec`) never touches stdout/stderr or a logger itself - only this
//! binary does (spec.md §10.1 "library code never initializes a logger
//! itself").

mod cli;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use log::error;

use draftspec::{
    cache::{CacheKey, ParseCache},
    config::Config,
    depgraph::DependencyGraph,
    error::Kind,
    filter::FilterSpec,
    history::HistoryStore,
    middleware::{self, RetryMiddleware, SnapshotMiddleware, TimeoutMiddleware},
    parser::{self, StaticParseResult},
    reporter::ConsoleReporter,
    runner,
    scheduler::Scheduler,
    snapshot::{update_mode_from_env, SnapshotRegistry},
    tree::SpecContext,
    watch::{self, WatchOptions},
    Evaluator,
};

use cli::{Cli, Commands, ListFormat};

/// The script evaluator boundary (spec.md §6) is an external collaborator:
/// the core depends on one, but doesn't ship a script language runtime.
/// This binary links none, so `run`/`watch` fail fast with a
/// `Configuration` error rather than silently doing nothing - a real
/// deployment embeds `draftspec` as a library alongside its own
/// `Evaluator` (e.g. `registrar::declare` for Rust-embedded spec files).
struct UnconfiguredEvaluator;

impl Evaluator for UnconfiguredEvaluator {
    fn evaluate(&self, path: &Path) -> Result<Arc<SpecContext>, Kind> {
        Err(Kind::Configuration(format!(
            "no script evaluator linked into this binary; cannot evaluate {}",
            path.display()
        )))
    }
}

fn main() -> Result<()> {
    flexi_logger::Logger::try_with_env_or_str("info")
        .context("configuring logger")?
        .start()
        .context("starting logger")?;

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let code = runtime.block_on(dispatch(cli))?;
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            path,
            tags,
            exclude_tags,
            name,
            exclude_name,
            parallel,
            bail,
            no_cache,
            stats_only,
        } => {
            run_command(
                config,
                path.unwrap_or_else(|| PathBuf::from(".")),
                tags,
                exclude_tags,
                name,
                exclude_name,
                parallel,
                bail,
                no_cache,
                stats_only,
            )
            .await
        }
        Commands::List { path, format } => list_command(path.unwrap_or_else(|| PathBuf::from(".")), format),
        Commands::Validate { files, strict, quiet } => validate_command(files, strict, quiet),
        Commands::Watch { path, incremental, source_root } => {
            watch_command(config, path.unwrap_or_else(|| PathBuf::from(".")), incremental, source_root).await
        }
        Commands::New { name } => new_command(&name),
        Commands::Init => init_command(),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("draftspec.toml"));
    if path.exists() {
        Config::load(&path)
    } else {
        Ok(Config::default())
    }
}

fn build_filter(
    tags: Vec<String>,
    exclude_tags: Vec<String>,
    name: Option<String>,
    exclude_name: Option<String>,
    defaults: &Config,
) -> Result<FilterSpec> {
    let mut include_tags: std::collections::HashSet<String> = tags.into_iter().collect();
    let mut exclude_tags: std::collections::HashSet<String> = exclude_tags.into_iter().collect();
    include_tags.extend(defaults.tags.include_set());
    exclude_tags.extend(defaults.tags.exclude_set());

    Ok(FilterSpec {
        include_tags,
        exclude_tags,
        name_regex: name.map(|p| regex::Regex::new(&p)).transpose().context("compiling --name")?,
        exclude_name_regex: exclude_name
            .map(|p| regex::Regex::new(&p))
            .transpose()
            .context("compiling --exclude-name")?,
        ..FilterSpec::default()
    })
}

fn build_scheduler(config: &Config, parallel: Option<usize>, bail: bool, snapshot_dir: Option<PathBuf>) -> Scheduler {
    let concurrency = match parallel {
        Some(n) => draftspec::scheduler::Concurrency::parallel_with_default(n),
        None => config.concurrency(),
    };
    let registry = Arc::new(SnapshotRegistry::new(snapshot_dir.or_else(|| config.snapshot_dir.clone())));
    let layers: Vec<Arc<dyn middleware::Middleware>> = vec![
        Arc::new(TimeoutMiddleware { default_timeout: config.default_timeout() }),
        Arc::new(RetryMiddleware { max_retries: config.retry.max_retries, delay: config.retry_delay() }),
        Arc::new(SnapshotMiddleware { registry, update_mode: update_mode_from_env() }),
    ];
    Scheduler { layers, concurrency, bail: bail || config.bail }
}

fn all_spec_files(root: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        let mut entries: Vec<_> = entries.flatten().collect();
        entries.sort_by_key(|e| e.path());
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, out);
            } else if path.extension().is_some_and(|e| e == "spec") {
                out.push(path);
            }
        }
    }
    let mut out = Vec::new();
    if root.is_dir() {
        walk(root, &mut out);
    } else {
        out.push(root.to_path_buf());
    }
    out
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    config: Config,
    path: PathBuf,
    tags: Vec<String>,
    exclude_tags: Vec<String>,
    name: Option<String>,
    exclude_name: Option<String>,
    parallel: Option<usize>,
    bail: bool,
    no_cache: bool,
    stats_only: bool,
) -> Result<i32> {
    let evaluator = UnconfiguredEvaluator;
    let targets = all_spec_files(&path);

    // Pre-flight: parse every target before evaluating it, so a malformed
    // spec file is reported as a parse error rather than surfacing through
    // whatever the evaluator does with bad input. `--no-cache` forces this
    // to reparse from source instead of consulting the on-disk parse cache
    // that `list`/`validate` warm (spec.md §6, §10.5).
    let cache = (!no_cache).then(|| ParseCache::new(Some(PathBuf::from(".draftspec/cache/parsing"))));
    for file in &targets {
        parse_cached(cache.as_ref(), file).with_context(|| format!("parsing {}", file.display()))?;
    }

    let mut specs = Vec::new();
    for file in &targets {
        match evaluator.evaluate(file) {
            Ok(ctx) => specs.extend(draftspec::tree::flatten(&ctx)),
            Err(err) => return Err(anyhow::anyhow!(err.to_string())).context("no specs could be evaluated"),
        }
    }

    let filter = build_filter(tags, exclude_tags, name, exclude_name, &config)?;
    let scheduler = build_scheduler(&config, parallel, bail, None);
    let history = HistoryStore::new(PathBuf::from(".draftspec/history.json"), config.history_window);
    let mut reporter = ConsoleReporter::new(std::io::stdout());

    let focus_mode_active = specs.iter().any(|s| s.focused);
    let summary = draftspec::runner::execute(specs, &filter, &scheduler, Some(&history), &mut reporter).await?;
    Ok(runner::run_exit_code(&summary, focus_mode_active, stats_only))
}

/// Parses `file` through `cache`, so a second `list`/`validate`/`run` pass
/// over an unchanged file skips the scanner entirely (spec.md §5, §10.5).
/// `cache: None` (i.e. `--no-cache`) always reparses from source and never
/// touches the on-disk cache.
fn parse_cached(cache: Option<&ParseCache>, file: &Path) -> Result<StaticParseResult> {
    let (key, source) = CacheKey::read(file).with_context(|| format!("reading {}", file.display()))?;
    let Some(cache) = cache else {
        return parser::parse(file, &source);
    };
    if let Some(cached) = cache.get(file, &key) {
        return Ok(cached);
    }
    let result = parser::parse(file, &source)?;
    cache.put(file, key, result.clone());
    Ok(result)
}

fn list_command(path: PathBuf, format: ListFormat) -> Result<i32> {
    let files = all_spec_files(&path);
    let cache = ParseCache::new(Some(PathBuf::from(".draftspec/cache/parsing")));
    let mut any_error = false;
    let mut all_specs = Vec::new();
    for file in &files {
        match parse_cached(Some(&cache), file) {
            Ok(result) => all_specs.push((file.clone(), result)),
            Err(err) => {
                error!("{}: {}", file.display(), err);
                any_error = true;
            }
        }
    }

    match format {
        ListFormat::Json => {
            let json: Vec<_> = all_specs
                .iter()
                .map(|(file, result)| {
                    serde_json::json!({
                        "file": file.display().to_string(),
                        "specs": result.specs.iter().map(|s| serde_json::json!({
                            "description": s.description,
                            "context_path": s.context_path,
                            "line": s.line,
                            "pending": s.pending,
                        })).collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        ListFormat::Flat => {
            for (file, result) in &all_specs {
                for spec in &result.specs {
                    let mut parts = spec.context_path.clone();
                    parts.push(spec.description.clone());
                    println!("{}: {}", file.display(), parts.join(" > "));
                }
            }
        }
        ListFormat::Tree => {
            for (file, result) in &all_specs {
                println!("{}", file.display());
                for spec in &result.specs {
                    let indent = "  ".repeat(spec.context_path.len() + 1);
                    println!("{indent}{}", spec.description);
                }
            }
        }
    }

    Ok(if any_error { 1 } else { 0 })
}

fn validate_command(files: Vec<PathBuf>, strict: bool, quiet: bool) -> Result<i32> {
    let files = if files.is_empty() { all_spec_files(Path::new(".")) } else { files };
    let cache = ParseCache::new(Some(PathBuf::from(".draftspec/cache/parsing")));
    let mut warnings_present = false;
    let mut fatal = false;

    for file in &files {
        match parse_cached(Some(&cache), file) {
            Ok(result) => {
                if !result.warnings.is_empty() {
                    warnings_present = true;
                    if !quiet {
                        for warning in &result.warnings {
                            println!("{}:{}: warning: {}", file.display(), warning.line, warning.reason);
                        }
                    }
                }
            }
            Err(err) => {
                println!("{}: error: {}", file.display(), err);
                fatal = true;
            }
        }
    }

    Ok(if fatal {
        1
    } else if strict && warnings_present {
        2
    } else {
        0
    })
}

async fn watch_command(config: Config, path: PathBuf, incremental: bool, source_root: Option<PathBuf>) -> Result<i32> {
    let evaluator = Arc::new(UnconfiguredEvaluator);
    let filter = FilterSpec::default();
    let scheduler = build_scheduler(&config, None, config.bail, None);
    let history = Some(HistoryStore::new(PathBuf::from(".draftspec/history.json"), config.history_window));
    let mut reporter = ConsoleReporter::new(std::io::stdout());
    let (_tx, restart_rx) = tokio::sync::mpsc::unbounded_channel();

    let options = WatchOptions {
        spec_root: path,
        source_root,
        incremental,
        debounce: config.debounce(),
    };
    watch::run(options, evaluator, filter, scheduler, history, &mut reporter, restart_rx).await?;
    Ok(0)
}

fn new_command(name: &str) -> Result<i32> {
    let path = PathBuf::from(format!("{name}.spec"));
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let template = format!(
        "describe(\"{name}\", {{\n    it(\"does something\", {{\n        // assert(...);\n    }});\n}});\n"
    );
    std::fs::write(&path, template).with_context(|| format!("writing {}", path.display()))?;
    println!("created {}", path.display());
    Ok(0)
}

fn init_command() -> Result<i32> {
    let path = PathBuf::from("spec_helper.spec");
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    std::fs::write(
        &path,
        "// Loaded by every spec file that adds `#load \"spec_helper.spec\"` at the top.\n\
         // Shared fixtures and tag defaults for this project live here.\n",
    )
    .with_context(|| format!("writing {}", path.display()))?;
    println!("created {}", path.display());

    let graph = DependencyGraph::build(Path::new("."), None);
    if graph.is_err() {
        error!("scanning current directory for existing spec files failed");
    }
    Ok(0)
}
