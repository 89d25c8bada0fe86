//! Thin demo CLI binary (§1, §6) wired on top of the `flowmgr` library:
//! loads a package tree, elaborates it into a `TaskGraph`, and runs it
//! through the scheduler. Everything of substance lives in the library;
//! this binary only parses arguments, wires ambient concerns (logging,
//! `.env`, `RunConfig`), and renders the result.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use flowmgr::event::{Marker, NoopListener, Severity};
use flowmgr::{
    BodyRegistry, Builder, CacheLayer, FixSuggestion, FlowError, Loader, MarkerLog, Overrides, Registry,
    RunConfig, Scheduler, Value,
};

#[derive(Parser)]
#[command(name = "flowmgr", version, about = "Declarative task-graph build/CI workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, elaborate, and execute a task graph rooted at `task`.
    Run {
        /// Path to the root package file.
        package: PathBuf,
        /// Fully-qualified or bare task name to run.
        task: String,
        /// Parameter override, e.g. `-s pkg.task.param=value`. Repeatable.
        #[arg(short = 's', long = "set")]
        set: Vec<String>,
        /// Directory to run tasks in. Defaults to `./.flowmgr-run`.
        #[arg(long)]
        rundir: Option<PathBuf>,
        /// Cap on concurrent tasks. Defaults to `FLOWMGR_NPROC`/host CPUs.
        #[arg(long)]
        nproc: Option<usize>,
        /// Directory used to store/restore cached task outputs.
        #[arg(long)]
        cache: Option<PathBuf>,
    },
    /// Load and elaborate a package tree without running anything.
    Validate {
        /// Path to the root package file.
        package: PathBuf,
        /// Fully-qualified or bare task name to elaborate from.
        task: String,
    },
}

fn main() {
    let _ = dotenvy::dotenv();

    let filter = std::env::var("FLOWMGR_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();
    let exit_code = run(cli);
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> i32 {
    let result = match cli.command {
        Commands::Validate { package, task } => validate(&package, &task),
        Commands::Run {
            package,
            task,
            set,
            rundir,
            nproc,
            cache,
        } => run_task(&package, &task, set, rundir, nproc, cache),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(fix) = err.fix_suggestion() {
                eprintln!("  help: {fix}");
            }
            1
        }
    }
}

/// Load, elaborate, and report markers without executing a single task.
fn validate(package: &PathBuf, task: &str) -> Result<i32, FlowError> {
    let markers = MarkerLog::new();
    let mut loader = Loader::new();
    let (arena, _root_id) = loader.load(package)?;

    let registry = Registry::new();
    let overrides = Overrides::new();
    let root_rundir = std::env::current_dir().unwrap_or_default().join(".flowmgr-run");

    let graph = Builder::new(&arena, &registry, &overrides, root_rundir, &markers).build(task)?;

    print_markers(&markers.snapshot());
    tracing::info!(nodes = graph.len(), "package tree elaborated");

    Ok(if markers.has_errors() { 1 } else { 0 })
}

fn run_task(
    package: &PathBuf,
    task: &str,
    overrides_raw: Vec<String>,
    rundir: Option<PathBuf>,
    nproc: Option<usize>,
    cache: Option<PathBuf>,
) -> Result<i32, FlowError> {
    let markers = MarkerLog::new();
    let mut loader = Loader::new();
    let (arena, _root_id) = loader.load(package)?;

    let registry = Registry::new();
    let mut overrides = Overrides::new();
    for raw in &overrides_raw {
        let Some((key, value)) = parse_override(raw) else {
            eprintln!("error: malformed override `{raw}`, expected `key=value`");
            return Ok(1);
        };
        overrides.set(key, value);
    }

    let root_rundir = rundir.unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join(".flowmgr-run"));

    let graph = Builder::new(&arena, &registry, &overrides, root_rundir.clone(), &markers).build(task)?;

    if markers.has_errors() {
        print_markers(&markers.snapshot());
        return Ok(1);
    }

    let mut bodies = BodyRegistry::new();
    flowmgr::stdlib::register(&mut bodies);

    let mut config = RunConfig::from_env(root_rundir)?;
    if let Some(nproc) = nproc {
        config = config.with_nproc(nproc);
    }
    if let Some(cache) = cache {
        config = config.with_cache_root(Some(cache));
    }

    let cache_layer = config.cache_root.clone().map(CacheLayer::local).map(Arc::new);

    let scheduler = Scheduler::new(
        Arc::new(arena),
        Arc::new(bodies),
        cache_layer,
        config,
        Arc::new(markers),
        Arc::new(NoopListener),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(FlowError::Io)?;
    let outcome = runtime.block_on(scheduler.run(graph))?;

    print_markers(&outcome.markers());
    Ok(outcome.final_status())
}

fn print_markers(markers: &[Marker]) {
    for marker in markers {
        let severity = match marker.severity {
            Severity::Error => "error".red().bold(),
            Severity::Warn => "warn".yellow().bold(),
            Severity::Info => "info".blue(),
        };
        match &marker.loc {
            Some(loc) => eprintln!(
                "{severity}: [{}] {} ({}:{}:{})",
                marker.kind, marker.msg, loc.file, loc.line, loc.column
            ),
            None => eprintln!("{severity}: [{}] {}", marker.kind, marker.msg),
        }
    }
}

/// Parse a `key=value` CLI override. The value is parsed as a
/// bool/int/float when it unambiguously looks like one, else kept as a
/// string (mirrors the loader's own scalar coercion of raw YAML values).
fn parse_override(raw: &str) -> Option<(String, Value)> {
    let (key, value) = raw.split_once('=')?;
    let value = if let Ok(b) = value.parse::<bool>() {
        Value::from(b)
    } else if let Ok(i) = value.parse::<i64>() {
        Value::from(i)
    } else if let Ok(f) = value.parse::<f64>() {
        Value::from(f)
    } else {
        Value::from(value)
    };
    Some((key.to_string(), value))
}
