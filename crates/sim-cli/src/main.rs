use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use sim_analysis::{AnalysisReport, AnalyzerRegistry, RenderMode, RenderStatus};
use sim_backend::CancelTarget;
use sim_core::{AnalyzerBinding, Experiment, Location, SetupConfig};
use sim_runner::{
    analyze_experiments, format_status, monitor_for, select_experiment, select_experiments, watch,
    DaemonHandle, ExperimentManager, Overseer, OverseerMode, Services, StatusSnapshot,
};
use sim_store::ExperimentFilter;
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod sweep_file;

use sweep_file::SweepFile;

#[derive(Parser)]
#[command(name = "simtools", version, about = "Simulation experiment orchestration")]
struct Cli {
    /// Setup file with one named block per execution environment.
    #[arg(long, global = true, default_value = "simtools.yaml")]
    config: PathBuf,
    #[arg(long, global = true)]
    block: Option<String>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LocationArg {
    #[value(name = "local")]
    Local,
    #[value(name = "remote")]
    Remote,
}

impl From<LocationArg> for Location {
    fn from(value: LocationArg) -> Self {
        match value {
            LocationArg::Local => Location::Local,
            LocationArg::Remote => Location::Remote,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create an experiment from a sweep file and start it.
    Run {
        sweep: PathBuf,
        #[arg(long)]
        blocking: bool,
        #[arg(long)]
        quiet: bool,
    },
    Status {
        experiment: Option<String>,
        #[arg(long)]
        active: bool,
        #[arg(long)]
        repeat: bool,
    },
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_enum)]
        location: Option<LocationArg>,
    },
    Cancel {
        experiment: Option<String>,
        #[arg(long = "sim-ids", num_args = 1..)]
        sim_ids: Vec<String>,
        #[arg(long)]
        yes: bool,
    },
    /// Cancel every active experiment matching the query.
    Exterminate {
        experiment: Option<String>,
        #[arg(long)]
        yes: bool,
    },
    Delete {
        experiment: Option<String>,
        #[arg(long)]
        hard: bool,
        #[arg(long)]
        yes: bool,
    },
    /// Hard-delete matching experiments created from this directory.
    Clean {
        experiment: Option<String>,
        #[arg(long)]
        yes: bool,
    },
    Analyze {
        experiment: Option<String>,
        #[arg(long)]
        recent: bool,
        /// name or name:version; replaces the experiment's own analyzers.
        #[arg(long = "analyzer")]
        analyzers: Vec<String>,
        /// JSON arguments passed to every --analyzer.
        #[arg(long)]
        args: Option<String>,
    },
    AnalyzeList,
    Overseer {
        #[arg(long)]
        service: bool,
    },
    #[command(hide = true)]
    RenderWorker,
}

fn main() {
    let cli = Cli::parse();
    let json_mode = cli.json;
    match run_command(cli) {
        Ok(Some(payload)) => emit_json(&payload),
        Ok(None) => {}
        Err(err) => {
            let (code, exit_code, details) = classify(&err);
            if json_mode {
                emit_json(&json_error(code, format!("{:#}", err), details));
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(exit_code);
        }
    }
}

fn classify(err: &anyhow::Error) -> (&'static str, i32, Value) {
    match err.chain().find_map(|e| e.downcast_ref::<sim_core::Error>()) {
        Some(sim_core::Error::Ambiguous { candidates, .. }) => {
            ("ambiguous", 3, json!({"candidates": candidates}))
        }
        Some(e) => (e.code(), e.exit_code(), json!({})),
        None => ("command_failed", 1, json!({})),
    }
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let json = cli.json;
    match cli.command {
        Commands::RenderWorker => {
            init_logging(None)?;
            let registry = AnalyzerRegistry::with_builtins();
            sim_analysis::serve_render_request(&registry, io::stdin().lock())?;
            return Ok(None);
        }
        Commands::AnalyzeList => {
            let entries = AnalyzerRegistry::with_builtins().list();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "analyze-list",
                    "analyzers": entries.iter().map(|e| json!({
                        "name": e.name,
                        "version": e.version,
                        "description": e.description,
                    })).collect::<Vec<_>>(),
                })));
            }
            for e in entries {
                println!("{} v{}  {}", e.name, e.version, e.description);
            }
            return Ok(None);
        }
        _ => {}
    }

    let services = open_services(&cli.config, cli.block.as_deref())?;
    let overseer_log = match &cli.command {
        Commands::Overseer { .. } => Some(services.settings.overseer_log_path()),
        _ => None,
    };
    init_logging(overseer_log.as_deref())?;

    match cli.command {
        Commands::Run {
            sweep,
            blocking,
            quiet,
        } => {
            let file = SweepFile::load(&sweep)?;
            let jobs = file.to_sweep()?;
            let mut manager = ExperimentManager::create(&services, file.new_experiment())?;
            let exp = manager.experiment().clone();
            let daemon = DaemonHandle::new(&services)?;
            // Local simulations are launched by the overseer so that one
            // process owns every worker and the slot ceiling.
            let created = match exp.location {
                Location::Local => manager
                    .create_simulations(&jobs, |_| daemon.ensure_running().map(|_| ()))?,
                Location::Remote => {
                    let created = manager.create_and_commission(&jobs)?;
                    daemon.ensure_running()?;
                    created
                }
            };
            if !json && !quiet {
                println!("experiment: {}", exp);
                println!("simulations: {}", created);
                println!("directory: {}", exp.exp_dir().display());
            }
            let mut finished = None;
            if blocking {
                let (snap, done) = block_on(&services, &exp, json || quiet)?;
                if !json && !quiet {
                    println!("{}", format_status(&exp, &snap));
                    if !done {
                        println!("interrupted; the experiment continues in the background");
                    }
                }
                finished = Some((snap, done));
            }
            if json {
                let mut payload = json!({
                    "ok": true,
                    "command": "run",
                    "experiment": experiment_to_json(&exp),
                    "simulations": created,
                });
                if let Some((snap, done)) = finished {
                    payload["done"] = json!(done);
                    payload["status"] = snapshot_to_json(&snap);
                }
                return Ok(Some(payload));
            }
        }
        Commands::Status {
            experiment,
            active,
            repeat,
        } => {
            if active {
                let exps = services.store.query_experiments(&ExperimentFilter::active())?;
                let mut rows = Vec::new();
                for exp in &exps {
                    let counts = services.store.status_counts(&exp.id)?;
                    if json {
                        rows.push(json!({"experiment": experiment_to_json(exp), "counts": counts}));
                    } else {
                        println!("{}\n  {}", exp, counts);
                    }
                }
                if json {
                    return Ok(Some(json!({"ok": true, "command": "status", "active": rows})));
                }
                if exps.is_empty() {
                    println!("no active experiments");
                }
                return Ok(None);
            }
            let exp = select_experiment(&services.store, experiment.as_deref())?;
            let snap = if repeat {
                block_on(&services, &exp, json)?.0
            } else {
                monitor_for(&services, exp.clone())?.query()?
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "experiment": experiment_to_json(&exp),
                    "status": snapshot_to_json(&snap),
                })));
            }
            println!("{}", format_status(&exp, &snap));
        }
        Commands::List {
            limit,
            all,
            name,
            location,
        } => {
            let filter = ExperimentFilter {
                name_contains: name,
                location: location.map(Into::into),
                limit: if all { None } else { Some(limit) },
                ..ExperimentFilter::default()
            };
            let exps = services.store.query_experiments(&filter)?;
            if json {
                let mut rows = Vec::new();
                for exp in &exps {
                    rows.push(json!({
                        "experiment": experiment_to_json(exp),
                        "counts": services.store.status_counts(&exp.id)?,
                    }));
                }
                return Ok(Some(json!({"ok": true, "command": "list", "experiments": rows})));
            }
            for exp in &exps {
                println!("{}  [{}]", exp, services.store.status_counts(&exp.id)?);
            }
        }
        Commands::Cancel {
            experiment,
            sim_ids,
            yes,
        } => {
            let exp = select_experiment(&services.store, experiment.as_deref())?;
            let target = if sim_ids.is_empty() {
                CancelTarget::All
            } else {
                CancelTarget::Ids(sim_ids)
            };
            let what = match &target {
                CancelTarget::All => format!("cancel every simulation of {}", exp),
                CancelTarget::Ids(ids) => format!("cancel {} simulation(s) of {}", ids.len(), exp),
            };
            if !confirm(&what, yes, json)? {
                return Ok(None);
            }
            let requested = ExperimentManager::new(&services, exp.clone())?.cancel(target)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "cancel",
                    "experiment": exp.id,
                    "requested": requested,
                })));
            }
            println!("cancel requested for {} simulation(s)", requested.len());
        }
        Commands::Exterminate { experiment, yes } => {
            let exps = select_experiments(
                &services.store,
                experiment.as_deref(),
                ExperimentFilter::active(),
            )?;
            if exps.is_empty() {
                return Err(sim_core::Error::NotFound("no active experiment matches".to_string()).into());
            }
            if !confirm(&list_prompt("cancel", &exps), yes, json)? {
                return Ok(None);
            }
            let mut canceled = Vec::new();
            for exp in exps {
                let requested = ExperimentManager::new(&services, exp.clone())?.cancel(CancelTarget::All)?;
                if !json {
                    println!("{}: cancel requested for {} simulation(s)", exp.id, requested.len());
                }
                canceled.push(json!({"experiment": exp.id, "requested": requested}));
            }
            if json {
                return Ok(Some(json!({"ok": true, "command": "exterminate", "experiments": canceled})));
            }
        }
        Commands::Delete {
            experiment,
            hard,
            yes,
        } => {
            let exp = select_experiment(&services.store, experiment.as_deref())?;
            let what = if hard {
                format!("delete {} and its files", exp)
            } else {
                format!("delete {} from the job store", exp)
            };
            if !confirm(&what, yes, json)? {
                return Ok(None);
            }
            ExperimentManager::new(&services, exp.clone())?.delete(hard)?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "delete", "experiment": exp.id, "hard": hard})));
            }
            println!("deleted {}", exp.id);
        }
        Commands::Clean { experiment, yes } => {
            let cwd = std::env::current_dir().context("resolving working directory")?;
            let exps = select_experiments(
                &services.store,
                experiment.as_deref(),
                ExperimentFilter {
                    working_directory: Some(cwd),
                    ..ExperimentFilter::default()
                },
            )?;
            if exps.is_empty() {
                if json {
                    return Ok(Some(json!({"ok": true, "command": "clean", "deleted": []})));
                }
                println!("nothing to clean");
                return Ok(None);
            }
            if !confirm(&list_prompt("hard-delete", &exps), yes, json)? {
                return Ok(None);
            }
            let mut deleted = Vec::new();
            for exp in exps {
                ExperimentManager::new(&services, exp.clone())?.delete(true)?;
                if !json {
                    println!("deleted {}", exp.id);
                }
                deleted.push(exp.id);
            }
            if json {
                return Ok(Some(json!({"ok": true, "command": "clean", "deleted": deleted})));
            }
        }
        Commands::Analyze {
            experiment,
            recent,
            analyzers,
            args,
        } => {
            let query = if recent { None } else { experiment.as_deref() };
            let exp = select_experiment(&services.store, query)?;
            let bindings = parse_analyzer_bindings(&services.registry, &analyzers, args.as_deref())?;
            let report = analyze_experiments(
                &services,
                std::slice::from_ref(&exp),
                if bindings.is_empty() { None } else { Some(bindings.as_slice()) },
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "analyze",
                    "experiment": exp.id,
                    "report": report,
                    "warnings": report.warnings(),
                })));
            }
            print_report(&exp, &report);
        }
        Commands::Overseer { service } => {
            let daemon = DaemonHandle::new(&services)?;
            if !daemon.register_current()? {
                tracing::info!("another overseer is running; exiting");
                return Ok(None);
            }
            let stop = interrupt_flag()?;
            let mode = if service {
                OverseerMode::Service
            } else {
                OverseerMode::Batch
            };
            let result = Overseer::new(services.clone()).run(mode, &stop);
            daemon.unregister_current()?;
            result?;
        }
        Commands::RenderWorker | Commands::AnalyzeList => {}
    }
    Ok(None)
}

fn open_services(config: &Path, block: Option<&str>) -> Result<Services> {
    let settings = SetupConfig::load(config)?.select(block)?;
    let render = RenderMode::Process {
        program: std::env::current_exe().context("locating the simtools executable")?,
        args: vec!["render-worker".to_string()],
    };
    Ok(Services::open(settings)?.with_render(render))
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_env("SIMTOOLS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow!("installing logger: {}", e))
}

fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing interrupt handler")?;
    Ok(stop)
}

/// Polls until done or Ctrl-C, printing per-status counts unless `silent`.
fn block_on(services: &Services, exp: &Experiment, silent: bool) -> Result<(StatusSnapshot, bool)> {
    let stop = interrupt_flag()?;
    let mut monitor = monitor_for(services, exp.clone())?;
    let mut last = String::new();
    watch(monitor.as_mut(), services.settings.poll_interval, &stop, |snap| {
        let counts = snap.counts().to_string();
        if !silent && counts != last {
            println!("{}  {}", chrono::Local::now().format("%H:%M:%S"), counts);
            last = counts;
        }
    })
}

fn confirm(what: &str, yes: bool, json: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if json {
        return Err(anyhow!("refusing to {} without --yes in --json mode", what));
    }
    print!("About to {}.\nContinue? [y/N] ", what);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    let accepted = matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes");
    if !accepted {
        println!("aborted");
    }
    Ok(accepted)
}

fn list_prompt(action: &str, exps: &[Experiment]) -> String {
    let mut out = format!("{} {} experiment(s):", action, exps.len());
    for exp in exps {
        out.push_str(&format!("\n  {}", exp));
    }
    out
}

fn parse_analyzer_bindings(
    registry: &AnalyzerRegistry,
    requested: &[String],
    args: Option<&str>,
) -> Result<Vec<AnalyzerBinding>> {
    let args = match args {
        Some(raw) => serde_json::from_str::<Value>(raw).context("parsing --args")?,
        None => Value::Null,
    };
    let mut out = Vec::new();
    for raw in requested {
        let (name, version) = match raw.split_once(':') {
            Some((name, v)) => (
                name,
                v.parse::<u32>()
                    .map_err(|_| anyhow!("invalid analyzer version in '{}'", raw))?,
            ),
            None => (
                raw.as_str(),
                registry
                    .latest_version(raw)
                    .ok_or_else(|| sim_core::Error::Config(format!("unknown analyzer '{}'", raw)))?,
            ),
        };
        out.push(AnalyzerBinding::new(name, version, args.clone()));
    }
    Ok(out)
}

fn print_report(exp: &Experiment, report: &AnalysisReport) {
    println!("analysis of {}", exp);
    for result in &report.analyzers {
        println!(
            "{} v{}: {} simulation(s), {} failure(s)",
            result.name,
            result.version,
            result.contributing.len(),
            result.failures.len()
        );
        if let Some(summary) = &result.summary {
            match serde_json::to_string_pretty(summary) {
                Ok(text) => println!("{}", text),
                Err(_) => println!("{}", summary),
            }
        }
        if let RenderStatus::Ok = result.render {
            println!("rendered to {}", exp.exp_dir().join(sim_runner::ANALYSIS_DIR).display());
        }
    }
    if !report.skipped.is_empty() {
        println!("{} simulation(s) matched no analyzer", report.skipped.len());
    }
    if !report.excluded.is_empty() {
        println!("{} simulation(s) excluded from analysis", report.excluded.len());
    }
    for warning in report.warnings() {
        eprintln!("warning: {}", warning);
    }
}

fn experiment_to_json(exp: &Experiment) -> Value {
    json!({
        "id": exp.id,
        "name": exp.name,
        "location": exp.location.as_str(),
        "block": exp.block,
        "suite_id": exp.suite_id,
        "created_at": exp.created_at.to_rfc3339(),
        "directory": exp.exp_dir(),
    })
}

fn snapshot_to_json(snap: &StatusSnapshot) -> Value {
    json!({
        "states": snap.states,
        "messages": snap.messages,
        "counts": snap.counts(),
        "done": snap.is_done(),
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
