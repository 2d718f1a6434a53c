use crate::slots::{SlotPermit, SlotPool};
use crate::{CancelTarget, CommissionReport, ExecutionBackend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sim_core::fsutil::{
    atomic_write_json_pretty, ensure_dir, last_nonempty_line, load_json_file,
};
use sim_core::process::{pid_alive, terminate_pid};
use sim_core::{
    Error, Experiment, Location, Result, Settings, Simulation, SimulationStatus, StatusUpdate,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SENTINEL_FILE: &str = "status.json";
pub const PROGRESS_FILE: &str = "status.txt";
pub const CONFIG_FILE: &str = "config.json";
pub const STDOUT_FILE: &str = "StdOut.txt";
pub const STDERR_FILE: &str = "StdErr.txt";
/// Exit code written by the worker wrapper itself, so it survives the
/// process that launched it.
pub const EXIT_CODE_FILE: &str = "exit_code";

/// Runs the job as a child of `sh`, forwards TERM/INT to it and records its
/// exit code. Invoked as `sh -c WRAPPER simtools-worker <argv..>`.
#[cfg(unix)]
const WRAPPER: &str = r#"trap 'kill -TERM "$child" 2>/dev/null' TERM INT
"$@" &
child=$!
while :; do
  wait "$child"
  code=$?
  kill -0 "$child" 2>/dev/null || break
done
printf '%s\n' "$code" > exit_code.tmp && mv exit_code.tmp exit_code
exit "$code"
"#;

/// Final word on a local worker, written next to its outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentinel {
    pub status: SimulationStatus,
    pub exit_code: Option<i32>,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl Sentinel {
    pub fn new(status: SimulationStatus, exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            status,
            exit_code,
            message: message.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn read(sim_dir: &Path) -> Option<Sentinel> {
        let path = sim_dir.join(SENTINEL_FILE);
        if !path.exists() {
            return None;
        }
        match load_json_file(&path).and_then(|v| Ok(serde_json::from_value(v)?)) {
            Ok(sentinel) => Some(sentinel),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable sentinel");
                None
            }
        }
    }

    pub fn write(&self, sim_dir: &Path) -> Result<()> {
        atomic_write_json_pretty(&sim_dir.join(SENTINEL_FILE), &serde_json::to_value(self)?)
    }
}

struct Worker {
    child: Child,
    sim_dir: PathBuf,
    _permit: SlotPermit,
}

/// Runs each simulation as a child process of the current process.
pub struct LocalBackend {
    settings: Arc<Settings>,
    slots: Arc<SlotPool>,
    workers: HashMap<String, Worker>,
    canceled: HashSet<String>,
}

impl LocalBackend {
    pub fn new(settings: Arc<Settings>, slots: Arc<SlotPool>) -> Self {
        Self {
            settings,
            slots,
            workers: HashMap::new(),
            canceled: HashSet::new(),
        }
    }

    pub fn running(&self) -> usize {
        self.workers.len()
    }

    fn launch(&self, exp: &Experiment, sim: &Simulation) -> Result<(Child, PathBuf)> {
        let sim_dir = exp.sim_dir(&sim.id);
        ensure_dir(&sim_dir)?;
        let _ = fs::remove_file(sim_dir.join(SENTINEL_FILE));
        let _ = fs::remove_file(sim_dir.join(EXIT_CODE_FILE));
        let config_path = sim_dir.join(CONFIG_FILE);
        atomic_write_json_pretty(&config_path, &sim.config)?;

        let argv = build_argv(&exp.command_line, &config_path, &exp.working_directory)?;
        let stdout = fs::File::create(sim_dir.join(STDOUT_FILE))?;
        let stderr = fs::File::create(sim_dir.join(STDERR_FILE))?;
        let mut cmd = worker_command(&argv);
        cmd.current_dir(&sim_dir)
            .env("SIMTOOLS_SIM_ID", &sim.id)
            .env("SIMTOOLS_EXPERIMENT_ID", &exp.id)
            .env("SIMTOOLS_CONFIG", &config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        let child = cmd.spawn()?;
        Ok((child, sim_dir))
    }

    fn reap(&mut self, sim: &Simulation) -> Option<StatusUpdate> {
        let worker = self.workers.get_mut(&sim.id)?;
        match worker.child.try_wait() {
            Ok(None) => Some(running_update(&sim.id, &worker.sim_dir, worker.child.id())),
            Ok(Some(exit)) => {
                let sim_dir = worker.sim_dir.clone();
                self.workers.remove(&sim.id);
                let canceled = self.canceled.remove(&sim.id)
                    || sim.status == SimulationStatus::CancelRequested
                    || Sentinel::read(&sim_dir)
                        .map(|s| s.status == SimulationStatus::Canceled)
                        .unwrap_or(false);
                let code = exit.code().or_else(|| recorded_exit_code(&sim_dir));
                let sentinel = exit_sentinel(code, canceled, &sim_dir);
                if let Err(e) = sentinel.write(&sim_dir) {
                    warn!(sim = %sim.id, error = %e, "failed to write sentinel");
                }
                info!(sim = %sim.id, status = %sentinel.status, "worker finished");
                Some(StatusUpdate::new(sim.id.clone(), sentinel.status, sentinel.message))
            }
            Err(e) => {
                warn!(sim = %sim.id, error = %e, "worker wait failed");
                None
            }
        }
    }

    /// Status of a simulation this process does not own a handle for.
    fn observe_detached(&self, exp: &Experiment, sim: &Simulation) -> Option<StatusUpdate> {
        // Not launched yet; a sentinel on disk belongs to an earlier attempt.
        if sim.status.is_pending() {
            return None;
        }
        let sim_dir = exp.sim_dir(&sim.id);
        if let Some(sentinel) = Sentinel::read(&sim_dir) {
            return Some(StatusUpdate::new(sim.id.clone(), sentinel.status, sentinel.message));
        }
        if let Some(pid) = sim.pid.filter(|p| pid_alive(*p)) {
            return Some(running_update(&sim.id, &sim_dir, pid));
        }
        // Finished while no overseer held its handle.
        if let Some(code) = recorded_exit_code(&sim_dir) {
            let canceled = sim.status == SimulationStatus::CancelRequested;
            let sentinel = exit_sentinel(Some(code), canceled, &sim_dir);
            if let Err(e) = sentinel.write(&sim_dir) {
                warn!(sim = %sim.id, error = %e, "failed to write sentinel");
            }
            info!(sim = %sim.id, status = %sentinel.status, "detached worker finished");
            return Some(StatusUpdate::new(sim.id.clone(), sentinel.status, sentinel.message));
        }
        match sim.status {
            SimulationStatus::CancelRequested => {
                let sentinel = Sentinel::new(SimulationStatus::Canceled, None, "canceled");
                if let Err(e) = sentinel.write(&sim_dir) {
                    warn!(sim = %sim.id, error = %e, "failed to write sentinel");
                }
                Some(StatusUpdate::new(sim.id.clone(), sentinel.status, sentinel.message))
            }
            SimulationStatus::CommissionRequested
            | SimulationStatus::Provisioning
            | SimulationStatus::Commissioned
            | SimulationStatus::Running => {
                if sim.retries < self.settings.max_retries {
                    warn!(sim = %sim.id, retries = sim.retries, "worker lost, scheduling retry");
                    Some(StatusUpdate::new(
                        sim.id.clone(),
                        SimulationStatus::Retry,
                        "worker lost",
                    ))
                } else {
                    warn!(sim = %sim.id, retries = sim.retries, "worker lost, retries exhausted");
                    Some(StatusUpdate::new(
                        sim.id.clone(),
                        SimulationStatus::Failed,
                        format!("worker lost after {} retries", sim.retries),
                    ))
                }
            }
            _ => None,
        }
    }
}

fn running_update(sim_id: &str, sim_dir: &Path, pid: u32) -> StatusUpdate {
    let progress = last_nonempty_line(&sim_dir.join(PROGRESS_FILE)).unwrap_or_default();
    StatusUpdate::new(sim_id, SimulationStatus::Running, progress).with_pid(pid)
}

fn exit_sentinel(code: Option<i32>, canceled: bool, sim_dir: &Path) -> Sentinel {
    let progress = last_nonempty_line(&sim_dir.join(PROGRESS_FILE)).unwrap_or_default();
    match code {
        Some(0) => Sentinel::new(SimulationStatus::Succeeded, Some(0), progress),
        _ if canceled => Sentinel::new(SimulationStatus::Canceled, code, "canceled"),
        Some(code) if code > 128 => Sentinel::new(
            SimulationStatus::Failed,
            Some(code),
            format!("terminated by signal {}", code - 128),
        ),
        Some(code) => Sentinel::new(
            SimulationStatus::Failed,
            Some(code),
            format!("exit code {}", code),
        ),
        None => Sentinel::new(SimulationStatus::Failed, None, "terminated by signal"),
    }
}

fn recorded_exit_code(sim_dir: &Path) -> Option<i32> {
    fs::read_to_string(sim_dir.join(EXIT_CODE_FILE))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

#[cfg(unix)]
fn worker_command(argv: &[String]) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(WRAPPER).arg("simtools-worker").args(argv);
    cmd
}

#[cfg(not(unix))]
fn worker_command(argv: &[String]) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd
}

/// Splits the command line and substitutes the job config path for the
/// `{config}` placeholder. Path-like programs resolve against `workdir`.
pub fn build_argv(command_line: &str, config_path: &Path, workdir: &Path) -> Result<Vec<String>> {
    let parts = shlex::split(command_line)
        .ok_or_else(|| Error::Config(format!("unparseable command line: {}", command_line)))?;
    if parts.is_empty() {
        return Err(Error::Config("empty command line".to_string()));
    }
    let config = config_path.to_string_lossy();
    let mut argv = parts
        .into_iter()
        .map(|p| p.replace("{config}", &config))
        .collect::<Vec<_>>();
    let program = Path::new(&argv[0]);
    if program.is_relative() && argv[0].contains('/') {
        argv[0] = workdir.join(program).to_string_lossy().to_string();
    }
    Ok(argv)
}

impl ExecutionBackend for LocalBackend {
    fn location(&self) -> Location {
        Location::Local
    }

    fn commission(&mut self, exp: &Experiment, pending: &[Simulation]) -> Result<CommissionReport> {
        let mut report = CommissionReport::default();
        for sim in pending {
            if !sim.status.is_pending() || self.workers.contains_key(&sim.id) {
                continue;
            }
            let Some(permit) = self.slots.try_acquire() else {
                debug!(experiment = %exp.id, "local slots exhausted");
                break;
            };
            match self.launch(exp, sim) {
                Ok((child, sim_dir)) => {
                    let pid = child.id();
                    info!(sim = %sim.id, pid, "worker started");
                    self.workers.insert(
                        sim.id.clone(),
                        Worker {
                            child,
                            sim_dir,
                            _permit: permit,
                        },
                    );
                    report.started += 1;
                    report.updates.push(
                        StatusUpdate::new(sim.id.clone(), SimulationStatus::Running, "").with_pid(pid),
                    );
                }
                Err(e) => {
                    warn!(sim = %sim.id, error = %e, "worker launch failed");
                    let sentinel =
                        Sentinel::new(SimulationStatus::Failed, None, format!("launch failed: {}", e));
                    let _ = sentinel.write(&exp.sim_dir(&sim.id));
                    report
                        .updates
                        .push(StatusUpdate::new(sim.id.clone(), sentinel.status, sentinel.message));
                }
            }
        }
        Ok(report)
    }

    fn status(&mut self, exp: &Experiment, sims: &[Simulation]) -> Result<Option<Vec<StatusUpdate>>> {
        let mut updates = Vec::new();
        for sim in sims {
            if sim.status.is_terminal() {
                continue;
            }
            let update = if self.workers.contains_key(&sim.id) {
                self.reap(sim)
            } else {
                self.observe_detached(exp, sim)
            };
            updates.extend(update);
        }
        Ok(Some(updates))
    }

    fn cancel(&mut self, exp: &Experiment, sims: &[Simulation], target: &CancelTarget) -> Result<()> {
        for sim in sims {
            if sim.status.is_terminal() || !target.includes(&sim.id) {
                continue;
            }
            let sim_dir = exp.sim_dir(&sim.id);
            // Sentinel first, so a concurrent reaper sees the cancellation.
            let sentinel = Sentinel::new(SimulationStatus::Canceled, None, "canceled");
            if sim_dir.exists() || sim.pid.is_some() || self.workers.contains_key(&sim.id) {
                sentinel.write(&sim_dir)?;
            }
            if let Some(worker) = self.workers.get(&sim.id) {
                self.canceled.insert(sim.id.clone());
                terminate_pid(worker.child.id());
            } else if let Some(pid) = sim.pid.filter(|p| pid_alive(*p)) {
                terminate_pid(pid);
            }
            debug!(sim = %sim.id, "cancel signalled");
        }
        Ok(())
    }

    fn delete(&mut self, exp: &Experiment, hard: bool) -> Result<()> {
        if !hard {
            return Ok(());
        }
        for (sim_id, worker) in self.workers.iter_mut() {
            terminate_pid(worker.child.id());
            let _ = worker.child.wait();
            debug!(sim = %sim_id, "worker stopped for deletion");
        }
        self.workers.clear();
        let exp_dir = exp.exp_dir();
        if exp_dir.exists() {
            fs::remove_dir_all(&exp_dir)?;
            info!(experiment = %exp.id, dir = %exp_dir.display(), "experiment directory removed");
        }
        Ok(())
    }

    fn output_locations(
        &mut self,
        exp: &Experiment,
        sims: &[Simulation],
    ) -> Result<BTreeMap<String, PathBuf>> {
        Ok(sims
            .iter()
            .map(|s| (s.id.clone(), exp.sim_dir(&s.id)))
            .collect())
    }
}
