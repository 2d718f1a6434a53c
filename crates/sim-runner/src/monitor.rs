use crate::{sleep_while_running, Services};
use anyhow::Result;
use serde::Serialize;
use sim_backend::ExecutionBackend;
use sim_core::{progress_fraction, Experiment, Location, Simulation, SimulationStatus, StatusCounts};
use sim_store::JobStore;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::warn;

/// Experiments at or above this size print counts only.
const TABLE_LIMIT: usize = 20;

/// Per-simulation state and message at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub states: BTreeMap<String, SimulationStatus>,
    pub messages: BTreeMap<String, String>,
}

impl StatusSnapshot {
    pub fn from_simulations(sims: &[Simulation]) -> Self {
        let mut snap = Self::default();
        for sim in sims {
            snap.states.insert(sim.id.clone(), sim.status);
            snap.messages.insert(sim.id.clone(), sim.message.clone());
        }
        snap
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::from_statuses(self.states.values())
    }

    pub fn is_done(&self) -> bool {
        self.counts().is_done()
    }
}

/// Read-only view of an experiment's progress.
pub trait StatusMonitor {
    fn experiment(&self) -> &Experiment;
    fn query(&mut self) -> Result<StatusSnapshot>;
}

/// Reads persisted rows; the overseer keeps them current.
pub struct DbMonitor {
    store: JobStore,
    exp: Experiment,
}

impl DbMonitor {
    pub fn new(store: JobStore, exp: Experiment) -> Self {
        Self { store, exp }
    }
}

impl StatusMonitor for DbMonitor {
    fn experiment(&self) -> &Experiment {
        &self.exp
    }

    fn query(&mut self) -> Result<StatusSnapshot> {
        Ok(StatusSnapshot::from_simulations(&self.store.simulations(&self.exp.id)?))
    }
}

/// Overlays live backend answers on the stored rows without persisting
/// them.
pub struct BackendMonitor {
    store: JobStore,
    exp: Experiment,
    backend: Box<dyn ExecutionBackend>,
}

impl BackendMonitor {
    pub fn new(store: JobStore, exp: Experiment, backend: Box<dyn ExecutionBackend>) -> Self {
        Self {
            store,
            exp,
            backend,
        }
    }
}

impl StatusMonitor for BackendMonitor {
    fn experiment(&self) -> &Experiment {
        &self.exp
    }

    fn query(&mut self) -> Result<StatusSnapshot> {
        let sims = self.store.simulations(&self.exp.id)?;
        let mut snap = StatusSnapshot::from_simulations(&sims);
        let live = sims
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect::<Vec<_>>();
        if live.is_empty() {
            return Ok(snap);
        }
        match self.backend.status(&self.exp, &live) {
            Ok(Some(updates)) => {
                for update in updates {
                    let Some(current) = snap.states.get(&update.sim_id).copied() else {
                        continue;
                    };
                    if current.can_transition(update.status) {
                        snap.states.insert(update.sim_id.clone(), update.status);
                        snap.messages.insert(update.sim_id, update.message);
                    }
                }
            }
            Ok(None) => {}
            Err(e) if e.is_transient() => {
                warn!(experiment = %self.exp.id, error = %e, "status query failed; showing stored state");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(snap)
    }
}

/// Local experiments are driven by the overseer and read from the store;
/// remote ones are asked directly.
pub fn monitor_for(services: &Services, exp: Experiment) -> Result<Box<dyn StatusMonitor>> {
    match exp.location {
        Location::Local => Ok(Box::new(DbMonitor::new(services.store.clone(), exp))),
        Location::Remote => {
            let backend = services.backends.create(Location::Remote)?;
            Ok(Box::new(BackendMonitor::new(services.store.clone(), exp, backend)))
        }
    }
}

/// Polls until the experiment is done or `stop` is raised, handing every
/// snapshot to `on_snapshot`. Returns the last snapshot and whether it was
/// done.
pub fn watch<F>(
    monitor: &mut dyn StatusMonitor,
    poll: Duration,
    stop: &AtomicBool,
    mut on_snapshot: F,
) -> Result<(StatusSnapshot, bool)>
where
    F: FnMut(&StatusSnapshot),
{
    loop {
        let snap = monitor.query()?;
        on_snapshot(&snap);
        if snap.is_done() {
            return Ok((snap, true));
        }
        if !sleep_while_running(poll, stop) {
            return Ok((snap, false));
        }
    }
}

fn describe(status: SimulationStatus, message: &str) -> String {
    match progress_fraction(message) {
        Some((done, total)) if status == SimulationStatus::Running => format!(
            "{} {}/{} ({:.0}%)",
            status,
            done,
            total,
            done as f64 * 100.0 / total as f64
        ),
        _ if message.is_empty() => status.to_string(),
        _ => format!("{} {}", status, message),
    }
}

/// State table for small experiments, per-status counts for larger ones.
pub fn format_status(exp: &Experiment, snap: &StatusSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", exp);
    if snap.states.is_empty() {
        let _ = writeln!(out, "  no simulations");
        return out;
    }
    if snap.states.len() < TABLE_LIMIT {
        let width = snap.states.keys().map(String::len).max().unwrap_or(0);
        for (id, status) in &snap.states {
            let message = snap.messages.get(id).map(String::as_str).unwrap_or("");
            let _ = writeln!(out, "  {:<width$}  {}", id, describe(*status, message), width = width);
        }
    }
    let _ = write!(out, "{}", snap.counts());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn experiment() -> Experiment {
        Experiment {
            id: "2024_01_02_03_04_05_000006".to_string(),
            name: "malaria".to_string(),
            location: Location::Local,
            block: "LOCAL".to_string(),
            working_directory: PathBuf::from("/work"),
            sim_root: PathBuf::from("/work/simulations"),
            revision: None,
            command_line: "true".to_string(),
            suite_id: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().expect("time"),
            analyzers: Vec::new(),
        }
    }

    fn snapshot(rows: &[(&str, SimulationStatus, &str)]) -> StatusSnapshot {
        let mut snap = StatusSnapshot::default();
        for (id, status, message) in rows {
            snap.states.insert(id.to_string(), *status);
            snap.messages.insert(id.to_string(), message.to_string());
        }
        snap
    }

    #[test]
    fn small_experiments_print_a_table_with_progress() {
        use SimulationStatus::*;
        let snap = snapshot(&[("x.1", Running, "45 100"), ("x.2", Succeeded, ""), ("x.3", Failed, "exit code 2")]);
        let text = format_status(&experiment(), &snap);
        assert!(text.starts_with("malaria (2024_01_02_03_04_05_000006) - Local - 2024-01-02 03:04:05"));
        assert!(text.contains("x.1  Running 45/100 (45%)"), "{}", text);
        assert!(text.contains("x.3  Failed exit code 2"), "{}", text);
        assert!(text.ends_with("Running: 1, Succeeded: 1, Failed: 1"), "{}", text);
        assert!(!snap.is_done());
    }

    #[test]
    fn large_experiments_print_counts_only() {
        let rows = (1..=25)
            .map(|i| (format!("x.{}", i), SimulationStatus::Succeeded, String::new()))
            .collect::<Vec<_>>();
        let snap = snapshot(
            &rows
                .iter()
                .map(|(id, st, m)| (id.as_str(), *st, m.as_str()))
                .collect::<Vec<_>>(),
        );
        let text = format_status(&experiment(), &snap);
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with("Succeeded: 25"));
        assert!(snap.is_done());
    }

    #[test]
    fn progress_is_shown_only_for_running() {
        assert_eq!(describe(SimulationStatus::Retry, "3 10"), "Retry 3 10");
        assert_eq!(describe(SimulationStatus::Created, ""), "Created");
    }
}
