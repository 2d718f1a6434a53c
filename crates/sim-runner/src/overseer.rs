use crate::analysis::analyze_experiments;
use crate::manager::ExperimentManager;
use crate::{sleep_while_running, Services};
use anyhow::Result;
use sim_analysis::AnalysisReport;
use sim_core::{Backoff, Experiment};
use sim_store::ExperimentFilter;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicBool;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverseerMode {
    /// Exit once nothing is active and every analysis has finished.
    Batch,
    Service,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub active: usize,
    pub commissioned: usize,
    /// Experiments that became done this tick; their managers are dropped.
    pub finished: Vec<String>,
    /// Experiments deleted from the store while managed.
    pub dropped: Vec<String>,
}

/// Background loop that commissions, refreshes and hands finished
/// experiments to the analysis pipeline.
pub struct Overseer {
    services: Services,
    managers: BTreeMap<String, ExperimentManager>,
    unmanageable: BTreeSet<String>,
    analyses: Vec<(String, JoinHandle<Result<AnalysisReport>>)>,
    backoff: Backoff,
}

impl Overseer {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            managers: BTreeMap::new(),
            unmanageable: BTreeSet::new(),
            analyses: Vec::new(),
            backoff: Backoff::default(),
        }
    }

    pub fn managed(&self) -> Vec<String> {
        self.managers.keys().cloned().collect()
    }

    pub fn outstanding_analyses(&self) -> usize {
        self.analyses.len()
    }

    pub fn tick(&mut self) -> Result<TickSummary> {
        let store = self.services.store.clone();
        let active = store.query_experiments(&ExperimentFilter::active())?;
        let mut summary = TickSummary {
            active: active.len(),
            ..TickSummary::default()
        };

        for exp in active {
            if self.managers.contains_key(&exp.id) || self.unmanageable.contains(&exp.id) {
                continue;
            }
            let id = exp.id.clone();
            match ExperimentManager::new(&self.services, exp) {
                Ok(manager) => {
                    info!(experiment = %id, "managing experiment");
                    self.managers.insert(id, manager);
                }
                Err(e) => {
                    warn!(experiment = %id, error = %format!("{:#}", e), "cannot manage experiment");
                    self.unmanageable.insert(id);
                }
            }
        }

        let ids = self.managers.keys().cloned().collect::<Vec<_>>();
        for id in ids {
            if store.get_experiment(&id)?.is_none() {
                info!(experiment = %id, "experiment deleted; dropping manager");
                self.managers.remove(&id);
                summary.dropped.push(id);
                continue;
            }
            let Some(manager) = self.managers.get_mut(&id) else {
                continue;
            };
            match manager.commission() {
                Ok(started) => summary.commissioned += started,
                Err(e) => warn!(experiment = %id, error = %format!("{:#}", e), "commission failed"),
            }
            let done = match manager.refresh_status() {
                Ok(snap) => {
                    debug!(experiment = %id, "{}", snap.counts());
                    snap.is_done()
                }
                Err(e) => {
                    warn!(experiment = %id, error = %format!("{:#}", e), "status refresh failed");
                    false
                }
            };
            if done {
                if let Some(manager) = self.managers.remove(&id) {
                    info!(experiment = %id, "experiment done");
                    self.start_analysis(manager.experiment().clone());
                }
                summary.finished.push(id);
            }
        }

        self.reap_analyses();
        Ok(summary)
    }

    fn start_analysis(&mut self, exp: Experiment) {
        if exp.analyzers.is_empty() {
            debug!(experiment = %exp.id, "no analyzers bound");
            return;
        }
        let services = self.services.clone();
        let id = exp.id.clone();
        let spawned = thread::Builder::new()
            .name(format!("simtools-analyze-{}", exp.id))
            .spawn(move || analyze_experiments(&services, std::slice::from_ref(&exp), None));
        match spawned {
            Ok(handle) => self.analyses.push((id, handle)),
            Err(e) => error!(experiment = %id, error = %e, "could not start analysis"),
        }
    }

    fn reap_analyses(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .analyses
            .drain(..)
            .partition(|(_, handle)| handle.is_finished());
        self.analyses = running;
        for (id, handle) in finished {
            log_analysis(&id, handle);
        }
    }

    fn drain_analyses(&mut self) {
        for (id, handle) in self.analyses.drain(..) {
            log_analysis(&id, handle);
        }
    }

    /// Ticks every poll interval until `stop` is raised or, in batch mode,
    /// nothing is left to oversee. A failed tick is retried after backoff.
    pub fn run(&mut self, mode: OverseerMode, stop: &AtomicBool) -> Result<()> {
        info!(mode = ?mode, pid = std::process::id(), "overseer started");
        loop {
            let delay = match self.tick() {
                Ok(summary) => {
                    self.backoff.succeed();
                    if mode == OverseerMode::Batch
                        && self.managers.is_empty()
                        && self.analyses.is_empty()
                    {
                        info!(active = summary.active, "nothing left to oversee");
                        break;
                    }
                    self.services.settings.poll_interval
                }
                Err(e) => {
                    let delay = self.backoff.fail();
                    error!(error = %format!("{:#}", e), retry_in = ?delay, "overseer tick failed");
                    delay
                }
            };
            if !sleep_while_running(delay, stop) {
                info!("overseer stopping");
                break;
            }
        }
        self.drain_analyses();
        Ok(())
    }
}

fn log_analysis(id: &str, handle: JoinHandle<Result<AnalysisReport>>) {
    match handle.join() {
        Ok(Ok(report)) => info!(
            experiment = %id,
            analyzers = report.analyzers.len(),
            failures = report.failure_count(),
            "analysis complete"
        ),
        Ok(Err(e)) => warn!(experiment = %id, error = %format!("{:#}", e), "analysis failed"),
        Err(_) => error!(experiment = %id, "analysis thread panicked"),
    }
}
