use crate::creator::SimulationCreator;
use crate::monitor::{format_status, StatusSnapshot};
use crate::sweep::Sweep;
use crate::{sleep_while_running, Services};
use anyhow::{Context, Result};
use chrono::Utc;
use sim_backend::{CancelTarget, ExecutionBackend};
use sim_core::{
    make_experiment_id, validate_experiment_name, AnalyzerBinding, Experiment, Simulation,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a new experiment is made of, apart from its simulations.
#[derive(Debug, Clone, Default)]
pub struct NewExperiment {
    pub name: String,
    pub command_line: String,
    pub suite_id: Option<String>,
    pub revision: Option<String>,
    pub analyzers: Vec<AnalyzerBinding>,
}

/// Binds the store and one backend to a single experiment.
pub struct ExperimentManager {
    services: Services,
    exp: Experiment,
    backend: Box<dyn ExecutionBackend>,
}

impl ExperimentManager {
    /// Configuration problems (unusable directories, a remote block without
    /// an endpoint) surface here.
    pub fn new(services: &Services, exp: Experiment) -> Result<Self> {
        services.settings.prepare_dirs()?;
        let backend = services.backends.create(exp.location)?;
        Ok(Self {
            services: services.clone(),
            exp,
            backend,
        })
    }

    /// Validates and persists a new experiment with no simulations yet.
    pub fn create(services: &Services, request: NewExperiment) -> Result<Self> {
        validate_experiment_name(&request.name)?;
        for binding in &request.analyzers {
            services.registry.build(binding)?;
        }
        let settings = &services.settings;
        let exp = Experiment {
            id: make_experiment_id(Utc::now()),
            name: request.name,
            location: settings.location,
            block: settings.block.clone(),
            working_directory: std::env::current_dir().context("resolving working directory")?,
            sim_root: settings.sim_root.clone(),
            revision: request.revision,
            command_line: request.command_line,
            suite_id: request.suite_id,
            created_at: Utc::now(),
            analyzers: request.analyzers,
        };
        let manager = Self::new(services, exp)?;
        services.store.create_experiment(&manager.exp)?;
        info!(experiment = %manager.exp.id, name = %manager.exp.name, location = %manager.exp.location, "experiment created");
        Ok(manager)
    }

    pub fn experiment(&self) -> &Experiment {
        &self.exp
    }

    pub fn simulations(&self) -> Result<Vec<Simulation>> {
        Ok(self.services.store.simulations(&self.exp.id)?)
    }

    /// Persists the sweep batch by batch, calling `on_batch` after each.
    pub fn create_simulations<F>(&self, sweep: &Sweep, on_batch: F) -> Result<usize>
    where
        F: FnMut(&[Simulation]) -> Result<()>,
    {
        let creator =
            SimulationCreator::new(self.services.store.clone(), self.services.settings.sims_per_batch);
        creator.create(&self.exp, sweep, on_batch)
    }

    /// Commissions each batch as soon as it is stored.
    pub fn create_and_commission(&mut self, sweep: &Sweep) -> Result<usize> {
        let creator =
            SimulationCreator::new(self.services.store.clone(), self.services.settings.sims_per_batch);
        let exp = self.exp.clone();
        creator.create(&exp, sweep, |_| self.commission().map(|_| ()))
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.services.store.pending_simulations(&self.exp.id)?.is_empty())
    }

    /// Hands pending simulations to the backend. A transient backend failure
    /// starts nothing and is retried by the next call.
    pub fn commission(&mut self) -> Result<usize> {
        let store = &self.services.store;
        let pending = store.pending_simulations(&self.exp.id)?;
        if pending.is_empty() {
            return Ok(0);
        }
        let report = match self.backend.commission(&self.exp, &pending) {
            Ok(report) => report,
            Err(e) if e.is_transient() => {
                warn!(experiment = %self.exp.id, error = %e, "commission deferred");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        if !report.assigned_ids.is_empty() {
            store.rekey_simulations(&self.exp.id, &report.assigned_ids)?;
        }
        if !report.updates.is_empty() {
            store.apply_updates(&report.updates)?;
        }
        if report.started > 0 {
            info!(experiment = %self.exp.id, started = report.started, pending = pending.len(), "commissioned");
        }
        Ok(report.started)
    }

    /// Asks the backend about every non-terminal simulation and persists what
    /// changed. Safe to call every tick.
    pub fn refresh_status(&mut self) -> Result<StatusSnapshot> {
        let store = &self.services.store;
        let live = store
            .simulations(&self.exp.id)?
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect::<Vec<_>>();
        if !live.is_empty() {
            match self.backend.status(&self.exp, &live) {
                Ok(Some(updates)) if !updates.is_empty() => {
                    let outcome = store.apply_updates(&updates)?;
                    debug!(
                        experiment = %self.exp.id,
                        changed = outcome.changed.len(),
                        stale = ?outcome.stale,
                        unknown = ?outcome.unknown,
                        "status refreshed"
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(experiment = %self.exp.id, error = %e, "no status update this tick");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> Result<StatusSnapshot> {
        Ok(StatusSnapshot::from_simulations(
            &self.services.store.simulations(&self.exp.id)?,
        ))
    }

    pub fn is_done(&self) -> Result<bool> {
        Ok(self.services.store.is_done(&self.exp.id)?)
    }

    /// Commissions and refreshes until every simulation is terminal or
    /// `stop` is raised. Returns whether the experiment finished.
    pub fn wait_until_done(&mut self, poll: Duration, verbose: bool, stop: &AtomicBool) -> Result<bool> {
        loop {
            self.commission()?;
            let snap = self.refresh_status()?;
            if verbose {
                info!(experiment = %self.exp.id, "{}", snap.counts());
            }
            if snap.is_done() {
                return Ok(true);
            }
            if !sleep_while_running(poll, stop) {
                return Ok(false);
            }
        }
    }

    /// Marks the targets `CancelRequested` at once, then tells the backend.
    /// Returns the simulations whose cancellation was requested.
    pub fn cancel(&mut self, target: CancelTarget) -> Result<Vec<String>> {
        let store = &self.services.store;
        let ids = match &target {
            CancelTarget::All => None,
            CancelTarget::Ids(ids) => Some(ids.as_slice()),
        };
        let requested = store.request_cancel(&self.exp.id, ids)?;
        if requested.is_empty() {
            return Ok(requested);
        }
        let sims = store.simulations(&self.exp.id)?;
        if let Err(e) = self.backend.cancel(&self.exp, &sims, &target) {
            if !e.is_transient() {
                return Err(e.into());
            }
            warn!(experiment = %self.exp.id, error = %e, "backend cancel deferred");
        }
        info!(experiment = %self.exp.id, count = requested.len(), "cancel requested");
        Ok(requested)
    }

    /// Removes the experiment from the store. A hard delete cancels what is
    /// still running and removes backend artifacts as well.
    pub fn delete(mut self, hard: bool) -> Result<()> {
        if hard && !self.is_done()? {
            self.cancel(CancelTarget::All)?;
        }
        self.backend.delete(&self.exp, hard)?;
        self.services.store.delete_experiment(&self.exp.id)?;
        info!(experiment = %self.exp.id, hard, "experiment deleted");
        Ok(())
    }

    pub fn output_locations(&mut self) -> Result<BTreeMap<String, PathBuf>> {
        let sims = self.simulations()?;
        Ok(self.backend.output_locations(&self.exp, &sims)?)
    }

    pub fn format_status(&self) -> Result<String> {
        Ok(format_status(&self.exp, &self.snapshot()?))
    }
}
