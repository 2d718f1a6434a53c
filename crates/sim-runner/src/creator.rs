use crate::sweep::Sweep;
use anyhow::{Context, Result};
use sim_core::{Experiment, Simulation};
use sim_store::JobStore;
use tracing::debug;

/// Materializes a sweep into stored simulations, one atomic batch at a time.
pub struct SimulationCreator {
    store: JobStore,
    batch_size: usize,
}

impl SimulationCreator {
    pub fn new(store: JobStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Persists every job of `sweep` under `exp`. `on_batch` runs after each
    /// batch commits; an error from it stops creation with the committed
    /// batches kept. Returns the number of simulations created.
    pub fn create<F>(&self, exp: &Experiment, sweep: &Sweep, mut on_batch: F) -> Result<usize>
    where
        F: FnMut(&[Simulation]) -> Result<()>,
    {
        let mut created = 0usize;
        for (index, jobs) in sweep.jobs.chunks(self.batch_size).enumerate() {
            let drafts = jobs
                .iter()
                .enumerate()
                .map(|(offset, modifiers)| {
                    sweep.materialize(modifiers).with_context(|| {
                        format!("building job {}", index * self.batch_size + offset)
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let sims = self.store.insert_simulations(&exp.id, &drafts)?;
            created += sims.len();
            debug!(experiment = %exp.id, batch = index, size = sims.len(), "batch persisted");
            on_batch(&sims)?;
        }
        Ok(created)
    }
}
