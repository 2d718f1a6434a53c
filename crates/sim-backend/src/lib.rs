use sim_core::{Error, Experiment, Location, Result, Settings, Simulation, StatusUpdate};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub mod local;
pub mod remote;
pub mod slots;

pub use local::LocalBackend;
pub use remote::RemoteBackend;
pub use slots::{SlotPermit, SlotPool};

/// What one `commission` call achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommissionReport {
    pub started: usize,
    /// Local id -> backend-assigned id, for backends that rename jobs.
    pub assigned_ids: BTreeMap<String, String>,
    /// Status observations produced while launching, keyed by the final id.
    pub updates: Vec<StatusUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTarget {
    All,
    Ids(Vec<String>),
}

impl CancelTarget {
    pub fn includes(&self, sim_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.iter().any(|id| id == sim_id),
        }
    }
}

/// Execution substrate for one experiment's simulations.
///
/// `status` returns `Ok(None)` when the backend has nothing to report this
/// tick (for instance while backing off after a transient failure). Errors
/// flagged transient must be treated by callers as "no update".
pub trait ExecutionBackend: Send {
    fn location(&self) -> Location;

    /// Launches pending simulations. Simulations already launched by this
    /// backend are skipped, so repeated calls are no-ops.
    fn commission(&mut self, exp: &Experiment, pending: &[Simulation]) -> Result<CommissionReport>;

    fn status(&mut self, exp: &Experiment, sims: &[Simulation]) -> Result<Option<Vec<StatusUpdate>>>;

    fn cancel(&mut self, exp: &Experiment, sims: &[Simulation], target: &CancelTarget) -> Result<()>;

    /// Hard deletion also removes on-disk or remote artifacts.
    fn delete(&mut self, exp: &Experiment, hard: bool) -> Result<()>;

    /// Output directory per simulation id. Simulations without a known
    /// location are omitted.
    fn output_locations(
        &mut self,
        exp: &Experiment,
        sims: &[Simulation],
    ) -> Result<BTreeMap<String, PathBuf>>;
}

/// Builds backends by location. Local backends share one slot pool; remote
/// backends share one HTTP client.
#[derive(Clone)]
pub struct BackendFactory {
    settings: Arc<Settings>,
    slots: Arc<SlotPool>,
    client: reqwest::blocking::Client,
}

impl BackendFactory {
    pub fn new(settings: Arc<Settings>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;
        let slots = SlotPool::new(settings.max_local_sims);
        Ok(Self {
            settings,
            slots,
            client,
        })
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn slots(&self) -> &Arc<SlotPool> {
        &self.slots
    }

    pub fn create(&self, location: Location) -> Result<Box<dyn ExecutionBackend>> {
        match location {
            Location::Local => Ok(Box::new(LocalBackend::new(
                Arc::clone(&self.settings),
                Arc::clone(&self.slots),
            ))),
            Location::Remote => Ok(Box::new(RemoteBackend::new(
                &self.settings,
                self.client.clone(),
            )?)),
        }
    }
}
