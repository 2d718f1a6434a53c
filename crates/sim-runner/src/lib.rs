use anyhow::Result;
use sim_analysis::{AnalyzerRegistry, RenderMode};
use sim_backend::BackendFactory;
use sim_core::Settings;
use sim_store::JobStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub mod analysis;
pub mod creator;
pub mod daemon;
pub mod manager;
pub mod monitor;
pub mod overseer;
pub mod select;
pub mod sweep;

pub use analysis::{analyze_experiments, resolve_outputs, ANALYSIS_DIR, REPORT_FILE};
pub use creator::SimulationCreator;
pub use daemon::{DaemonHandle, OVERSEER_PID_KEY};
pub use manager::{ExperimentManager, NewExperiment};
pub use monitor::{
    format_status, monitor_for, watch, BackendMonitor, DbMonitor, StatusMonitor, StatusSnapshot,
};
pub use overseer::{Overseer, OverseerMode, TickSummary};
pub use select::{select_experiment, select_experiments};
pub use sweep::{param_modifier, Modifier, Sweep};

/// Process-wide dependencies, resolved once and passed explicitly.
#[derive(Clone)]
pub struct Services {
    pub settings: Arc<Settings>,
    pub store: JobStore,
    pub backends: BackendFactory,
    pub registry: AnalyzerRegistry,
    pub render: RenderMode,
}

impl Services {
    pub fn open(settings: Settings) -> Result<Self> {
        settings.validate()?;
        settings.prepare_dirs()?;
        let settings = Arc::new(settings);
        let store = JobStore::open(&settings.db_path)?;
        let backends = BackendFactory::new(Arc::clone(&settings))?;
        Ok(Self {
            settings,
            store,
            backends,
            registry: AnalyzerRegistry::with_builtins(),
            render: RenderMode::Inline,
        })
    }

    pub fn with_render(mut self, render: RenderMode) -> Self {
        self.render = render;
        self
    }

    pub fn with_registry(mut self, registry: AnalyzerRegistry) -> Self {
        self.registry = registry;
        self
    }
}

/// Sleeps for `total` unless `stop` is raised first. Returns false when
/// stopped.
pub(crate) fn sleep_while_running(total: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}
