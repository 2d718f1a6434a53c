pub mod backoff;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod lock;
pub mod model;
pub mod process;
pub mod status;

pub use backoff::Backoff;
pub use config::{SetupConfig, Settings};
pub use error::{Error, Result};
pub use lock::LockFile;
pub use model::{
    make_experiment_id, progress_fraction, validate_experiment_name, AnalyzerBinding, Experiment,
    Location, Simulation, SimulationDraft, StatusUpdate, Tags,
};
pub use status::{all_terminal, SimulationStatus, StatusCounts};
