use crate::error::{Error, Result};
use crate::status::SimulationStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Per-simulation metadata: sweep coordinates plus arbitrary labels used by
/// analyzer filters.
pub type Tags = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Local,
    Remote,
}

impl Location {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "Local",
            Self::Remote => "Remote",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" | "hpc" => Ok(Self::Remote),
            other => Err(Error::Config(format!("unknown location: {}", other))),
        }
    }
}

/// Persisted reference to an analyzer: registry key plus constructor args.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerBinding {
    pub name: String,
    #[serde(default = "default_analyzer_version")]
    pub version: u32,
    #[serde(default)]
    pub args: Value,
}

fn default_analyzer_version() -> u32 {
    1
}

impl AnalyzerBinding {
    pub fn new(name: impl Into<String>, version: u32, args: Value) -> Self {
        Self {
            name: name.into(),
            version,
            args,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub location: Location,
    /// Configuration block the experiment was created under.
    pub block: String,
    /// Directory the submitting command was run from.
    pub working_directory: PathBuf,
    /// Root under which the experiment directory lives.
    pub sim_root: PathBuf,
    pub revision: Option<String>,
    pub command_line: String,
    pub suite_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub analyzers: Vec<AnalyzerBinding>,
}

impl Experiment {
    pub fn exp_dir(&self) -> PathBuf {
        self.sim_root.join(format!("{}_{}", self.name, self.id))
    }

    pub fn sim_dir(&self, sim_id: &str) -> PathBuf {
        self.exp_dir().join(sim_id)
    }
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) - {} - {}",
            self.name,
            self.id,
            self.location,
            self.created_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    pub id: String,
    pub experiment_id: String,
    /// 1-based creation order inside the experiment.
    pub seq: u32,
    pub status: SimulationStatus,
    pub message: String,
    pub tags: Tags,
    pub config: Value,
    pub pid: Option<u32>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
}

impl Simulation {
    pub fn local_id(experiment_id: &str, seq: u32) -> String {
        format!("{}.{}", experiment_id, seq)
    }

    /// Tags as seen by analyzer filters: the stored tags plus `sim_id`.
    pub fn filter_tags(&self) -> Tags {
        let mut tags = self.tags.clone();
        tags.insert("sim_id".to_string(), Value::String(self.id.clone()));
        tags
    }
}

/// One status observation from a backend, applied through the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub sim_id: String,
    pub status: SimulationStatus,
    pub message: String,
    pub pid: Option<u32>,
}

impl StatusUpdate {
    pub fn new(sim_id: impl Into<String>, status: SimulationStatus, message: impl Into<String>) -> Self {
        Self {
            sim_id: sim_id.into(),
            status,
            message: message.into(),
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// A job materialized by the creator but not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationDraft {
    pub tags: Tags,
    pub config: Value,
}

pub fn make_experiment_id(now: DateTime<Utc>) -> String {
    now.format("%Y_%m_%d_%H_%M_%S_%6f").to_string()
}

pub fn validate_experiment_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Config("experiment name must not be empty".to_string()));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || " _.-".contains(*c)))
    {
        return Err(Error::Config(format!(
            "experiment name '{}' contains invalid character '{}'",
            name, bad
        )));
    }
    Ok(())
}

/// Two integers `done total` in a progress message, as written by
/// simulators into their status line.
pub fn progress_fraction(message: &str) -> Option<(u64, u64)> {
    let mut parts = message.split_whitespace();
    let done = parts.next()?.parse::<u64>().ok()?;
    let total = parts.next()?.parse::<u64>().ok()?;
    if parts.next().is_some() || total == 0 {
        return None;
    }
    Some((done, total))
}
