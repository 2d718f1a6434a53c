use crate::error::{Error, Result};
use crate::fsutil::ensure_dir;
use crate::model::Location;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BLOCK: &str = "LOCAL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockConfig {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub sim_root: Option<PathBuf>,
    pub max_local_sims: Option<usize>,
    pub max_threads: Option<usize>,
    pub sims_per_batch: Option<usize>,
    pub endpoint: Option<String>,
    pub token_env: Option<String>,
    pub environment: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub db_path: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

/// Named configuration blocks as read from the setup file.
#[derive(Debug, Clone)]
pub struct SetupConfig {
    pub source: Option<PathBuf>,
    base_dir: PathBuf,
    blocks: BTreeMap<String, BlockConfig>,
}

impl SetupConfig {
    /// Loads the setup file. A missing file yields the built-in `LOCAL` block
    /// rooted at the current directory.
    pub fn load(path: &Path) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        if !path.exists() {
            return Ok(Self::builtin(cwd));
        }
        let raw = fs::read_to_string(path)?;
        let blocks: BTreeMap<String, BlockConfig> = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let source = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        let base_dir = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.clone());
        Ok(Self {
            source: Some(source),
            base_dir,
            blocks,
        })
    }

    pub fn builtin(base_dir: PathBuf) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(
            DEFAULT_BLOCK.to_string(),
            BlockConfig {
                kind: Some("local".to_string()),
                ..BlockConfig::default()
            },
        );
        Self {
            source: None,
            base_dir,
            blocks,
        }
    }

    pub fn block_names(&self) -> Vec<String> {
        self.blocks.keys().cloned().collect()
    }

    /// Resolves one block into process-wide settings. Without an explicit
    /// name the only block is used, or `LOCAL` when several exist.
    pub fn select(&self, block: Option<&str>) -> Result<Settings> {
        let name = match block {
            Some(name) => name.to_string(),
            None if self.blocks.len() == 1 => self.block_names().remove(0),
            None if self.blocks.contains_key(DEFAULT_BLOCK) => DEFAULT_BLOCK.to_string(),
            None => {
                return Err(Error::Config(format!(
                    "several configuration blocks and none selected: {}",
                    self.block_names().join(", ")
                )))
            }
        };
        let cfg = self.blocks.get(&name).ok_or_else(|| {
            Error::Config(format!(
                "configuration block '{}' not found (available: {})",
                name,
                self.block_names().join(", ")
            ))
        })?;
        Settings::resolve(&name, cfg, &self.base_dir, self.source.clone())
    }
}

/// Immutable per-process settings resolved from one configuration block.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub block: String,
    pub location: Location,
    pub config_path: Option<PathBuf>,
    pub sim_root: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub max_local_sims: usize,
    pub max_threads: usize,
    pub sims_per_batch: usize,
    pub endpoint: Option<String>,
    pub token_env: Option<String>,
    pub environment: Option<String>,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
}

fn absolutize(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

impl Settings {
    fn resolve(
        name: &str,
        cfg: &BlockConfig,
        base_dir: &Path,
        config_path: Option<PathBuf>,
    ) -> Result<Self> {
        let location = match cfg.kind.as_deref() {
            Some(kind) => kind.parse::<Location>()?,
            None if name.eq_ignore_ascii_case(DEFAULT_BLOCK) => Location::Local,
            None => {
                return Err(Error::Config(format!(
                    "block '{}' does not declare a type",
                    name
                )))
            }
        };
        let state_dir = absolutize(
            base_dir,
            cfg.state_dir
                .as_deref()
                .unwrap_or_else(|| Path::new(".simtools")),
        );
        let db_path = cfg
            .db_path
            .as_deref()
            .map(|p| absolutize(base_dir, p))
            .unwrap_or_else(|| state_dir.join("simtools.db"));
        let sim_root = absolutize(
            base_dir,
            cfg.sim_root
                .as_deref()
                .unwrap_or_else(|| Path::new("simulations")),
        );
        let settings = Self {
            block: name.to_string(),
            location,
            config_path,
            sim_root,
            state_dir,
            db_path,
            max_local_sims: cfg.max_local_sims.unwrap_or(4),
            max_threads: cfg.max_threads.unwrap_or(16),
            sims_per_batch: cfg.sims_per_batch.unwrap_or(50),
            endpoint: cfg.endpoint.clone(),
            token_env: cfg.token_env.clone(),
            environment: cfg.environment.clone(),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs.unwrap_or(30)),
            poll_interval: Duration::from_secs(cfg.poll_interval_secs.unwrap_or(10)),
            max_retries: cfg.max_retries.unwrap_or(3),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults for a local block rooted at `root`; used by tests and
    /// embedders that skip the setup file.
    pub fn local(root: &Path) -> Self {
        Self {
            block: DEFAULT_BLOCK.to_string(),
            location: Location::Local,
            config_path: None,
            sim_root: root.join("simulations"),
            state_dir: root.join(".simtools"),
            db_path: root.join(".simtools").join("simtools.db"),
            max_local_sims: 4,
            max_threads: 16,
            sims_per_batch: 50,
            endpoint: None,
            token_env: None,
            environment: None,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            max_retries: 3,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_local_sims == 0 || self.max_threads == 0 || self.sims_per_batch == 0 {
            return Err(Error::Config(format!(
                "block '{}': concurrency ceilings and batch size must be positive",
                self.block
            )));
        }
        if self.location == Location::Remote
            && self.endpoint.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(Error::Config(format!(
                "remote block '{}' requires an endpoint",
                self.block
            )));
        }
        Ok(())
    }

    /// Creates the working directories, failing with a configuration error
    /// when they cannot be used.
    pub fn prepare_dirs(&self) -> Result<()> {
        for dir in [&self.sim_root, &self.state_dir] {
            ensure_dir(dir).map_err(|e| {
                Error::Config(format!("unusable directory {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Bearer token read from the environment variable named in the block.
    pub fn token(&self) -> Option<String> {
        self.token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.trim().is_empty())
    }

    pub fn overseer_lock_path(&self) -> PathBuf {
        self.state_dir.join("overseer.lock")
    }

    pub fn overseer_log_path(&self) -> PathBuf {
        self.state_dir.join("overseer.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::atomic_write_bytes;
    use chrono::Utc;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "simtools_config_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    #[test]
    fn missing_file_falls_back_to_builtin_local_block() {
        let root = temp_root("missing");
        let cfg = SetupConfig::load(&root.join("nope.yaml")).expect("builtin");
        let settings = cfg.select(None).expect("local");
        assert_eq!(settings.block, "LOCAL");
        assert_eq!(settings.location, Location::Local);
        assert_eq!(settings.max_local_sims, 4);
        assert_eq!(settings.max_threads, 16);
        assert_eq!(settings.sims_per_batch, 50);
        assert!(settings.db_path.ends_with(".simtools/simtools.db"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn blocks_resolve_relative_to_config_file() {
        let root = temp_root("blocks");
        let path = root.join("simtools.yaml");
        let yaml = r#"
LOCAL:
  type: local
  sim_root: sims
  max_local_sims: 2
HPC:
  type: remote
  endpoint: http://cluster.example
  token_env: SIMTOOLS_TEST_TOKEN
  environment: Belegost
  request_timeout_secs: 5
"#;
        atomic_write_bytes(&path, yaml.as_bytes()).expect("write config");
        let cfg = SetupConfig::load(&path).expect("load");
        let local = cfg.select(None).expect("default block");
        assert_eq!(local.sim_root, root.join("sims"));
        assert_eq!(local.max_local_sims, 2);
        assert_eq!(local.config_path.as_deref(), Some(path.as_path()));

        let hpc = cfg.select(Some("HPC")).expect("remote");
        assert_eq!(hpc.location, Location::Remote);
        assert_eq!(hpc.request_timeout, Duration::from_secs(5));
        assert_eq!(hpc.environment.as_deref(), Some("Belegost"));

        let err = cfg.select(Some("NOPE")).expect_err("missing block");
        assert!(matches!(err, Error::Config(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remote_block_without_endpoint_is_a_config_error() {
        let root = temp_root("remote");
        let path = root.join("simtools.yaml");
        atomic_write_bytes(&path, b"HPC:\n  type: remote\n").expect("write");
        let cfg = SetupConfig::load(&path).expect("load");
        let err = cfg.select(None).expect_err("endpoint required");
        assert!(err.to_string().contains("requires an endpoint"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let root = temp_root("unknown");
        let path = root.join("simtools.yaml");
        atomic_write_bytes(&path, b"LOCAL:\n  max_sims: 3\n").expect("write");
        assert!(matches!(
            SetupConfig::load(&path).expect_err("unknown key"),
            Error::Config(_)
        ));
        let _ = fs::remove_dir_all(root);
    }
}
