use crate::Services;
use anyhow::{Context, Result};
use sim_core::process::pid_alive;
use sim_core::{LockFile, Settings};
use sim_store::JobStore;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

pub const OVERSEER_PID_KEY: &str = "overseer_pid";
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Finds or starts the single overseer process for a state directory.
pub struct DaemonHandle {
    settings: Arc<Settings>,
    store: JobStore,
    program: PathBuf,
    args: Vec<String>,
}

impl DaemonHandle {
    /// Launches `<current exe> [--config <file>] --block <block> overseer`.
    pub fn new(services: &Services) -> Result<Self> {
        let program = std::env::current_exe().context("locating the simtools executable")?;
        let mut args = Vec::new();
        if let Some(config) = &services.settings.config_path {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        args.push("--block".to_string());
        args.push(services.settings.block.clone());
        args.push("overseer".to_string());
        Ok(Self::with_command(services, program, args))
    }

    pub fn with_command(services: &Services, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            settings: Arc::clone(&services.settings),
            store: services.store.clone(),
            program: program.into(),
            args,
        }
    }

    /// Pid of the recorded overseer when it is still alive.
    pub fn running_pid(&self) -> Result<Option<u32>> {
        let Some(raw) = self.store.get_setting(OVERSEER_PID_KEY)? else {
            return Ok(None);
        };
        Ok(raw.trim().parse::<u32>().ok().filter(|pid| pid_alive(*pid)))
    }

    /// Returns the live overseer's pid, spawning a detached one first when
    /// none is recorded.
    pub fn ensure_running(&self) -> Result<u32> {
        let _lock = LockFile::acquire(&self.settings.overseer_lock_path(), LOCK_TIMEOUT)?;
        if let Some(pid) = self.running_pid()? {
            debug!(pid, "overseer already running");
            return Ok(pid);
        }
        let log_path = self.settings.overseer_log_path();
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening {}", log_path.display()))?;
        let err_log = log.try_clone()?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .spawn()
            .with_context(|| format!("spawning overseer {}", self.program.display()))?;
        let pid = child.id();
        self.store.set_setting(OVERSEER_PID_KEY, &pid.to_string())?;
        // Reap the child if it exits while this process is still around.
        thread::spawn(move || {
            let _ = child.wait();
        });
        info!(pid, log = %log_path.display(), "overseer spawned");
        Ok(pid)
    }

    /// Records the calling process as the overseer. Returns false when a
    /// different live overseer is already recorded.
    pub fn register_current(&self) -> Result<bool> {
        let _lock = LockFile::acquire(&self.settings.overseer_lock_path(), LOCK_TIMEOUT)?;
        let me = std::process::id();
        if let Some(pid) = self.running_pid()? {
            if pid != me {
                return Ok(false);
            }
        }
        self.store.set_setting(OVERSEER_PID_KEY, &me.to_string())?;
        Ok(true)
    }

    pub fn unregister_current(&self) -> Result<()> {
        let me = std::process::id().to_string();
        if self.store.get_setting(OVERSEER_PID_KEY)?.as_deref() == Some(me.as_str()) {
            self.store.clear_setting(OVERSEER_PID_KEY)?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;
    use sim_core::process::terminate_pid;
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "simtools_daemon_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn sleeper(services: &Services) -> DaemonHandle {
        DaemonHandle::with_command(
            services,
            "sh",
            vec!["-c".to_string(), "echo overseer up; sleep 5".to_string()],
        )
    }

    #[test]
    fn ensure_running_spawns_once() {
        let root = temp_root("once");
        let services = Services::open(Settings::local(&root)).expect("services");
        let handle = sleeper(&services);
        assert_eq!(handle.running_pid().expect("pid"), None);

        let pid = handle.ensure_running().expect("spawn");
        assert_eq!(handle.ensure_running().expect("again"), pid);
        assert_eq!(handle.running_pid().expect("pid"), Some(pid));
        assert!(!services.settings.overseer_lock_path().exists());

        let log_path = services.settings.overseer_log_path();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !fs::read_to_string(&log_path).unwrap_or_default().contains("overseer up")
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(fs::read_to_string(&log_path).expect("log").contains("overseer up"));

        terminate_pid(pid);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handle.running_pid().expect("pid").is_some() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(handle.running_pid().expect("pid"), None);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn register_defers_to_a_live_overseer() {
        let root = temp_root("register");
        let services = Services::open(Settings::local(&root)).expect("services");
        let handle = sleeper(&services);

        assert!(handle.register_current().expect("register"));
        assert_eq!(handle.running_pid().expect("pid"), Some(std::process::id()));
        handle.unregister_current().expect("unregister");
        assert_eq!(handle.running_pid().expect("pid"), None);

        let other = handle.ensure_running().expect("spawn");
        assert!(!handle.register_current().expect("register"));
        handle.unregister_current().expect("unregister is a no-op");
        assert_eq!(handle.running_pid().expect("pid"), Some(other));
        terminate_pid(other);
        let _ = fs::remove_dir_all(root);
    }
}
