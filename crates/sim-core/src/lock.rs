use crate::error::{Error, Result};
use crate::fsutil::ensure_dir;
use crate::process::pid_alive;
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Interprocess lock held as a create-new file carrying the owner's pid.
/// Released on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_owner(path: &Path) -> Option<u32> {
    let raw = fs::read(path).ok()?;
    let payload: Value = serde_json::from_slice(&raw).ok()?;
    payload
        .get("pid")
        .and_then(Value::as_u64)
        .and_then(|p| u32::try_from(p).ok())
}

impl LockFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Single attempt. A lock left behind by a dead process is removed and
    /// taken over.
    pub fn try_acquire(path: &Path) -> Result<LockFile> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let payload = format!(
                        "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                        std::process::id(),
                        Utc::now().to_rfc3339()
                    );
                    let _ = file.write_all(payload.as_bytes());
                    let _ = file.sync_all();
                    return Ok(LockFile {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match lock_owner(path) {
                        Some(pid) if pid_alive(pid) => {
                            return Err(Error::Lock(format!(
                                "{} is held by pid {}",
                                path.display(),
                                pid
                            )))
                        }
                        owner => {
                            warn!(path = %path.display(), ?owner, "removing stale lock");
                            let _ = fs::remove_file(path);
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Lock(format!("{} could not be acquired", path.display())))
    }

    /// Retries until `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<LockFile> {
        let started = Instant::now();
        loop {
            match Self::try_acquire(path) {
                Ok(lock) => return Ok(lock),
                Err(Error::Lock(msg)) => {
                    if started.elapsed() >= timeout {
                        return Err(Error::Lock(msg));
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
