// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-instance lock: refuses to start a second agent process against
//! the same `instance_lock.path`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A held instance lock. Dropping it removes the lock file, allowing a
/// subsequent process to acquire it.
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock at `path`, writing this process's PID into it.
    /// Fails with a clear diagnostic if the file already exists — the
    /// caller is expected to exit immediately rather than retry, since a
    /// second instance running against the same pending store and broker
    /// queues would race with the first.
    pub fn acquire(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                use std::io::Write as _;
                write!(file, "{}", std::process::id())?;
                Ok(Self { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                anyhow::bail!(
                    "instance lock already held at {}; is another agent process already running?",
                    path.display()
                )
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release instance lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid_and_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.lock");
        let lock = InstanceLock::acquire(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_while_held_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.lock");
        let _lock = InstanceLock::acquire(&path).unwrap();
        assert!(InstanceLock::acquire(&path).is_err());
    }

    #[test]
    fn acquire_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run/agent.lock");
        let lock = InstanceLock::acquire(&path).unwrap();
        assert!(path.exists());
        drop(lock);
    }
}
