//! Per-plan run locks.
//!
//! A lock is a JSON file created with exclusive create. The [`RunLock`] guard
//! removes it on [`RunLock::release`], or from `Drop` if the run ends any
//! other way. A stale lock may be taken over by another run, so the guard
//! checks the on-disk lock id before rewriting or removing the file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ConvergeError, Result, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// How often a running plan refreshes its lock, well inside the expiry.
pub const LOCK_REFRESH_SECS: u64 = 60;

/// Information about a run lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Plan the lock guards.
    pub plan: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires unless refreshed.
    pub expires_at: DateTime<Utc>,
}

/// A held run lock.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(plan: &str, holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            plan: plan.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Reads a lock file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn read(path: &Path) -> Result<Option<Self>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConvergeError::State(StateError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }));
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file {}: {e}", path.display()),
            })
        })
    }
}

impl RunLock {
    pub(super) const fn new(path: PathBuf, info: LockInfo) -> Self {
        Self {
            path,
            info,
            released: false,
        }
    }

    /// Gets the lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Gets the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pushes the expiry forward.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockedByOther`] if another run took the lock
    /// over, [`StateError::LockLost`] if the lock file was removed, or an
    /// error if the file cannot be rewritten.
    pub async fn refresh(&mut self) -> Result<()> {
        match LockInfo::read(&self.path).await? {
            Some(current) if current.lock_id == self.info.lock_id => {}
            Some(current) => {
                return Err(ConvergeError::State(StateError::LockedByOther {
                    plan: current.plan,
                    holder: current.holder,
                    since: current.acquired_at.to_rfc3339(),
                }));
            }
            None => {
                return Err(ConvergeError::State(StateError::LockLost {
                    plan: self.info.plan.clone(),
                }));
            }
        }

        self.info.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
        let content = serde_json::to_vec_pretty(&self.info)
            .map_err(|e| ConvergeError::State(StateError::serialization(e.to_string())))?;
        crate::system::write_atomic(&self.path, &content)
            .await
            .map_err(|e| ConvergeError::State(StateError::LockFailed { message: e.to_string() }))
    }

    /// Removes the lock file if it is still ours.
    ///
    /// A lock that another run has taken over is left in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file exists but cannot be removed.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match LockInfo::read(&self.path).await {
            Ok(Some(current)) if current.lock_id == self.info.lock_id => {}
            Ok(Some(current)) => {
                warn!(
                    "Lock for plan '{}' is now held by {}; leaving it in place",
                    self.info.plan, current.holder
                );
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Not releasing unreadable lock {}: {}", self.path.display(), e);
                return Ok(());
            }
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Released run lock: {}", self.info.lock_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConvergeError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Only remove the file if it still carries our lock id.
        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str::<LockInfo>(&content).ok())
            .is_some_and(|info| info.lock_id == self.info.lock_id);
        if ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove lock file {}: {}", self.path.display(), e);
            } else {
                debug!("Released run lock on drop: {}", self.info.lock_id);
            }
        }
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_info_expiry() {
        let info = LockInfo::new("node", "test-holder");
        assert_eq!(info.plan, "node");
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 0);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_drop_removes_own_lock_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.lock");

        let info = LockInfo::new("node", "a");
        std::fs::write(&path, serde_json::to_string(&info).unwrap()).unwrap();
        drop(RunLock::new(path.clone(), info));
        assert!(!path.exists());

        let theirs = LockInfo::new("node", "b");
        std::fs::write(&path, serde_json::to_string(&theirs).unwrap()).unwrap();
        drop(RunLock::new(path.clone(), LockInfo::new("node", "a")));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_refresh_extends_expiry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.lock");
        let info = LockInfo::new("node", "a");
        std::fs::write(&path, serde_json::to_string(&info).unwrap()).unwrap();
        let mut lock = RunLock::new(path.clone(), info.clone());

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        lock.refresh().await.unwrap();

        let stored = LockInfo::read(&path).await.unwrap().unwrap();
        assert!(stored.expires_at > info.expires_at);
        lock.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_taken_over_lock_is_not_refreshed_or_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.lock");
        let ours = LockInfo::new("node", "a");
        let mut lock = RunLock::new(path.clone(), ours);

        let theirs = LockInfo::new("node", "b");
        std::fs::write(&path, serde_json::to_string(&theirs).unwrap()).unwrap();

        let result = lock.refresh().await;
        assert!(matches!(
            result,
            Err(ConvergeError::State(StateError::LockedByOther { ref holder, .. })) if holder == "b"
        ));
        assert_eq!(LockInfo::read(&path).await.unwrap(), Some(theirs.clone()));

        lock.release().await.unwrap();
        assert_eq!(LockInfo::read(&path).await.unwrap(), Some(theirs));
    }

    #[tokio::test]
    async fn test_refresh_of_removed_lock_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.lock");
        let mut lock = RunLock::new(path.clone(), LockInfo::new("node", "a"));

        let result = lock.refresh().await;
        assert!(matches!(result, Err(ConvergeError::State(StateError::LockLost { .. }))));
        assert!(!path.exists());
    }
}
