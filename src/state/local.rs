//! Local file-based run store.
//!
//! Layout under the state directory:
//!
//! ```text
//! history.json        last runs, oldest first
//! locks/<plan>.lock   run lock per plan
//! stamps/...          checksums written by actions
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, RunLock, generate_holder_id};
use super::store::RunStore;
use super::types::{HISTORY_VERSION, RunHistory, RunRecord};

/// History file name.
const HISTORY_FILE: &str = "history.json";

/// Lock directory name.
const LOCK_DIR: &str = "locks";

/// Local file-based run store.
#[derive(Debug)]
pub struct LocalRunStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the history file.
    history_path: PathBuf,
    /// Serializes read-modify-write of the history file.
    history_guard: Mutex<()>,
}

impl LocalRunStore {
    /// Creates a run store in a state directory.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let history_path = base_dir.join(HISTORY_FILE);

        Self {
            base_dir,
            history_path,
            history_guard: Mutex::new(()),
        }
    }

    /// State directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of a plan's lock file.
    #[must_use]
    pub fn lock_path(&self, plan: &str) -> PathBuf {
        self.base_dir.join(LOCK_DIR).join(format!("{plan}.lock"))
    }

    async fn read_history(&self) -> Result<RunHistory> {
        let content = match fs::read_to_string(&self.history_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("History file does not exist: {}", self.history_path.display());
                return Ok(RunHistory::new());
            }
            Err(e) => {
                return Err(ConvergeError::State(StateError::Corrupted {
                    message: format!("Failed to read history file: {e}"),
                }));
            }
        };

        let history: RunHistory = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse history file: {e}"),
            })
        })?;

        if history.version != HISTORY_VERSION {
            return Err(ConvergeError::State(StateError::VersionMismatch {
                expected: HISTORY_VERSION.to_string(),
                found: history.version,
            }));
        }

        Ok(history)
    }

    async fn write_history(&self, history: &RunHistory) -> Result<()> {
        let content = serde_json::to_string_pretty(history)
            .map_err(|e| ConvergeError::State(StateError::serialization(format!("Failed to serialize history: {e}"))))?;

        crate::system::write_atomic(&self.history_path, content.as_bytes())
            .await
            .map_err(|e| ConvergeError::State(StateError::write(e.to_string())))?;

        debug!("History saved to: {}", self.history_path.display());
        Ok(())
    }

    /// Creates the lock file; `Ok(None)` if it already exists.
    async fn create_lock_file(&self, path: &Path, info: &LockInfo) -> Result<Option<()>> {
        let lock_failed = |message: String| ConvergeError::State(StateError::LockFailed { message });

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| lock_failed(format!("Failed to create lock directory: {e}")))?;
        }

        let content = serde_json::to_string_pretty(info)
            .map_err(|e| ConvergeError::State(StateError::serialization(format!("Failed to serialize lock: {e}"))))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(lock_failed(format!("Failed to create lock file: {e}"))),
        };

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed(format!("Failed to write lock file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| lock_failed(format!("Failed to sync lock file: {e}")))?;

        Ok(Some(()))
    }
}

#[async_trait]
impl RunStore for LocalRunStore {
    async fn load_history(&self) -> Result<RunHistory> {
        self.read_history().await
    }

    async fn record_run(&self, record: RunRecord) -> Result<()> {
        let _guard = self.history_guard.lock().await;
        let mut history = self.read_history().await?;
        info!("Recording run of plan '{}' ({})", record.plan, record.status);
        history.push(record);
        self.write_history(&history).await
    }

    async fn clear_history(&self) -> Result<()> {
        let _guard = self.history_guard.lock().await;
        match fs::remove_file(&self.history_path).await {
            Ok(()) => {
                info!("Deleted history file: {}", self.history_path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConvergeError::State(StateError::write(format!(
                "Failed to delete history file: {e}"
            )))),
        }
    }

    async fn acquire_lock(&self, plan: &str, holder: &str) -> Result<RunLock> {
        let path = self.lock_path(plan);
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        // Second pass only after removing a stale lock.
        for _ in 0..2 {
            let info = LockInfo::new(plan, &holder_id);
            if self.create_lock_file(&path, &info).await?.is_some() {
                info!(
                    "Acquired run lock for '{}': {} (expires in {}s)",
                    plan, info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(RunLock::new(path, info));
            }

            match LockInfo::read(&path).await {
                Ok(Some(existing)) if !existing.is_expired() => {
                    return Err(ConvergeError::State(StateError::LockedByOther {
                        plan: plan.to_string(),
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }));
                }
                Ok(_) | Err(_) => {
                    debug!("Stale or unreadable lock found for '{}', taking over", plan);
                    match fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(ConvergeError::State(StateError::LockFailed {
                                message: format!("Failed to remove stale lock: {e}"),
                            }));
                        }
                    }
                }
            }
        }

        Err(ConvergeError::State(StateError::LockFailed {
            message: format!("Lost the race for the lock of plan '{plan}'"),
        }))
    }

    async fn lock_info(&self, plan: &str) -> Result<Option<LockInfo>> {
        LockInfo::read(&self.lock_path(plan)).await
    }

    async fn force_unlock(&self, plan: &str) -> Result<bool> {
        let path = self.lock_path(plan);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed lock for plan '{}'", plan);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ConvergeError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
