//! Run store trait definition.
//!
//! This module defines the common interface for run history and lock
//! storage backends.

use async_trait::async_trait;

use crate::error::Result;
use super::lock::{LockInfo, RunLock};
use super::types::{RunHistory, RunRecord};

/// Trait for run storage backends.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Loads the run history, empty if none was recorded yet.
    async fn load_history(&self) -> Result<RunHistory>;

    /// Appends a finished run to the history.
    async fn record_run(&self, record: RunRecord) -> Result<()>;

    /// Deletes the run history.
    async fn clear_history(&self) -> Result<()>;

    /// Acquires the run lock of a plan.
    ///
    /// Fails if another holder has a lock that has not expired.
    async fn acquire_lock(&self, plan: &str, holder: &str) -> Result<RunLock>;

    /// Gets current lock information for a plan, if locked.
    async fn lock_info(&self, plan: &str) -> Result<Option<LockInfo>>;

    /// Removes a plan's lock regardless of holder.
    ///
    /// Returns true if a lock was removed.
    async fn force_unlock(&self, plan: &str) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl RunStore for Box<dyn RunStore> {
    async fn load_history(&self) -> Result<RunHistory> {
        (**self).load_history().await
    }

    async fn record_run(&self, record: RunRecord) -> Result<()> {
        (**self).record_run(record).await
    }

    async fn clear_history(&self) -> Result<()> {
        (**self).clear_history().await
    }

    async fn acquire_lock(&self, plan: &str, holder: &str) -> Result<RunLock> {
        (**self).acquire_lock(plan, holder).await
    }

    async fn lock_info(&self, plan: &str) -> Result<Option<LockInfo>> {
        (**self).lock_info(plan).await
    }

    async fn force_unlock(&self, plan: &str) -> Result<bool> {
        (**self).force_unlock(plan).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
