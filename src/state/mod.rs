//! State management module for kubeconverge.
//!
//! This module provides the state directory: run history, per-plan run
//! locks and the storage trait behind them.

mod store;
mod local;
mod lock;
mod types;

pub use store::RunStore;
pub use local::LocalRunStore;
pub use lock::{LOCK_EXPIRY_SECS, LOCK_REFRESH_SECS, LockInfo, RunLock, generate_holder_id};
pub use types::{HISTORY_VERSION, MAX_HISTORY, RunHistory, RunRecord};
