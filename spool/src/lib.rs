//! Filesystem spool of job runs.
//!
//! A runner registers a run with [`SpoolManager::new_job`] before executing
//! the check and hands the final state to [`SpoolManager::finish_job`]. An
//! uploader drains [`SpoolManager::finished_jobs`] and removes what it
//! delivered with [`SpoolManager::remove_jobs`].

pub mod error;
pub mod lock;
pub mod manager;
pub mod store;

pub use error::{Result, SpoolError};
pub use lock::{JobLock, LockCoordinator, RetryPolicy};
pub use manager::{is_duplicate_record, SpoolEntry, SpoolManager, ERR_JOB_ALREADY_RUNNING};
pub use store::SpoolStore;
