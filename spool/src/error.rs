use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = SpoolError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SpoolError {
    /// The run was persisted, but another run of the same job was already
    /// in progress. `uniq_id` is the handle of the persisted record.
    #[error("a job with same ID is already running: {job_id} (recorded as {uniq_id})")]
    AlreadyRunning { job_id: String, uniq_id: String },

    #[error("job {job_id}: could not get lock {path:?} after {attempts} attempts, lockfile owner: {owner}")]
    LockContended {
        job_id: String,
        path: PathBuf,
        attempts: u32,
        owner: String,
        #[source]
        source: io::Error,
    },

    #[error("job {job_id}: could not lock {path:?}")]
    Lock {
        job_id: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not create spool dir {path:?}, check you have enough rights or create the dir manually")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not mark job {job_id} (unique {uniq_id}) as finished")]
    Finish {
        job_id: String,
        uniq_id: String,
        #[source]
        source: io::Error,
    },

    #[error("job {job_id}: spool entry {uniq_id} is already finished")]
    AlreadyFinished { job_id: String, uniq_id: String },

    #[error("{op} {path:?}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("while encoding spool entry to {path:?}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("while decoding file {path:?}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("searching {pattern}")]
    Glob {
        pattern: String,
        #[source]
        source: GlobError,
    },

    #[error("malformed spool entry id {0:?}")]
    InvalidUniqId(String),

    #[error("spool entry {uniq_id} does not belong to job {job_id}")]
    JobIdMismatch { job_id: String, uniq_id: String },
}

#[derive(Debug, Error)]
pub enum GlobError {
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
    #[error(transparent)]
    Entry(#[from] glob::GlobError),
}

impl SpoolError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        SpoolError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, SpoolError::AlreadyRunning { .. })
    }

    /// Handle of the persisted run when the error still left one behind.
    pub fn uniq_id(&self) -> Option<&str> {
        match self {
            SpoolError::AlreadyRunning { uniq_id, .. } => Some(uniq_id),
            _ => None,
        }
    }
}
