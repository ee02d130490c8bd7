pub mod config;
pub mod job;
pub mod uniq_id;

pub use config::{Config, ConfigError, LoggingConfig, SpoolConfig, UploadConfig};
pub use job::JobRun;
pub use uniq_id::{encode_job_id, uniq_run_id, Marker, UniqRunId};

// Production paths (follow FHS - Filesystem Hierarchy Standard)
pub const DEFAULT_SPOOL_DIR: &str = "/var/lib/jobmon/spool";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jobmon/jobmon.yaml";
