//! Spool entry naming.
//!
//! A run instance is identified by `<marker>_<startedAtUnixSeconds>_<hexJobID>`.
//! The same triple builds glob patterns for directory scans. There is no
//! decoding back to the job ID; the payload is authoritative for that.

use chrono::{DateTime, Utc};
use std::fmt;

pub const ENTRY_EXTENSION: &str = "json";
pub const LOCK_PREFIX: &str = "job_";
pub const LOCK_EXTENSION: &str = "lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    Running,
    Finished,
}

impl Marker {
    pub fn as_str(self) -> &'static str {
        match self {
            Marker::Running => "0",
            Marker::Finished => "1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "0" => Some(Marker::Running),
            "1" => Some(Marker::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hex-encodes the raw bytes of a job ID. Output length is `2 * id.len()`.
pub fn encode_job_id(id: &str) -> String {
    hex::encode(id.as_bytes())
}

pub fn uniq_run_id(marker: Marker, started_at: DateTime<Utc>, job_id: &str) -> String {
    format_uniq(marker, started_at.timestamp(), &encode_job_id(job_id))
}

fn format_uniq(marker: Marker, started_at: i64, encoded_job_id: &str) -> String {
    format!("{}_{}_{}", marker, started_at, encoded_job_id)
}

pub fn entry_file_name(uniq_id: &str) -> String {
    format!("{}.{}", uniq_id, ENTRY_EXTENSION)
}

/// File name pattern matching every entry with `marker`, optionally
/// restricted to one encoded job ID.
pub fn entry_pattern(marker: Marker, encoded_job_id: Option<&str>) -> String {
    format!(
        "{}_*_{}.{}",
        marker,
        encoded_job_id.unwrap_or("*"),
        ENTRY_EXTENSION
    )
}

pub fn lock_file_name(encoded_job_id: &str) -> String {
    format!("{}{}.{}", LOCK_PREFIX, encoded_job_id, LOCK_EXTENSION)
}

/// The three segments of an existing uniq ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqRunId {
    pub marker: Marker,
    pub started_at: i64,
    pub encoded_job_id: String,
}

impl UniqRunId {
    pub fn parse(uniq_id: &str) -> Option<Self> {
        let mut parts = uniq_id.splitn(3, '_');
        let marker = Marker::parse(parts.next()?)?;
        let started_at = parts.next()?.parse().ok()?;
        let encoded_job_id = parts.next()?;
        // Only the lowercase form names the job's lock file.
        if encoded_job_id.is_empty() || !encoded_job_id.bytes().all(is_lower_hex) {
            return None;
        }
        Some(Self {
            marker,
            started_at,
            encoded_job_id: encoded_job_id.to_string(),
        })
    }

    pub fn with_marker(&self, marker: Marker) -> Self {
        Self {
            marker,
            ..self.clone()
        }
    }

    pub fn belongs_to(&self, job_id: &str) -> bool {
        self.encoded_job_id == encode_job_id(job_id)
    }
}

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

impl fmt::Display for UniqRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_uniq(self.marker, self.started_at, &self.encoded_job_id))
    }
}
