use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

const RESERVED_KEYS: [&str; 3] = ["ID", "StartedAt", "Errors"];

/// One execution of a logical job.
///
/// `id` is stable across repeated runs of the same job, `started_at` tells
/// the runs apart. Everything the runner records about the outcome lives in
/// `result` and is persisted as extra top-level JSON keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRun {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "StartedAt", with = "chrono::serde::ts_seconds")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "Errors", default, deserialize_with = "null_as_empty")]
    errors: Vec<String>,
    #[serde(flatten)]
    pub result: Map<String, Value>,
}

impl JobRun {
    pub fn new(id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            started_at,
            errors: Vec::new(),
            result: Map::new(),
        }
    }

    /// Starts a run now. Sub-second precision is dropped because the spool
    /// only keeps whole seconds.
    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, Utc::now().trunc_subsecs(0))
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Stores a caller-owned result field. Returns `false` (and stores
    /// nothing) for keys that would shadow the identity fields.
    pub fn set_result(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            return false;
        }
        self.result.insert(key, value.into());
        true
    }

    pub fn result(&self, key: &str) -> Option<&Value> {
        self.result.get(key)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}
