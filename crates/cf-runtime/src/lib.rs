#![forbid(unsafe_code)]

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheduling knobs for update processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePolicy {
    /// Delay before a deferred update is attempted again.
    pub retry_delay_ms: u64,
    /// Lifetime of an update lease; an expired lease no longer blocks.
    pub lease_ttl_ms: u64,
    /// Deferrals allowed per update before it is rejected. `None` retries
    /// forever.
    pub max_retries: Option<u32>,
}

impl UpdatePolicy {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            retry_delay_ms: 5_000,
            lease_ttl_ms: 60_000,
            max_retries: None,
        }
    }

    /// No retry delay; suited to in-process use and tests.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            retry_delay_ms: 0,
            ..Self::standard()
        }
    }

    /// Read a policy from JSON; absent fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, RuntimeError> {
        Ok(serde_json::from_str(raw)?)
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Whether an update deferred `attempts` times must now be given up.
    #[must_use]
    pub fn retries_exhausted(&self, attempts: u32) -> bool {
        self.max_retries.is_some_and(|max| attempts >= max)
    }
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Identity of one logical update, ordered by issue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UpdateId(pub u64);

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "update-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Applied,
    Deferred,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub ts_unix_ms: u64,
    pub update_id: UpdateId,
    pub dataset_id: String,
    pub action: DecisionAction,
    pub attempt: u32,
    pub detail: String,
}

impl DecisionRecord {
    #[must_use]
    pub fn new(
        update_id: UpdateId,
        dataset_id: impl Into<String>,
        action: DecisionAction,
        attempt: u32,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            ts_unix_ms: now_unix_ms().unwrap_or_default(),
            update_id,
            dataset_id: dataset_id.into(),
            action,
            attempt,
            detail: detail.into(),
        }
    }
}

/// Append-only log of what happened to every processed update.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationLedger {
    records: Vec<DecisionRecord>,
}

impl PropagationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: DecisionRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[DecisionRecord] {
        &self.records
    }

    #[must_use]
    pub fn count(&self, action: DecisionAction) -> usize {
        self.records
            .iter()
            .filter(|record| record.action == action)
            .count()
    }

    pub fn for_dataset<'a>(
        &'a self,
        dataset_id: &'a str,
    ) -> impl Iterator<Item = &'a DecisionRecord> + 'a {
        self.records
            .iter()
            .filter(move |record| record.dataset_id == dataset_id)
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
    #[error("invalid update policy: {0}")]
    Config(#[from] serde_json::Error),
}

fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}
