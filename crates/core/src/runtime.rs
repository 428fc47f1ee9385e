//! Runtime knobs that would otherwise be ambient global state.
//!
//! A `RuntimeConfig` is passed explicitly to every component that needs a
//! clock or an id source, so deterministic runs (snapshots, replays) only
//! need a different value at construction time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// When set, every timestamp produced by the runtime is this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_time: Option<DateTime<Utc>>,

    /// Sequential event ids (`evt-000001`) instead of random UUIDs.
    #[serde(default)]
    pub deterministic_ids: bool,
}

impl RuntimeConfig {
    /// Fixed clock + sequential ids.
    pub fn deterministic(at: DateTime<Utc>) -> Self {
        Self {
            fixed_time: Some(at),
            deterministic_ids: true,
        }
    }

    /// The current time according to this config.
    pub fn now(&self) -> DateTime<Utc> {
        self.fixed_time.unwrap_or_else(Utc::now)
    }
}
