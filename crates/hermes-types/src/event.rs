use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine-internal notification published on the event bus: limiter
/// countdowns, loop progress, breaker transitions, merge results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub name: String,
    pub payload: Value,
    pub time: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            time: Utc::now(),
        }
    }
}
