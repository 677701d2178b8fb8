use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hermes_types::{EngineEvent, HermesError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::events::EventBus;

const HISTORY_LIMIT: usize = 100;
const OPEN_AFTER_NO_PROGRESS: u32 = 3;
const OPEN_AFTER_SAME_ERROR: u32 = 5;
const HALF_OPEN_AFTER_NO_PROGRESS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerPhase {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerPhase::Closed => "CLOSED",
            BreakerPhase::HalfOpen => "HALF_OPEN",
            BreakerPhase::Open => "OPEN",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerState {
    pub state: BreakerPhase,
    pub consecutive_no_progress: u32,
    pub consecutive_same_error: u32,
    pub last_progress_loop: u32,
    pub current_loop: u32,
    pub total_opens: u32,
    pub reason: String,
    pub last_change_time: DateTime<Utc>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: BreakerPhase::Closed,
            consecutive_no_progress: 0,
            consecutive_same_error: 0,
            last_progress_loop: 0,
            current_loop: 0,
            total_opens: 0,
            reason: String::new(),
            last_change_time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub from: BreakerPhase,
    pub to: BreakerPhase,
    pub reason: String,
    pub loop_number: u32,
    pub timestamp: DateTime<Utc>,
}

/// Per-loop facts fed to the breaker.
#[derive(Debug, Clone, Copy)]
pub struct LoopOutcome {
    pub files_changed: usize,
    pub has_errors: bool,
    pub output_length: usize,
    pub loop_number: u32,
}

/// Stagnation detector. CLOSED is normal operation, HALF_OPEN is probation
/// after two loops without progress, OPEN halts the run until a manual
/// reset. The breaker is the canonical stagnation signal; the execution
/// loop never decides to halt for these reasons on its own.
pub struct CircuitBreaker {
    state_path: PathBuf,
    history_path: PathBuf,
    inner: Mutex<BreakerInner>,
    events: EventBus,
}

struct BreakerInner {
    state: BreakerState,
    history: Vec<BreakerTransition>,
}

impl CircuitBreaker {
    pub async fn load(
        state_path: impl Into<PathBuf>,
        history_path: impl Into<PathBuf>,
        events: EventBus,
    ) -> Result<Self, HermesError> {
        let state_path = state_path.into();
        let history_path = history_path.into();
        let state = read_json_or_default(&state_path).await;
        let history = read_json_or_default(&history_path).await;
        Ok(Self {
            state_path,
            history_path,
            inner: Mutex::new(BreakerInner { state, history }),
            events,
        })
    }

    pub async fn can_execute(&self) -> bool {
        self.inner.lock().await.state.state != BreakerPhase::Open
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state.clone()
    }

    pub async fn history(&self) -> Vec<BreakerTransition> {
        self.inner.lock().await.history.clone()
    }

    /// Feed one loop's outcome. Returns `false` iff this recording caused a
    /// transition into OPEN, letting the caller break out without another
    /// `can_execute` round-trip.
    pub async fn record(&self, outcome: LoopOutcome) -> Result<bool, HermesError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let state = &mut inner.state;
        state.current_loop = outcome.loop_number;

        if outcome.files_changed > 0 {
            state.consecutive_no_progress = 0;
            state.last_progress_loop = outcome.loop_number;
        } else {
            state.consecutive_no_progress += 1;
        }
        if outcome.has_errors {
            state.consecutive_same_error += 1;
        } else {
            state.consecutive_same_error = 0;
        }

        // Rules are evaluated in severity order. A half-open breaker that
        // keeps stalling opens with the same canonical reason as a closed
        // one, since the count it reports is the same consecutive streak.
        let transition = match state.state {
            BreakerPhase::Open => None,
            phase => {
                if state.consecutive_no_progress >= OPEN_AFTER_NO_PROGRESS {
                    Some((
                        BreakerPhase::Open,
                        format!("no progress in {OPEN_AFTER_NO_PROGRESS} loops"),
                    ))
                } else if state.consecutive_same_error >= OPEN_AFTER_SAME_ERROR {
                    Some((
                        BreakerPhase::Open,
                        format!("same error repeated {OPEN_AFTER_SAME_ERROR} loops"),
                    ))
                } else if phase == BreakerPhase::HalfOpen && outcome.files_changed > 0 {
                    Some((BreakerPhase::Closed, "recovered".to_string()))
                } else if phase == BreakerPhase::Closed
                    && state.consecutive_no_progress >= HALF_OPEN_AFTER_NO_PROGRESS
                {
                    Some((BreakerPhase::HalfOpen, "monitoring".to_string()))
                } else {
                    None
                }
            }
        };

        let mut opened = false;
        if let Some((to, reason)) = transition {
            let from = state.state;
            opened = to == BreakerPhase::Open;
            if opened {
                state.total_opens += 1;
            }
            state.state = to;
            state.reason = reason.clone();
            state.last_change_time = Utc::now();
            let record = BreakerTransition {
                from,
                to,
                reason: reason.clone(),
                loop_number: outcome.loop_number,
                timestamp: state.last_change_time,
            };
            inner.history.push(record);
            let overflow = inner.history.len().saturating_sub(HISTORY_LIMIT);
            if overflow > 0 {
                inner.history.drain(..overflow);
            }
            self.events.publish(EngineEvent::new(
                "breaker.transition",
                json!({
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "reason": reason,
                    "loop": outcome.loop_number,
                }),
            ));
            persist(&self.history_path, &inner.history).await?;
        }
        persist(&self.state_path, &inner.state).await?;
        Ok(!opened)
    }

    /// Operator command: force CLOSED and zero the counters.
    pub async fn reset(&self, reason: &str) -> Result<(), HermesError> {
        let mut inner = self.inner.lock().await;
        let from = inner.state.state;
        let at_loop = inner.state.current_loop;
        let last_progress_loop = inner.state.last_progress_loop;
        let total_opens = inner.state.total_opens;
        inner.state = BreakerState {
            reason: reason.to_string(),
            last_change_time: Utc::now(),
            total_opens,
            current_loop: at_loop,
            last_progress_loop,
            ..BreakerState::default()
        };
        let record = BreakerTransition {
            from,
            to: BreakerPhase::Closed,
            reason: reason.to_string(),
            loop_number: at_loop,
            timestamp: inner.state.last_change_time,
        };
        inner.history.push(record);
        let overflow = inner.history.len().saturating_sub(HISTORY_LIMIT);
        if overflow > 0 {
            inner.history.drain(..overflow);
        }
        self.events.publish(EngineEvent::new(
            "breaker.reset",
            json!({"from": from.as_str(), "reason": reason}),
        ));
        persist(&self.history_path, &inner.history).await?;
        persist(&self.state_path, &inner.state).await
    }
}

async fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(path = %path.display(), %err, "corrupt breaker file, starting fresh");
            T::default()
        }),
        Err(_) => T::default(),
    }
}

async fn persist<T: Serialize>(path: &Path, value: &T) -> Result<(), HermesError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)
        .map_err(|err| HermesError::Io(err.to_string()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state.json");
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, raw).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
