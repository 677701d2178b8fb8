use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use hermes_types::{EngineEvent, HermesError};
use serde_json::json;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::events::EventBus;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CallWindow {
    hour_key: String,
    count: u32,
}

/// Per-hour call budget with wall-clock reset. `acquire` is the only
/// mutator; when the budget is spent it blocks until the next hour
/// boundary, surfacing countdown ticks on the event bus.
pub struct RateLimiter {
    budget: u32,
    count_path: PathBuf,
    reset_path: PathBuf,
    window: Mutex<CallWindow>,
    events: EventBus,
    clock: Clock,
    tick: Duration,
}

fn hour_key(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H").to_string()
}

fn seconds_until_next_hour(now: DateTime<Utc>) -> u64 {
    3600 - u64::from(now.minute()) * 60 - u64::from(now.second())
}

impl RateLimiter {
    pub async fn load(
        budget: u32,
        count_path: impl Into<PathBuf>,
        reset_path: impl Into<PathBuf>,
        events: EventBus,
    ) -> Result<Self, HermesError> {
        let count_path = count_path.into();
        let reset_path = reset_path.into();
        let clock: Clock = Arc::new(Utc::now);
        let stored_key = read_trimmed(&reset_path).await;
        let stored_count = read_trimmed(&count_path)
            .await
            .and_then(|raw| raw.parse::<u32>().ok());
        let window = CallWindow {
            hour_key: stored_key.unwrap_or_else(|| hour_key((clock)())),
            count: stored_count.unwrap_or(0),
        };
        Ok(Self {
            budget,
            count_path,
            reset_path,
            window: Mutex::new(window),
            events,
            clock,
            tick: Duration::from_secs(30),
        })
    }

    /// Test hook: replace the wall clock.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Test hook: countdown granularity while blocked.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Calls made in the current hour window.
    pub async fn calls_made(&self) -> u32 {
        let window = self.window.lock().await;
        if window.hour_key == hour_key((self.clock)()) {
            window.count
        } else {
            0
        }
    }

    /// Take one call slot, blocking across the hour boundary if the budget
    /// is spent. The hour-roll check and the increment are atomic under the
    /// window lock, so no more than `budget` acquisitions can land in one
    /// wall-clock hour.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), HermesError> {
        loop {
            {
                let mut window = self.window.lock().await;
                let key = hour_key((self.clock)());
                if window.hour_key != key {
                    window.hour_key = key;
                    window.count = 0;
                }
                if window.count < self.budget {
                    window.count += 1;
                    self.persist(&window).await?;
                    return Ok(());
                }
            }

            let now = (self.clock)();
            let wait = seconds_until_next_hour(now);
            self.events.publish(EngineEvent::new(
                "rate_limit.waiting",
                json!({"seconds_remaining": wait, "budget": self.budget}),
            ));
            info!(seconds_remaining = wait, budget = self.budget, "hourly call budget spent, waiting");
            tokio::select! {
                _ = cancel.cancelled() => return Err(HermesError::Cancelled),
                _ = tokio::time::sleep(self.tick.min(Duration::from_secs(wait.max(1)))) => {}
            }
        }
    }

    /// Wait for the wall-clock hour to change without consuming budget.
    /// Used when the provider itself reports quota exhaustion.
    pub async fn wait_for_hour_roll(&self, cancel: &CancellationToken) -> Result<(), HermesError> {
        let start_key = hour_key((self.clock)());
        loop {
            let now = (self.clock)();
            if hour_key(now) != start_key {
                return Ok(());
            }
            let wait = seconds_until_next_hour(now);
            self.events.publish(EngineEvent::new(
                "rate_limit.quota_pause",
                json!({"seconds_remaining": wait}),
            ));
            tokio::select! {
                _ = cancel.cancelled() => return Err(HermesError::Cancelled),
                _ = tokio::time::sleep(self.tick.min(Duration::from_secs(wait.max(1)))) => {}
            }
        }
    }

    async fn persist(&self, window: &CallWindow) -> Result<(), HermesError> {
        write_trimmed(&self.count_path, &window.count.to_string()).await?;
        write_trimmed(&self.reset_path, &window.hour_key).await
    }
}

async fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .await
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

async fn write_trimmed(path: &Path, content: &str) -> Result<(), HermesError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn fixed_time(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, minute, 0).unwrap()
    }

    async fn limiter(dir: &Path, budget: u32) -> RateLimiter {
        RateLimiter::load(
            budget,
            dir.join(".call_count"),
            dir.join(".last_reset"),
            EventBus::new(),
        )
        .await
        .expect("load")
    }

    #[tokio::test]
    async fn acquires_within_budget_and_persists_count() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter(dir.path(), 3)
            .await
            .with_clock(|| fixed_time(9, 0));
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            limiter.acquire(&cancel).await.unwrap();
        }
        assert_eq!(limiter.calls_made().await, 3);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".call_count")).unwrap(),
            "3"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".last_reset")).unwrap(),
            "2026031409"
        );
    }

    #[tokio::test]
    async fn count_resets_when_hour_rolls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".call_count"), "2").unwrap();
        std::fs::write(dir.path().join(".last_reset"), "2026031408").unwrap();

        let limiter = limiter(dir.path(), 2)
            .await
            .with_clock(|| fixed_time(9, 5));
        let cancel = CancellationToken::new();
        // The stored window is from hour 08; hour 09 starts a fresh budget.
        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.calls_made().await, 1);
    }

    #[tokio::test]
    async fn blocked_acquire_admits_exactly_one_at_the_new_hour() {
        let dir = tempfile::tempdir().unwrap();
        let offset = Arc::new(AtomicI64::new(0));
        let offset_for_clock = offset.clone();
        let limiter = Arc::new(
            limiter(dir.path(), 1)
                .await
                .with_clock(move || {
                    fixed_time(9, 59) + chrono::Duration::seconds(offset_for_clock.load(Ordering::SeqCst))
                })
                .with_tick(Duration::from_millis(5)),
        );
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let mut waiters = tokio::task::JoinSet::new();
        for _ in 0..2 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            waiters.spawn(async move {
                tokio::time::timeout(Duration::from_millis(500), limiter.acquire(&cancel)).await
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Roll into hour 10: budget 1 admits exactly one of the two waiters.
        offset.store(120, Ordering::SeqCst);

        let outcomes: Vec<_> = {
            let mut collected = Vec::new();
            while let Some(joined) = waiters.join_next().await {
                collected.push(joined.unwrap());
            }
            collected
        };
        let admitted = outcomes
            .iter()
            .filter(|r| matches!(r, Ok(Ok(()))))
            .count();
        let still_waiting = outcomes.iter().filter(|r| r.is_err()).count();
        assert_eq!(admitted, 1);
        assert_eq!(still_waiting, 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_a_blocked_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter(dir.path(), 1)
            .await
            .with_clock(|| fixed_time(9, 30))
            .with_tick(Duration::from_millis(5));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }

    #[tokio::test]
    async fn quota_pause_waits_for_hour_roll() {
        let dir = tempfile::tempdir().unwrap();
        let offset = Arc::new(AtomicI64::new(0));
        let offset_for_clock = offset.clone();
        let limiter = limiter(dir.path(), 5)
            .await
            .with_clock(move || {
                fixed_time(9, 59) + chrono::Duration::seconds(offset_for_clock.load(Ordering::SeqCst))
            })
            .with_tick(Duration::from_millis(5));
        let cancel = CancellationToken::new();

        let wait = tokio::time::timeout(
            Duration::from_millis(50),
            limiter.wait_for_hour_roll(&cancel),
        )
        .await;
        assert!(wait.is_err(), "must still be waiting inside the hour");

        offset.store(120, Ordering::SeqCst);
        tokio::time::timeout(
            Duration::from_millis(500),
            limiter.wait_for_hour_roll(&cancel),
        )
        .await
        .expect("rolls over")
        .expect("no error");
    }
}
