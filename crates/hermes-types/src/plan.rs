use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::HermesError;

/// Lifecycle status shared by features and tasks. The document spelling is
/// the SCREAMING_SNAKE form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    NotStarted,
    InProgress,
    Completed,
    Blocked,
    AtRisk,
    Paused,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::NotStarted,
        Status::InProgress,
        Status::Completed,
        Status::Blocked,
        Status::AtRisk,
        Status::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NotStarted => "NOT_STARTED",
            Status::InProgress => "IN_PROGRESS",
            Status::Completed => "COMPLETED",
            Status::Blocked => "BLOCKED",
            Status::AtRisk => "AT_RISK",
            Status::Paused => "PAUSED",
        }
    }

    /// Legal task transitions are monotonic: NOT_STARTED → IN_PROGRESS →
    /// {COMPLETED, BLOCKED}. An operator reset may return a BLOCKED task to
    /// NOT_STARTED; rollback does the same for IN_PROGRESS.
    pub fn can_transition_to(&self, next: Status) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Status::NotStarted, Status::InProgress)
                | (Status::NotStarted, Status::Blocked)
                | (Status::InProgress, Status::Completed)
                | (Status::InProgress, Status::Blocked)
                | (Status::InProgress, Status::NotStarted)
                | (Status::Blocked, Status::NotStarted)
                | (Status::Paused, Status::InProgress)
                | (Status::Paused, Status::NotStarted)
                | (Status::AtRisk, Status::InProgress)
                | (Status::AtRisk, Status::Completed)
                | (Status::AtRisk, Status::Blocked)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Blocked)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = HermesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NOT_STARTED" => Ok(Status::NotStarted),
            "IN_PROGRESS" => Ok(Status::InProgress),
            "COMPLETED" => Ok(Status::Completed),
            "BLOCKED" => Ok(Status::Blocked),
            "AT_RISK" => Ok(Status::AtRisk),
            "PAUSED" => Ok(Status::Paused),
            other => Err(HermesError::invariant(format!(
                "unknown status `{other}`"
            ))),
        }
    }
}

/// Task/feature priority. P1 sorts highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    pub fn rank(&self) -> u8 {
        match self {
            Priority::P1 => 1,
            Priority::P2 => 2,
            Priority::P3 => 3,
            Priority::P4 => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
            Priority::P4 => "P4",
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = HermesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            "P3" => Ok(Priority::P3),
            "P4" => Ok(Priority::P4),
            other => Err(HermesError::invariant(format!(
                "unknown priority `{other}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_document_spelling() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
    }

    #[test]
    fn status_transitions_are_monotonic() {
        assert!(Status::NotStarted.can_transition_to(Status::InProgress));
        assert!(Status::InProgress.can_transition_to(Status::Completed));
        assert!(Status::Blocked.can_transition_to(Status::NotStarted));
        assert!(!Status::Completed.can_transition_to(Status::InProgress));
        assert!(!Status::Completed.can_transition_to(Status::NotStarted));
    }

    #[test]
    fn priority_orders_p1_first() {
        assert!(Priority::P1 < Priority::P2);
        let mut priorities = vec![Priority::P3, Priority::P1, Priority::P4, Priority::P2];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::P1, Priority::P2, Priority::P3, Priority::P4]
        );
    }
}
