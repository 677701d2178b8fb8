use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use hermes_types::{FeatureId, HermesError, TaskId};
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    InProgress,
    Completed,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Completed => "COMPLETED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub task: TaskId,
    pub feature: FeatureId,
    pub started: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub commit: Option<String>,
    pub attempts: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunState {
    pub status: RunStatus,
    pub current_task: Option<TaskId>,
    pub current_feature: Option<FeatureId>,
    pub current_branch: Option<String>,
    pub next_task: Option<TaskId>,
    pub journal: Vec<JournalEntry>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::InProgress,
            current_task: None,
            current_feature: None,
            current_branch: None,
            next_task: None,
            journal: Vec::new(),
        }
    }
}

impl RunState {
    /// Ids of tasks with a finished journal entry.
    pub fn journaled_tasks(&self) -> Vec<TaskId> {
        self.journal.iter().map(|entry| entry.task).collect()
    }
}

/// The durable checkpoint: summary fields plus an append-only journal,
/// rewritten atomically after every status mutation. `IN_PROGRESS` on disk
/// is the signal that resume is possible.
pub struct RunStateStore {
    path: PathBuf,
    inner: Mutex<RunState>,
}

impl RunStateStore {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, HermesError> {
        let path = path.into();
        let state = match fs::read_to_string(&path).await {
            Ok(raw) => parse_run_state(&raw)?,
            Err(_) => RunState::default(),
        };
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    pub async fn snapshot(&self) -> RunState {
        self.inner.lock().await.clone()
    }

    pub async fn is_resumable(&self) -> bool {
        let state = self.inner.lock().await;
        state.status == RunStatus::InProgress
            && (state.current_task.is_some() || !state.journal.is_empty())
    }

    pub async fn begin_task(
        &self,
        task: TaskId,
        feature: FeatureId,
        branch: &str,
    ) -> Result<(), HermesError> {
        let mut state = self.inner.lock().await;
        state.status = RunStatus::InProgress;
        state.current_task = Some(task);
        state.current_feature = Some(feature);
        state.current_branch = Some(branch.to_string());
        self.flush(&state).await
    }

    pub async fn set_next_task(&self, next: Option<TaskId>) -> Result<(), HermesError> {
        let mut state = self.inner.lock().await;
        state.next_task = next;
        self.flush(&state).await
    }

    /// Journal entries land before the plan store flips the task status, so
    /// an interrupted run can never show a finished task without a record.
    pub async fn record_entry(&self, entry: JournalEntry) -> Result<(), HermesError> {
        let mut state = self.inner.lock().await;
        state.journal.push(entry);
        state.current_task = None;
        state.current_branch = None;
        self.flush(&state).await
    }

    pub async fn complete_run(&self) -> Result<(), HermesError> {
        let mut state = self.inner.lock().await;
        state.status = RunStatus::Completed;
        state.current_task = None;
        state.current_feature = None;
        state.current_branch = None;
        state.next_task = None;
        self.flush(&state).await
    }

    async fn flush(&self, state: &RunState) -> Result<(), HermesError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("run-state.md");
        let tmp = self.path.with_file_name(format!("{file_name}.tmp"));
        fs::write(&tmp, render_run_state(state)).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn render_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "-".to_string(),
    }
}

pub fn render_run_state(state: &RunState) -> String {
    let mut out = String::new();
    out.push_str("# Run State\n\n");
    out.push_str(&format!("**Status**: {}\n", state.status.as_str()));
    out.push_str(&format!(
        "**Current Task**: {}\n",
        render_opt(&state.current_task)
    ));
    out.push_str(&format!(
        "**Current Feature**: {}\n",
        render_opt(&state.current_feature)
    ));
    out.push_str(&format!(
        "**Current Branch**: {}\n",
        render_opt(&state.current_branch)
    ));
    out.push_str(&format!(
        "**Next Task**: {}\n",
        render_opt(&state.next_task)
    ));
    out.push_str("\n## Journal\n\n");
    for entry in &state.journal {
        let errors = if entry.errors.is_empty() {
            "-".to_string()
        } else {
            entry
                .errors
                .iter()
                .map(|e| e.replace(['|', ';'], ","))
                .collect::<Vec<_>>()
                .join("; ")
        };
        out.push_str(&format!(
            "- {} | {} | started {} | completed {} | {}s | commit {} | attempts {} | errors {}\n",
            entry.task,
            entry.feature,
            entry.started.to_rfc3339(),
            entry
                .completed
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            entry.duration_seconds,
            entry.commit.as_deref().unwrap_or("-"),
            entry.attempts,
            errors
        ));
    }
    out
}

fn state_parse_error(detail: impl std::fmt::Display) -> HermesError {
    HermesError::invalid_plan(format!("run-state.md: {detail}"))
}

pub fn parse_run_state(content: &str) -> Result<RunState, HermesError> {
    let mut state = RunState::default();
    let mut in_journal = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("## Journal") {
            in_journal = true;
            continue;
        }
        if !in_journal {
            if let Some(value) = strip_field(trimmed, "**Status**:") {
                state.status = match value {
                    "IN_PROGRESS" => RunStatus::InProgress,
                    "COMPLETED" => RunStatus::Completed,
                    other => return Err(state_parse_error(format!("unknown status `{other}`"))),
                };
            } else if let Some(value) = strip_field(trimmed, "**Current Task**:") {
                state.current_task = parse_opt(value, TaskId::from_str)?;
            } else if let Some(value) = strip_field(trimmed, "**Current Feature**:") {
                state.current_feature = parse_opt(value, FeatureId::from_str)?;
            } else if let Some(value) = strip_field(trimmed, "**Current Branch**:") {
                state.current_branch = (value != "-").then(|| value.to_string());
            } else if let Some(value) = strip_field(trimmed, "**Next Task**:") {
                state.next_task = parse_opt(value, TaskId::from_str)?;
            }
        } else if let Some(rest) = trimmed.strip_prefix("- ") {
            state.journal.push(parse_journal_line(rest)?);
        }
    }
    Ok(state)
}

fn strip_field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key).map(str::trim)
}

fn parse_opt<T>(
    value: &str,
    parse: impl Fn(&str) -> Result<T, HermesError>,
) -> Result<Option<T>, HermesError> {
    if value == "-" {
        Ok(None)
    } else {
        parse(value).map(Some)
    }
}

fn parse_journal_line(line: &str) -> Result<JournalEntry, HermesError> {
    let parts: Vec<&str> = line.split(" | ").map(str::trim).collect();
    if parts.len() != 8 {
        return Err(state_parse_error(format!("malformed journal line `{line}`")));
    }
    let task = TaskId::from_str(parts[0])?;
    let feature = FeatureId::from_str(parts[1])?;
    let started = parts[2]
        .strip_prefix("started ")
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| state_parse_error(format!("bad start time in `{line}`")))?;
    let completed = match parts[3].strip_prefix("completed ") {
        Some("-") => None,
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| state_parse_error(format!("bad completion time in `{line}`")))?,
        ),
        None => return Err(state_parse_error(format!("bad completion field in `{line}`"))),
    };
    let duration_seconds = parts[4]
        .strip_suffix('s')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| state_parse_error(format!("bad duration in `{line}`")))?;
    let commit = parts[5]
        .strip_prefix("commit ")
        .map(str::trim)
        .filter(|c| *c != "-")
        .map(ToString::to_string);
    let attempts = parts[6]
        .strip_prefix("attempts ")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| state_parse_error(format!("bad attempts in `{line}`")))?;
    let errors = match parts[7].strip_prefix("errors ") {
        Some("-") | None => Vec::new(),
        Some(raw) => raw.split("; ").map(ToString::to_string).collect(),
    };
    Ok(JournalEntry {
        task,
        feature,
        started,
        completed,
        duration_seconds,
        commit,
        attempts,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(task: &str, commit: Option<&str>) -> JournalEntry {
        JournalEntry {
            task: task.parse().unwrap(),
            feature: "F001".parse().unwrap(),
            started: Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap(),
            completed: Some(Utc.with_ymd_and_hms(2026, 3, 14, 9, 4, 10).unwrap()),
            duration_seconds: 250,
            commit: commit.map(ToString::to_string),
            attempts: 1,
            errors: Vec::new(),
        }
    }

    #[test]
    fn render_parse_round_trip() {
        let state = RunState {
            status: RunStatus::InProgress,
            current_task: Some("T002".parse().unwrap()),
            current_feature: Some("F001".parse().unwrap()),
            current_branch: Some("feature/F001-demo".to_string()),
            next_task: Some("T003".parse().unwrap()),
            journal: vec![
                entry("T001", Some("abc123")),
                JournalEntry {
                    errors: vec!["timed out".to_string(), "retried".to_string()],
                    attempts: 3,
                    completed: None,
                    commit: None,
                    ..entry("T002", None)
                },
            ],
        };
        let rendered = render_run_state(&state);
        let parsed = parse_run_state(&rendered).expect("parse");

        assert_eq!(parsed.status, RunStatus::InProgress);
        assert_eq!(parsed.current_task, state.current_task);
        assert_eq!(parsed.current_branch, state.current_branch);
        assert_eq!(parsed.next_task, state.next_task);
        assert_eq!(parsed.journal, state.journal);
    }

    #[tokio::test]
    async fn store_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-state.md");
        {
            let store = RunStateStore::load(&path).await.unwrap();
            store
                .begin_task(
                    "T001".parse().unwrap(),
                    "F001".parse().unwrap(),
                    "feature/F001-demo",
                )
                .await
                .unwrap();
            store.record_entry(entry("T001", Some("abc"))).await.unwrap();
        }
        let store = RunStateStore::load(&path).await.unwrap();
        assert!(store.is_resumable().await);
        let state = store.snapshot().await;
        assert_eq!(state.journal.len(), 1);
        assert_eq!(state.journal[0].commit.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn completed_run_is_not_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-state.md");
        let store = RunStateStore::load(&path).await.unwrap();
        store
            .begin_task(
                "T001".parse().unwrap(),
                "F001".parse().unwrap(),
                "feature/F001-demo",
            )
            .await
            .unwrap();
        store.complete_run().await.unwrap();
        assert!(!store.is_resumable().await);

        let reloaded = RunStateStore::load(&path).await.unwrap();
        assert!(!reloaded.is_resumable().await);
        assert_eq!(reloaded.snapshot().await.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn fresh_store_is_a_clean_slate() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::load(dir.path().join("run-state.md"))
            .await
            .unwrap();
        assert!(!store.is_resumable().await);
        assert!(store.snapshot().await.journal.is_empty());
    }
}
