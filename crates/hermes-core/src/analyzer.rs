use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use hermes_types::HermesError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

const WINDOW_LIMIT: usize = 8;
const TEST_SATURATION_WINDOW: usize = 5;
const TEST_SATURATION_COUNT: usize = 3;
const DONE_SIGNAL_WINDOW: usize = 3;
const DONE_SIGNAL_COUNT: usize = 2;
const STRONG_SIGNAL_WINDOW: usize = 5;
const STRONG_SIGNAL_COUNT: usize = 2;

/// Classification of one completed assistant invocation, combining the
/// output text with the observed working-tree delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseAnalysis {
    pub task_completed: bool,
    pub task_blocked: bool,
    pub block_reason: Option<String>,
    pub progress_observed: bool,
    pub error_observed: bool,
    /// The assistant claims the whole plan is done. A hint, not ground
    /// truth; the loop weighs it through the rolling window.
    pub exit_signal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracefulExitReason {
    TestSaturation,
    CompletionSignals,
    StrongCompletionIndicators,
}

impl GracefulExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GracefulExitReason::TestSaturation => "test saturation",
            GracefulExitReason::CompletionSignals => "repeated completion signals",
            GracefulExitReason::StrongCompletionIndicators => "strong completion indicators",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
struct LoopRecord {
    done_signal: bool,
    strong_completion: bool,
    test_dominated: bool,
}

fn task_complete_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?mi)^\s*\**\s*TASK COMPLETE\b").expect("static marker regex")
    })
}

fn all_complete_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?mi)^\s*\**\s*ALL TASKS COMPLETE\b").expect("static marker regex")
    })
}

fn blocked_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?mi)^\s*\**\s*TASK BLOCKED\s*:?\s*(?P<reason>.*)$")
            .expect("static marker regex")
    })
}

fn error_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?im)(^|\s)(error\[|error:|fatal:|panicked at|traceback \(most recent call last\)|build failed|compilation failed|tests? failed)",
        )
        .expect("static marker regex")
    })
}

fn looks_like_test_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.contains("tests/")
        || lower.contains("/test/")
        || lower.contains("_test.")
        || lower.contains(".test.")
        || lower.contains(".spec.")
        || lower
            .rsplit('/')
            .next()
            .is_some_and(|name| name.starts_with("test_"))
}

/// True when the loop's tree delta is dominated by test files.
pub fn test_dominated(files_changed: &[String]) -> bool {
    if files_changed.is_empty() {
        return false;
    }
    let test_files = files_changed
        .iter()
        .filter(|f| looks_like_test_path(f))
        .count();
    test_files * 5 >= files_changed.len() * 4
}

/// Rolling-window analyzer feeding the execution loop's graceful-exit
/// rules. The window is persisted so the rules survive restarts; it is
/// reset when a new task begins.
pub struct ResponseAnalyzer {
    state_path: PathBuf,
    window: Mutex<VecDeque<LoopRecord>>,
}

impl ResponseAnalyzer {
    pub async fn load(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let window = match fs::read_to_string(&state_path).await {
            Ok(raw) => serde_json::from_str::<VecDeque<LoopRecord>>(&raw).unwrap_or_else(|err| {
                warn!(path = %state_path.display(), %err, "corrupt analyzer state, starting fresh");
                VecDeque::new()
            }),
            Err(_) => VecDeque::new(),
        };
        Self {
            state_path,
            window: Mutex::new(window),
        }
    }

    /// Pure classification: same output and same tree delta always yield
    /// the same analysis.
    pub fn analyze(output: &str, files_changed: &[String]) -> ResponseAnalysis {
        let block_reason = blocked_pattern().captures(output).map(|captures| {
            let reason = captures.name("reason").map(|m| m.as_str().trim()).unwrap_or("");
            if reason.is_empty() {
                "assistant reported the task as blocked".to_string()
            } else {
                reason.to_string()
            }
        });
        ResponseAnalysis {
            task_completed: task_complete_pattern().is_match(output),
            task_blocked: block_reason.is_some(),
            block_reason,
            progress_observed: !files_changed.is_empty(),
            error_observed: error_pattern().is_match(output),
            exit_signal: all_complete_pattern().is_match(output),
        }
    }

    pub async fn record_loop(
        &self,
        analysis: &ResponseAnalysis,
        files_changed: &[String],
    ) -> Result<(), HermesError> {
        let mut window = self.window.lock().await;
        window.push_back(LoopRecord {
            done_signal: analysis.task_completed,
            strong_completion: analysis.exit_signal,
            test_dominated: test_dominated(files_changed),
        });
        while window.len() > WINDOW_LIMIT {
            window.pop_front();
        }
        self.persist(&window).await
    }

    /// A returned reason means "finish this task as successful and stop
    /// looping on it".
    pub async fn graceful_exit_reason(&self) -> Option<GracefulExitReason> {
        let window = self.window.lock().await;
        let recent = |n: usize| window.iter().rev().take(n);

        if recent(TEST_SATURATION_WINDOW)
            .filter(|r| r.test_dominated)
            .count()
            >= TEST_SATURATION_COUNT
        {
            return Some(GracefulExitReason::TestSaturation);
        }
        if recent(DONE_SIGNAL_WINDOW).filter(|r| r.done_signal).count() >= DONE_SIGNAL_COUNT {
            return Some(GracefulExitReason::CompletionSignals);
        }
        if recent(STRONG_SIGNAL_WINDOW)
            .filter(|r| r.strong_completion)
            .count()
            >= STRONG_SIGNAL_COUNT
        {
            return Some(GracefulExitReason::StrongCompletionIndicators);
        }
        None
    }

    /// Forget the window when a new task begins, so one task's completion
    /// chatter cannot end the next one early.
    pub async fn reset_window(&self) -> Result<(), HermesError> {
        let mut window = self.window.lock().await;
        window.clear();
        self.persist(&window).await
    }

    async fn persist(&self, window: &VecDeque<LoopRecord>) -> Result<(), HermesError> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string(window).map_err(|err| HermesError::Io(err.to_string()))?;
        write_atomic(&self.state_path, &raw).await
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<(), HermesError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state.json");
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_marker_is_recognized() {
        let analysis = ResponseAnalyzer::analyze(
            "Implemented the endpoint.\nTASK COMPLETE: T001\n",
            &["src/auth.rs".to_string()],
        );
        assert!(analysis.task_completed);
        assert!(analysis.progress_observed);
        assert!(!analysis.task_blocked);
        assert!(!analysis.exit_signal);
    }

    #[test]
    fn blocked_marker_carries_the_reason() {
        let analysis = ResponseAnalyzer::analyze(
            "TASK BLOCKED: waiting on the schema migration\n",
            &[],
        );
        assert!(analysis.task_blocked);
        assert_eq!(
            analysis.block_reason.as_deref(),
            Some("waiting on the schema migration")
        );
        assert!(!analysis.progress_observed);
    }

    #[test]
    fn exit_signal_is_a_separate_hint() {
        let analysis = ResponseAnalyzer::analyze("ALL TASKS COMPLETE\n", &[]);
        assert!(analysis.exit_signal);
        assert!(!analysis.task_completed);
    }

    #[test]
    fn error_markers_are_detected_without_false_positives() {
        assert!(ResponseAnalyzer::analyze("error: expected `;`\n", &[]).error_observed);
        assert!(ResponseAnalyzer::analyze("thread 'main' panicked at src/main.rs\n", &[]).error_observed);
        assert!(
            !ResponseAnalyzer::analyze("handled the error case gracefully\n", &[]).error_observed
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let output = "ran tests\nerror: failing assertion\nTASK COMPLETE\n";
        let files = vec!["tests/auth_test.rs".to_string()];
        assert_eq!(
            ResponseAnalyzer::analyze(output, &files),
            ResponseAnalyzer::analyze(output, &files)
        );
    }

    #[test]
    fn test_domination_requires_a_test_heavy_delta() {
        assert!(test_dominated(&[
            "tests/auth_test.rs".to_string(),
            "src/lib.test.ts".to_string(),
        ]));
        assert!(!test_dominated(&[
            "tests/auth_test.rs".to_string(),
            "src/auth.rs".to_string(),
            "src/routes.rs".to_string(),
        ]));
        assert!(!test_dominated(&[]));
    }

    #[tokio::test]
    async fn repeated_done_signals_trigger_graceful_exit() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = ResponseAnalyzer::load(dir.path().join("analyzer-state.json")).await;
        let done = ResponseAnalyzer::analyze("TASK COMPLETE\n", &[]);

        analyzer.record_loop(&done, &[]).await.unwrap();
        assert_eq!(analyzer.graceful_exit_reason().await, None);
        analyzer.record_loop(&done, &[]).await.unwrap();
        assert_eq!(
            analyzer.graceful_exit_reason().await,
            Some(GracefulExitReason::CompletionSignals)
        );
    }

    #[tokio::test]
    async fn test_saturation_triggers_after_three_of_five() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = ResponseAnalyzer::load(dir.path().join("analyzer-state.json")).await;
        let quiet = ResponseAnalyzer::analyze("still working\n", &[]);
        let test_files = vec!["tests/a_test.rs".to_string()];

        for _ in 0..2 {
            analyzer.record_loop(&quiet, &test_files).await.unwrap();
        }
        analyzer.record_loop(&quiet, &[]).await.unwrap();
        assert_eq!(analyzer.graceful_exit_reason().await, None);
        analyzer.record_loop(&quiet, &test_files).await.unwrap();
        assert_eq!(
            analyzer.graceful_exit_reason().await,
            Some(GracefulExitReason::TestSaturation)
        );
    }

    #[tokio::test]
    async fn window_persists_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analyzer-state.json");
        {
            let analyzer = ResponseAnalyzer::load(&path).await;
            let done = ResponseAnalyzer::analyze("TASK COMPLETE\n", &[]);
            analyzer.record_loop(&done, &[]).await.unwrap();
            analyzer.record_loop(&done, &[]).await.unwrap();
        }
        let analyzer = ResponseAnalyzer::load(&path).await;
        assert_eq!(
            analyzer.graceful_exit_reason().await,
            Some(GracefulExitReason::CompletionSignals)
        );

        analyzer.reset_window().await.unwrap();
        assert_eq!(analyzer.graceful_exit_reason().await, None);
    }
}
