use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TaskId;

/// Which half of the engine a provider invocation serves. Planning and coding
/// may be bound to different assistants in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Planning,
    Coding,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Planning => "planning",
            TaskKind::Coding => "coding",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Outcome of one assistant subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub output: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub usage: Option<TokenUsage>,
}

/// Tagged events decoded from a provider's line-delimited stream. Variants a
/// given subprocess never emits are simply absent from its stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    System {
        session_id: Option<String>,
        model: Option<String>,
    },
    Text {
        text: String,
    },
    ToolUse {
        name: String,
    },
    ToolResult {
        name: String,
        is_error: bool,
    },
    Result {
        duration_ms: u64,
        cost_usd: Option<f64>,
        usage: Option<TokenUsage>,
    },
    Error {
        message: String,
    },
}

/// Outcome of driving one task to completion (or failure) on its branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    pub error: Option<String>,
    pub branch_name: Option<String>,
    pub duration_seconds: f64,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Wall-clock completion instant, used for deterministic merge ordering.
    pub completed_at: chrono::DateTime<chrono::Utc>,
}
