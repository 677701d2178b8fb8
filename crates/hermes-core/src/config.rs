use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    AutoMergeOnly,
    AssistantMediated,
    SequentialFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStrategy {
    FailFast,
    Continue,
    Retry,
    FallbackSequential,
}

fn default_binding() -> String {
    "auto".to_string()
}
fn default_timeout_minutes() -> u64 {
    15
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_seconds() -> u64 {
    2
}
fn default_retry_max_delay_seconds() -> u64 {
    60
}
fn default_max_loops_per_task() -> u32 {
    10
}
fn default_calls_per_hour() -> u32 {
    50
}
fn default_max_workers() -> usize {
    3
}
fn default_task_retry_limit() -> u32 {
    2
}
fn default_true() -> bool {
    true
}
fn default_conflict_policy() -> ConflictPolicy {
    ConflictPolicy::AssistantMediated
}
fn default_failure_strategy() -> FailureStrategy {
    FailureStrategy::Continue
}
fn default_log_retention_days() -> u64 {
    14
}

/// Engine configuration, persisted as `config.json` in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Provider binding for plan-shaping invocations; a name or `auto`.
    #[serde(default = "default_binding")]
    pub planning_ai: String,
    /// Provider binding for task execution; a name or `auto`.
    #[serde(default = "default_binding")]
    pub coding_ai: String,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_seconds")]
    pub retry_base_delay_seconds: u64,
    #[serde(default = "default_retry_max_delay_seconds")]
    pub retry_max_delay_seconds: u64,
    #[serde(default = "default_max_loops_per_task")]
    pub max_loops_per_task: u32,
    #[serde(default = "default_calls_per_hour")]
    pub calls_per_hour: u32,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_conflict_policy")]
    pub conflict_policy: ConflictPolicy,
    #[serde(default = "default_failure_strategy")]
    pub failure_strategy: FailureStrategy,
    /// Re-queue budget for the `retry` failure strategy.
    #[serde(default = "default_task_retry_limit")]
    pub task_retry_limit: u32,
    #[serde(default = "default_true")]
    pub auto_branch: bool,
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    #[serde(default)]
    pub validate_merges: bool,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_value(json!({})).expect("defaults are total")
    }
}

impl EngineConfig {
    pub fn invocation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_minutes * 60)
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: the project file under the workspace, `HERMES_*`
/// environment overrides, then CLI overrides, deep-merged in that order.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        let layers = ConfigLayers {
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        let store = Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        };
        store.save_project().await?;
        Ok(store)
    }

    pub async fn get(&self) -> EngineConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("config.json");
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, raw).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

fn deep_merge(target: &mut Value, incoming: &Value) {
    match (target, incoming) {
        (Value::Object(target_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                deep_merge(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
        (target_slot, incoming_value) => {
            if !incoming_value.is_null() {
                *target_slot = incoming_value.clone();
            }
        }
    }
}

/// Environment overrides: `HERMES_<FIELD>` for the scalar config fields.
fn env_layer() -> Value {
    let mut layer = Map::new();
    for (env_name, key, kind) in [
        ("HERMES_PLANNING_AI", "planning_ai", EnvKind::Text),
        ("HERMES_CODING_AI", "coding_ai", EnvKind::Text),
        ("HERMES_TIMEOUT_MINUTES", "timeout_minutes", EnvKind::Number),
        ("HERMES_MAX_RETRIES", "max_retries", EnvKind::Number),
        (
            "HERMES_MAX_LOOPS_PER_TASK",
            "max_loops_per_task",
            EnvKind::Number,
        ),
        ("HERMES_CALLS_PER_HOUR", "calls_per_hour", EnvKind::Number),
        ("HERMES_PARALLEL", "parallel", EnvKind::Bool),
        ("HERMES_MAX_WORKERS", "max_workers", EnvKind::Number),
    ] {
        let Ok(raw) = std::env::var(env_name) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let value = match kind {
            EnvKind::Text => Some(Value::String(raw.to_string())),
            EnvKind::Number => raw.parse::<u64>().ok().map(|n| json!(n)),
            EnvKind::Bool => match raw.to_lowercase().as_str() {
                "1" | "true" | "yes" => Some(Value::Bool(true)),
                "0" | "false" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
        };
        if let Some(value) = value {
            layer.insert(key.to_string(), value);
        }
    }
    Value::Object(layer)
}

enum EnvKind {
    Text,
    Number,
    Bool,
}
