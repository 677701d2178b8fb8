use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use regex::Regex;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hermes_types::{ExecuteOptions, ExecutionResult, HermesError, StreamEvent, TaskKind, TokenUsage};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// An external code-generating assistant, driven as a subprocess in its
/// non-interactive stream-structured mode. The engine treats the assistant
/// as an opaque stream producer; variants differ only in subprocess
/// arguments and stream decoders.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn is_available(&self) -> bool;

    async fn execute_stream(
        &self,
        opts: ExecuteOptions,
        cancel: CancellationToken,
    ) -> Result<EventStream, HermesError>;

    /// Run to completion, folding the stream into an `ExecutionResult`.
    /// Quota exhaustion, watchdog expiry, and cancellation surface as the
    /// distinguished error kinds; other failures come back as
    /// `success = false` with the partial output retained.
    async fn execute(
        &self,
        opts: ExecuteOptions,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, HermesError> {
        let started = Instant::now();
        let mut stream = self.execute_stream(opts, cancel).await?;
        let mut result = ExecutionResult {
            success: true,
            ..ExecutionResult::default()
        };

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    if let Some(hermes) = err.downcast_ref::<HermesError>() {
                        match hermes {
                            HermesError::Timeout { .. }
                            | HermesError::Cancelled
                            | HermesError::QuotaExceeded(_) => return Err(hermes.clone()),
                            _ => {}
                        }
                    }
                    result.success = false;
                    result.error = Some(err.to_string());
                    break;
                }
            };
            match event {
                StreamEvent::Text { text } => result.output.push_str(&text),
                StreamEvent::Result {
                    usage, duration_ms, ..
                } => {
                    result.usage = usage;
                    if result.duration_seconds == 0.0 {
                        result.duration_seconds = duration_ms as f64 / 1000.0;
                    }
                }
                StreamEvent::Error { message } => {
                    result.success = false;
                    result.error = Some(message);
                }
                _ => {}
            }
        }

        if result.duration_seconds == 0.0 {
            result.duration_seconds = started.elapsed().as_secs_f64();
        }
        if quota_pattern().is_match(&result.output)
            || result
                .error
                .as_deref()
                .is_some_and(|e| quota_pattern().is_match(e))
        {
            return Err(HermesError::QuotaExceeded(
                "assistant reported its hourly usage limit".to_string(),
            ));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

fn quota_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(hour(ly)? (usage )?limit reached|usage limit reached|rate limit(ed)?.{0,40}(resets?|try again)|quota exceeded)")
            .expect("static quota regex")
    })
}

/// Scratch prompt file, removed on every exit path. Dropping the guard
/// deletes the file even when the invocation is cancelled mid-stream.
struct ScratchPrompt {
    path: PathBuf,
}

impl ScratchPrompt {
    async fn write(dir: &Path, prompt: &str) -> Result<Self, HermesError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("prompt-{}.md", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, prompt).await?;
        Ok(Self { path })
    }
}

impl Drop for ScratchPrompt {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to remove scratch prompt");
            }
        }
    }
}

async fn probe_binary(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Spawn `command`, decode its line-delimited stdout with `decode`, and
/// drive the result as an event stream under the watchdog and the
/// cancellation token. The child is killed on timeout and on cancel;
/// partial decoding already yielded stays with the consumer.
fn run_streaming(
    mut command: Command,
    provider: &'static str,
    scratch: ScratchPrompt,
    timeout: std::time::Duration,
    cancel: CancellationToken,
    decode: fn(&Value) -> Vec<StreamEvent>,
) -> Result<EventStream, HermesError> {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let stream = try_stream! {
        // Moved into the generator so the file outlives the subprocess and
        // is removed when the stream is dropped, however that happens.
        let _scratch = scratch;
        let mut child = command
            .spawn()
            .map_err(|err| HermesError::Io(format!("failed to spawn {provider}: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HermesError::Io(format!("{provider} stdout not captured")))?;
        let stderr = child.stderr.take();
        let mut lines = tokio::io::BufReader::new(stdout).lines();
        let deadline = tokio::time::Instant::now() + timeout;

        enum Woken {
            Cancelled,
            TimedOut,
            Line(std::io::Result<Option<String>>),
        }

        loop {
            let woken = tokio::select! {
                _ = cancel.cancelled() => Woken::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Woken::TimedOut,
                line = lines.next_line() => Woken::Line(line),
            };

            match woken {
                Woken::Cancelled => {
                    let _ = child.kill().await;
                    Err(HermesError::Cancelled)?;
                }
                Woken::TimedOut => {
                    let _ = child.kill().await;
                    Err(HermesError::timeout(
                        format!("{provider} invocation"),
                        timeout.as_secs(),
                    ))?;
                }
                Woken::Line(line) => {
                    match line.map_err(|err| HermesError::Io(err.to_string()))? {
                        Some(line) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Value>(trimmed) {
                                Ok(record) => {
                                    for event in decode(&record) {
                                        yield event;
                                    }
                                }
                                // Providers interleave plain log lines with
                                // their structured records; pass them through
                                // as text so nothing is lost.
                                Err(_) => yield StreamEvent::Text { text: format!("{line}\n") },
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| HermesError::Io(err.to_string()))?;
        if !status.success() {
            let mut detail = format!("{provider} exited with {status}");
            if let Some(stderr) = stderr {
                let mut err_lines = tokio::io::BufReader::new(stderr).lines();
                let mut tail = Vec::new();
                while let Ok(Some(line)) = err_lines.next_line().await {
                    tail.push(line);
                    if tail.len() > 20 {
                        tail.remove(0);
                    }
                }
                if !tail.is_empty() {
                    detail.push_str(": ");
                    detail.push_str(&tail.join(" | "));
                }
            }
            yield StreamEvent::Error { message: detail };
        }
    };

    Ok(Box::pin(stream))
}

/// Claude Code CLI in print mode with stream-json output. The prompt goes
/// through the scratch file piped to stdin.
pub struct ClaudeProvider {
    binary: String,
    scratch_dir: PathBuf,
}

impl ClaudeProvider {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: "claude".to_string(),
            scratch_dir: scratch_dir.into(),
        }
    }
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn is_available(&self) -> bool {
        probe_binary(&self.binary).await
    }

    async fn execute_stream(
        &self,
        opts: ExecuteOptions,
        cancel: CancellationToken,
    ) -> Result<EventStream, HermesError> {
        let scratch = ScratchPrompt::write(&self.scratch_dir, &opts.prompt).await?;
        let prompt_file = std::fs::File::open(&scratch.path)
            .map_err(|err| HermesError::Io(err.to_string()))?;

        let mut command = Command::new(&self.binary);
        command
            .arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--dangerously-skip-permissions")
            .current_dir(&opts.working_dir)
            .stdin(Stdio::from(prompt_file));

        debug!(provider = self.name(), dir = %opts.working_dir.display(), "spawning assistant");
        run_streaming(
            command,
            "claude",
            scratch,
            opts.timeout,
            cancel,
            decode_claude_record,
        )
    }
}

/// OpenCode CLI in one-shot run mode with JSON event lines. The prompt is
/// passed as the run argument; the scratch file remains the audit copy.
pub struct OpencodeProvider {
    binary: String,
    scratch_dir: PathBuf,
}

impl OpencodeProvider {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: "opencode".to_string(),
            scratch_dir: scratch_dir.into(),
        }
    }
}

#[async_trait]
impl Provider for OpencodeProvider {
    fn name(&self) -> &'static str {
        "opencode"
    }

    async fn is_available(&self) -> bool {
        probe_binary(&self.binary).await
    }

    async fn execute_stream(
        &self,
        opts: ExecuteOptions,
        cancel: CancellationToken,
    ) -> Result<EventStream, HermesError> {
        let scratch = ScratchPrompt::write(&self.scratch_dir, &opts.prompt).await?;

        let mut command = Command::new(&self.binary);
        command
            .arg("run")
            .arg(&opts.prompt)
            .arg("--format")
            .arg("json")
            .current_dir(&opts.working_dir)
            .stdin(Stdio::null());

        debug!(provider = self.name(), dir = %opts.working_dir.display(), "spawning assistant");
        run_streaming(
            command,
            "opencode",
            scratch,
            opts.timeout,
            cancel,
            decode_opencode_record,
        )
    }
}

fn decode_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    Some(TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

/// Decode one Claude stream-json record into zero or more events.
pub fn decode_claude_record(record: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    match record.get("type").and_then(Value::as_str).unwrap_or_default() {
        "system" => {
            events.push(StreamEvent::System {
                session_id: record
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                model: record
                    .get("model")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            });
        }
        "assistant" | "user" => {
            let content = record
                .pointer("/message/content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for block in content {
                match block.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            events.push(StreamEvent::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                    "tool_use" => {
                        events.push(StreamEvent::ToolUse {
                            name: block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown")
                                .to_string(),
                        });
                    }
                    "tool_result" => {
                        events.push(StreamEvent::ToolResult {
                            name: block
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown")
                                .to_string(),
                            is_error: block
                                .get("is_error")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                        });
                    }
                    _ => {}
                }
            }
        }
        "result" => {
            if record.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
                events.push(StreamEvent::Error {
                    message: record
                        .get("result")
                        .and_then(Value::as_str)
                        .unwrap_or("assistant reported an error result")
                        .to_string(),
                });
            }
            events.push(StreamEvent::Result {
                duration_ms: record
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                cost_usd: record.get("total_cost_usd").and_then(Value::as_f64),
                usage: decode_usage(record),
            });
        }
        "error" => {
            events.push(StreamEvent::Error {
                message: record
                    .pointer("/error/message")
                    .or_else(|| record.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("assistant stream error")
                    .to_string(),
            });
        }
        _ => {}
    }
    events
}

/// Decode one OpenCode JSON event line. OpenCode never reports per-call
/// cost, so `Result` events carry duration and usage only when present.
pub fn decode_opencode_record(record: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    match record.get("type").and_then(Value::as_str).unwrap_or_default() {
        "session" => {
            events.push(StreamEvent::System {
                session_id: record
                    .get("sessionID")
                    .or_else(|| record.get("session_id"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                model: record.get("model").and_then(Value::as_str).map(ToString::to_string),
            });
        }
        "text" => {
            if let Some(text) = record
                .get("text")
                .or_else(|| record.pointer("/part/text"))
                .and_then(Value::as_str)
            {
                events.push(StreamEvent::Text {
                    text: text.to_string(),
                });
            }
        }
        "tool" | "tool_use" => {
            events.push(StreamEvent::ToolUse {
                name: record
                    .get("tool")
                    .or_else(|| record.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        "step-finish" | "done" => {
            events.push(StreamEvent::Result {
                duration_ms: record.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
                cost_usd: None,
                usage: decode_usage(record),
            });
        }
        "error" => {
            events.push(StreamEvent::Error {
                message: record
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("assistant stream error")
                    .to_string(),
            });
        }
        _ => {}
    }
    events
}

/// Per-task-kind provider selection. A binding names a provider, or `auto`
/// to probe the fixed priority order (claude, then opencode) and take the
/// first available.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    planning: String,
    coding: String,
}

impl ProviderRegistry {
    pub fn new(scratch_dir: impl AsRef<Path>, planning: String, coding: String) -> Self {
        let scratch_dir = scratch_dir.as_ref();
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::new(ClaudeProvider::new(scratch_dir)),
            Arc::new(OpencodeProvider::new(scratch_dir)),
        ];
        Self {
            providers,
            planning,
            coding,
        }
    }

    /// Registry over caller-supplied providers; bindings as in `new`.
    pub fn with_providers(
        providers: Vec<Arc<dyn Provider>>,
        planning: String,
        coding: String,
    ) -> Self {
        Self {
            providers,
            planning,
            coding,
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    fn binding(&self, kind: TaskKind) -> &str {
        match kind {
            TaskKind::Planning => &self.planning,
            TaskKind::Coding => &self.coding,
        }
    }

    pub async fn provider_for(&self, kind: TaskKind) -> Result<Arc<dyn Provider>, HermesError> {
        let binding = self.binding(kind);
        if !binding.eq_ignore_ascii_case("auto") {
            let provider = self.get(binding).ok_or_else(|| {
                HermesError::ProviderUnavailable(format!(
                    "`{binding}` is not a known provider (known: {})",
                    self.names().join(", ")
                ))
            })?;
            if !provider.is_available().await {
                return Err(HermesError::ProviderUnavailable(format!(
                    "`{binding}` is configured for {} but its CLI did not respond",
                    kind.as_str()
                )));
            }
            return Ok(provider);
        }

        for provider in &self.providers {
            if provider.is_available().await {
                return Ok(provider.clone());
            }
        }
        Err(HermesError::ProviderUnavailable(format!(
            "no assistant CLI answered the probe (tried: {})",
            self.names().join(", ")
        )))
    }
}
