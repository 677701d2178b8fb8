use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hermes_observability::{emit_event, ObservabilityEvent, ProcessKind};
use hermes_plan::{Feature, Task};
use hermes_providers::Provider;
use hermes_repo::{build_commit_message, GitRepo};
use hermes_types::{
    EngineEvent, ExecuteOptions, ExecutionResult, HermesError, Status, TaskKind, TaskResult,
    TokenUsage,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use crate::analyzer::ResponseAnalyzer;
use crate::breaker::LoopOutcome;
use crate::context::EngineContext;
use crate::prompt::{inject_context, TaskContext, DEFAULT_TEMPLATE};
use crate::run_state::JournalEntry;

/// Drives a single task to completion (or failure) inside one workspace.
/// The breaker decides when stagnation halts the run; this loop only
/// enforces its own per-task iteration cap.
pub struct TaskExecutor {
    ctx: Arc<EngineContext>,
}

impl TaskExecutor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run the per-task loop in `repo` on `branch`. When `complete_in_plan`
    /// is false (parallel mode) the COMPLETED flip is left to the scheduler,
    /// which performs it after the branch merges.
    pub async fn run_task(
        &self,
        task: &Task,
        feature: &Feature,
        repo: &GitRepo,
        branch: &str,
        complete_in_plan: bool,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, HermesError> {
        let ctx = &self.ctx;
        let started_at = Utc::now();
        let started = Instant::now();
        let task_id_text = task.id.to_string();
        let feature_id_text = feature.id.to_string();

        ctx.analyzer.reset_window().await?;
        ctx.plan.set_task_status(task.id, Status::InProgress).await?;
        ctx.run_state.begin_task(task.id, feature.id, branch).await?;

        let template = tokio::fs::read_to_string(ctx.paths.prompt_template())
            .await
            .unwrap_or_else(|_| DEFAULT_TEMPLATE.to_string());

        let mut attempts = 0u32;
        let mut errors: Vec<String> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut all_changed: BTreeSet<String> = BTreeSet::new();
        let mut last_output = String::new();

        let max_loops = ctx.config.max_loops_per_task.max(1);
        for loop_number in 1..=max_loops {
            if cancel.is_cancelled() {
                return self
                    .cancel_cleanup(task, feature, started_at, attempts, errors)
                    .await;
            }
            if !ctx.breaker.can_execute().await {
                return self
                    .circuit_open_exit(task, feature, started_at, attempts, errors)
                    .await;
            }

            match ctx.limiter.acquire(cancel).await {
                Ok(()) => {}
                Err(HermesError::Cancelled) => {
                    return self
                        .cancel_cleanup(task, feature, started_at, attempts, errors)
                        .await;
                }
                Err(err) => return Err(err),
            }

            if let Some(reason) = ctx.analyzer.graceful_exit_reason().await {
                info!(task = %task.id, reason = reason.as_str(), "graceful exit");
                ctx.events.publish(EngineEvent::new(
                    "loop.graceful_exit",
                    json!({"task": task_id_text.clone(), "reason": reason.as_str()}),
                ));
                return self
                    .complete_task(
                        task,
                        feature,
                        repo,
                        branch,
                        complete_in_plan,
                        started_at,
                        started,
                        attempts,
                        errors,
                        usage,
                        all_changed,
                        last_output,
                    )
                    .await;
            }

            let snapshot = repo.snapshot_tree().await?;
            let prompt = inject_context(
                &template,
                &TaskContext {
                    feature,
                    task,
                    branch,
                },
            );
            let provider = ctx.providers.provider_for(TaskKind::Coding).await?;

            emit_event(
                Level::INFO,
                ProcessKind::Worker,
                ObservabilityEvent {
                    event: "assistant.call.start",
                    component: "executor",
                    run_id: None,
                    task_id: Some(&task_id_text),
                    feature_id: Some(&feature_id_text),
                    provider_id: Some(provider.name()),
                    branch: Some(branch),
                    loop_number: Some(loop_number),
                    status: Some("start"),
                    error_code: None,
                    detail: None,
                },
            );

            let exec = match self
                .invoke_with_retry(&provider, &prompt, repo, cancel, &mut attempts, &mut errors)
                .await
            {
                Ok(exec) => exec,
                Err(HermesError::Cancelled) => {
                    return self
                        .cancel_cleanup(task, feature, started_at, attempts, errors)
                        .await;
                }
                Err(err) => {
                    emit_event(
                        Level::ERROR,
                        ProcessKind::Worker,
                        ObservabilityEvent {
                            event: "assistant.call.error",
                            component: "executor",
                            run_id: None,
                            task_id: Some(&task_id_text),
                            feature_id: Some(&feature_id_text),
                            provider_id: Some(provider.name()),
                            branch: Some(branch),
                            loop_number: Some(loop_number),
                            status: Some("failed"),
                            error_code: Some(err.code()),
                            detail: Some(&err.to_string()),
                        },
                    );
                    errors.push(err.to_string());
                    return self
                        .block_task(
                            task,
                            feature,
                            started_at,
                            attempts,
                            errors,
                            format!("assistant failed after retries: {err}"),
                        )
                        .await;
                }
            };
            if let Some(call_usage) = &exec.usage {
                usage.add(call_usage);
            }

            let files_changed = repo.diff_since(&snapshot).await?;
            all_changed.extend(files_changed.iter().cloned());

            let analysis = ResponseAnalyzer::analyze(&exec.output, &files_changed);
            let proceed = ctx
                .breaker
                .record(LoopOutcome {
                    files_changed: files_changed.len(),
                    has_errors: analysis.error_observed,
                    output_length: exec.output.len(),
                    loop_number,
                })
                .await?;
            ctx.analyzer.record_loop(&analysis, &files_changed).await?;
            last_output = exec.output;

            ctx.events.publish(EngineEvent::new(
                "loop.finished",
                json!({
                    "task": task_id_text.clone(),
                    "loop": loop_number,
                    "files_changed": files_changed.len(),
                    "completed": analysis.task_completed,
                }),
            ));

            if !proceed {
                return self
                    .circuit_open_exit(task, feature, started_at, attempts, errors)
                    .await;
            }

            if analysis.task_completed {
                return self
                    .complete_task(
                        task,
                        feature,
                        repo,
                        branch,
                        complete_in_plan,
                        started_at,
                        started,
                        attempts,
                        errors,
                        usage,
                        all_changed,
                        last_output,
                    )
                    .await;
            }
            if analysis.task_blocked {
                let reason = analysis
                    .block_reason
                    .unwrap_or_else(|| "assistant reported the task as blocked".to_string());
                return self
                    .block_task(task, feature, started_at, attempts, errors, reason)
                    .await;
            }
            // Progress without completion: keep looping under the cap.
        }

        self.block_task(
            task,
            feature,
            started_at,
            attempts,
            errors,
            format!("no completion after {max_loops} loops"),
        )
        .await
    }

    /// Bounded attempts with exponential backoff. Quota exhaustion pauses
    /// until the next wall-clock hour and retries the same attempt instead
    /// of consuming one.
    async fn invoke_with_retry(
        &self,
        provider: &Arc<dyn Provider>,
        prompt: &str,
        repo: &GitRepo,
        cancel: &CancellationToken,
        attempts: &mut u32,
        errors: &mut Vec<String>,
    ) -> Result<ExecutionResult, HermesError> {
        let config = &self.ctx.config;
        let max_attempts = config.max_retries.max(1);
        let cap = Duration::from_secs(config.retry_max_delay_seconds.max(1));
        let mut delay = Duration::from_secs(config.retry_base_delay_seconds.max(1)).min(cap);
        let mut failed_attempts = 0u32;

        loop {
            *attempts += 1;
            let outcome = provider
                .execute(
                    ExecuteOptions {
                        prompt: prompt.to_string(),
                        working_dir: repo.root().to_path_buf(),
                        timeout: config.invocation_timeout(),
                        stream: true,
                    },
                    cancel.clone(),
                )
                .await;

            let error_text = match outcome {
                Ok(result) if result.success => return Ok(result),
                Ok(result) => result
                    .error
                    .unwrap_or_else(|| "assistant run failed".to_string()),
                Err(HermesError::Cancelled) => return Err(HermesError::Cancelled),
                Err(HermesError::QuotaExceeded(message)) => {
                    warn!(%message, "provider quota exhausted, pausing until the hour rolls");
                    self.ctx.events.publish(EngineEvent::new(
                        "assistant.quota_pause",
                        json!({"message": message}),
                    ));
                    errors.push(format!("quota pause: {message}"));
                    self.ctx.limiter.wait_for_hour_roll(cancel).await?;
                    continue;
                }
                Err(err) => err.to_string(),
            };

            failed_attempts += 1;
            errors.push(error_text.clone());
            if failed_attempts >= max_attempts {
                return Err(HermesError::Io(format!(
                    "assistant failed {failed_attempts} attempts, last error: {error_text}"
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(HermesError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(cap);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_task(
        &self,
        task: &Task,
        feature: &Feature,
        repo: &GitRepo,
        branch: &str,
        complete_in_plan: bool,
        started_at: DateTime<Utc>,
        started: Instant,
        attempts: u32,
        errors: Vec<String>,
        usage: TokenUsage,
        all_changed: BTreeSet<String>,
        output: String,
    ) -> Result<TaskResult, HermesError> {
        let ctx = &self.ctx;
        ctx.plan.complete_success_criteria(task.id).await?;

        let mut commit = None;
        if ctx.config.auto_commit && !repo.changed_files().await?.is_empty() {
            repo.stage_all().await?;
            let criteria: Vec<String> = task
                .success_criteria
                .iter()
                .map(|c| c.text.clone())
                .collect();
            let files: Vec<String> = all_changed.iter().cloned().collect();
            let message =
                build_commit_message(&task.id.to_string(), &task.name, &criteria, &files);
            commit = Some(repo.commit(&message.subject, &message.body).await?);
        }

        let completed_at = Utc::now();
        ctx.run_state
            .record_entry(JournalEntry {
                task: task.id,
                feature: feature.id,
                started: started_at,
                completed: Some(completed_at),
                duration_seconds: started.elapsed().as_secs(),
                commit: commit.clone(),
                attempts,
                errors,
            })
            .await?;

        if complete_in_plan {
            ctx.plan.set_task_status(task.id, Status::Completed).await?;
        }

        info!(task = %task.id, commit = commit.as_deref().unwrap_or("-"), "task completed");
        Ok(TaskResult {
            task_id: task.id,
            success: true,
            output,
            files_changed: all_changed.into_iter().collect(),
            error: None,
            branch_name: Some(branch.to_string()),
            duration_seconds: started.elapsed().as_secs_f64(),
            usage,
            completed_at,
        })
    }

    async fn block_task(
        &self,
        task: &Task,
        feature: &Feature,
        started_at: DateTime<Utc>,
        attempts: u32,
        mut errors: Vec<String>,
        reason: String,
    ) -> Result<TaskResult, HermesError> {
        errors.push(reason.clone());
        self.ctx
            .run_state
            .record_entry(JournalEntry {
                task: task.id,
                feature: feature.id,
                started: started_at,
                completed: None,
                duration_seconds: 0,
                commit: None,
                attempts,
                errors: errors.clone(),
            })
            .await?;
        self.ctx.plan.set_task_status(task.id, Status::Blocked).await?;
        warn!(task = %task.id, %reason, "task blocked");
        Ok(TaskResult {
            task_id: task.id,
            success: false,
            output: String::new(),
            files_changed: Vec::new(),
            error: Some(reason),
            branch_name: None,
            duration_seconds: 0.0,
            usage: TokenUsage::default(),
            completed_at: Utc::now(),
        })
    }

    /// The journal entry lands before the status flips back, so a
    /// cancelled run never shows an IN_PROGRESS task without a record.
    async fn cancel_cleanup(
        &self,
        task: &Task,
        feature: &Feature,
        started_at: DateTime<Utc>,
        attempts: u32,
        mut errors: Vec<String>,
    ) -> Result<TaskResult, HermesError> {
        errors.push("cancelled".to_string());
        self.ctx
            .run_state
            .record_entry(JournalEntry {
                task: task.id,
                feature: feature.id,
                started: started_at,
                completed: None,
                duration_seconds: 0,
                commit: None,
                attempts,
                errors,
            })
            .await?;
        self.ctx
            .plan
            .set_task_status(task.id, Status::NotStarted)
            .await?;
        Err(HermesError::Cancelled)
    }

    async fn circuit_open_exit(
        &self,
        task: &Task,
        feature: &Feature,
        started_at: DateTime<Utc>,
        attempts: u32,
        mut errors: Vec<String>,
    ) -> Result<TaskResult, HermesError> {
        let reason = self.ctx.breaker.state().await.reason;
        errors.push(format!("circuit open: {reason}"));
        self.ctx
            .run_state
            .record_entry(JournalEntry {
                task: task.id,
                feature: feature.id,
                started: started_at,
                completed: None,
                duration_seconds: 0,
                commit: None,
                attempts,
                errors,
            })
            .await?;
        // The task stays IN_PROGRESS: the run halts, the plan remembers
        // where it was, and `reset` plus a new run picks it back up.
        Err(HermesError::CircuitOpen { reason })
    }
}
