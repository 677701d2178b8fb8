use std::sync::Arc;

use chrono::Utc;
use hermes_plan::Task;
use hermes_repo::feature_branch_name;
use hermes_types::{
    EngineEvent, FeatureId, HermesError, Status, TaskId, TaskKind,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::executor::TaskExecutor;
use crate::resolver::{ConflictResolver, ResolutionOutcome};
use crate::run_state::JournalEntry;
use crate::scheduler::ParallelScheduler;

/// Outcome summary for one `run` invocation.
#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    pub plan_complete: bool,
}

/// Top-level orchestration: choose a task, drive the executor, land the
/// work, repeat until the plan is done or something fatal stops the run.
pub struct Engine {
    ctx: Arc<EngineContext>,
    start_from: Option<TaskId>,
}

impl Engine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            start_from: None,
        }
    }

    /// Operator override: begin at this task, skipping earlier pending ones.
    pub fn with_start_from(mut self, start_from: Option<TaskId>) -> Self {
        self.start_from = start_from;
        self
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport, HermesError> {
        let ctx = &self.ctx;
        if !ctx.breaker.can_execute().await {
            let reason = ctx.breaker.state().await.reason;
            return Err(HermesError::CircuitOpen { reason });
        }

        self.prepare_resume().await?;
        if let Some(start_from) = self.start_from {
            self.journal_operator_skips(start_from).await?;
        }

        let report = if ctx.config.parallel {
            let schedule = ParallelScheduler::new(ctx.clone()).run(cancel).await?;
            RunReport {
                completed: schedule.completed,
                blocked: schedule.failed,
                plan_complete: false,
            }
        } else {
            self.run_sequential(cancel).await?
        };

        let progress = ctx.plan.progress().await;
        let plan_complete =
            progress.total_tasks > 0 && progress.completed_tasks == progress.total_tasks;
        if plan_complete {
            ctx.run_state.complete_run().await?;
        }
        ctx.plan.write_status_summary().await?;

        Ok(RunReport {
            plan_complete,
            ..report
        })
    }

    /// Re-establish the recorded branch when a prior run was interrupted.
    /// Resuming against a clean run-state changes nothing.
    async fn prepare_resume(&self) -> Result<(), HermesError> {
        let ctx = &self.ctx;
        if !ctx.run_state.is_resumable().await {
            return Ok(());
        }
        let state = ctx.run_state.snapshot().await;
        if let Some(branch) = &state.current_branch {
            let repo = ctx.repo();
            if repo.branch_exists(branch).await? {
                repo.checkout(branch).await?;
                info!(branch = %branch, "resuming on recorded branch");
            }
        }
        ctx.events.publish(EngineEvent::new(
            "run.resumed",
            json!({
                "journaled": state.journal.len(),
                "current_task": state.current_task.map(|t| t.to_string()),
            }),
        ));
        Ok(())
    }

    /// The operator's choice wins over the journal; pending tasks before
    /// the chosen one are recorded as explicitly skipped for this run.
    async fn journal_operator_skips(&self, start_from: TaskId) -> Result<(), HermesError> {
        let ctx = &self.ctx;
        ctx.plan.get_task(start_from).await?;
        let journaled: Vec<TaskId> = ctx.run_state.snapshot().await.journaled_tasks();
        for task in ctx.plan.list_tasks().await {
            if task.id < start_from
                && task.status == Status::NotStarted
                && !journaled.contains(&task.id)
            {
                ctx.run_state
                    .record_entry(JournalEntry {
                        task: task.id,
                        feature: task.feature_id,
                        started: Utc::now(),
                        completed: None,
                        duration_seconds: 0,
                        commit: None,
                        attempts: 0,
                        errors: vec!["skipped by operator start-from".to_string()],
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn pick_next(&self) -> Option<Task> {
        let next = self.ctx.plan.next_task().await?;
        let Some(start_from) = self.start_from else {
            return Some(next);
        };
        if next.id >= start_from {
            return Some(next);
        }
        // Filtered selection: same ordering rules, restricted to the
        // operator's window.
        let mut ready: Vec<Task> = self
            .ctx
            .plan
            .ready_tasks()
            .await
            .into_iter()
            .filter(|t| t.id >= start_from)
            .collect();
        ready.sort_by_key(|t| (t.priority, t.id));
        if let Some(task) = ready.into_iter().next() {
            return Some(task);
        }
        let mut in_progress: Vec<Task> = self
            .ctx
            .plan
            .list_tasks()
            .await
            .into_iter()
            .filter(|t| t.status == Status::InProgress && t.id >= start_from)
            .collect();
        in_progress.sort_by_key(|t| t.id);
        in_progress.into_iter().next()
    }

    async fn run_sequential(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunReport, HermesError> {
        let ctx = &self.ctx;
        let repo = ctx.repo();
        let base = repo.current_branch().await?;
        let executor = TaskExecutor::new(ctx.clone());
        let mut report = RunReport::default();

        loop {
            if cancel.is_cancelled() {
                return Err(HermesError::Cancelled);
            }
            let Some(task) = self.pick_next().await else {
                break;
            };
            let feature = ctx.plan.get_feature(task.feature_id).await?;
            if feature.status == Status::NotStarted {
                ctx.plan
                    .set_feature_status(feature.id, Status::InProgress)
                    .await?;
            }

            let branch = if ctx.config.auto_branch {
                let branch = feature_branch_name(feature.id, &feature.name);
                if !repo.branch_exists(&branch).await? {
                    repo.create_branch(&branch, Some(&base)).await?;
                }
                repo.checkout(&branch).await?;
                branch
            } else {
                base.clone()
            };

            ctx.run_state.set_next_task(Some(task.id)).await?;
            let result = match executor
                .run_task(&task, &feature, &repo, &branch, true, cancel)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    // Leave the checkout on the integration branch so the
                    // next run starts from a known base.
                    if repo.current_branch().await? != base {
                        let _ = repo.checkout(&base).await;
                    }
                    return Err(err);
                }
            };

            if result.success {
                report.completed.push(task.id);
                let feature = ctx.plan.get_feature(feature.id).await?;
                if feature.is_complete() {
                    // Merge first so the target-version tag lands on an
                    // integration branch that carries the feature's work.
                    if branch != base {
                        self.merge_feature_branch(&branch, &base, &task, cancel).await?;
                    }
                    finalize_feature_if_complete(ctx, feature.id, &base).await?;
                }
            } else {
                report.blocked.push(task.id);
                if matches!(
                    ctx.config.failure_strategy,
                    crate::config::FailureStrategy::FailFast
                ) {
                    break;
                }
            }
        }

        // Leave the integration branch checked out between runs.
        if repo.current_branch().await? != base {
            repo.checkout(&base).await?;
        }
        ctx.run_state.set_next_task(None).await?;
        Ok(report)
    }

    async fn merge_feature_branch(
        &self,
        branch: &str,
        base: &str,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<(), HermesError> {
        let ctx = &self.ctx;
        let repo = ctx.repo();
        match repo.merge_into_base(branch, base, true).await {
            Ok(commit) => {
                ctx.events.publish(EngineEvent::new(
                    "merge.landed",
                    json!({"branch": branch, "commit": commit}),
                ));
                Ok(())
            }
            Err(HermesError::MergeConflict { paths }) => {
                warn!(branch, ?paths, "feature merge conflict");
                let resolver =
                    ConflictResolver::new(ctx.config.conflict_policy, ctx.config.validate_merges);
                let provider = ctx.providers.provider_for(TaskKind::Coding).await.ok();
                let outcome = resolver
                    .resolve(
                        &repo,
                        branch,
                        "work already on the integration branch",
                        &format!("{}: {}", task.id, task.description),
                        provider.as_ref(),
                        ctx.config.invocation_timeout(),
                        cancel,
                    )
                    .await?;
                match outcome {
                    ResolutionOutcome::Resolved { commit } => {
                        repo.delete_branch(branch).await?;
                        ctx.events.publish(EngineEvent::new(
                            "merge.resolved",
                            json!({"branch": branch, "commit": commit}),
                        ));
                        Ok(())
                    }
                    // In sequential mode there is no sibling to wait for;
                    // an unresolved feature merge surfaces to the operator.
                    _ => Err(HermesError::MergeConflict { paths }),
                }
            }
            Err(err) => Err(err),
        }
    }
}

/// When every task of the feature is COMPLETED: flip the feature status and
/// cut the annotated tag for its declared target version at `tag_ref`.
/// Returns whether the feature is complete.
pub(crate) async fn finalize_feature_if_complete(
    ctx: &Arc<EngineContext>,
    feature_id: FeatureId,
    tag_ref: &str,
) -> Result<bool, HermesError> {
    let feature = ctx.plan.get_feature(feature_id).await?;
    if !feature.is_complete() {
        return Ok(false);
    }
    if feature.status != Status::Completed {
        ctx.plan
            .set_feature_status(feature_id, Status::Completed)
            .await?;
    }
    if let Some(version) = &feature.target_version {
        let repo = ctx.repo();
        if !repo.tag_exists(version).await? {
            repo.tag_annotated(version, tag_ref, &format!("{feature_id} {}", feature.name))
                .await?;
            info!(feature = %feature_id, tag = %version, "tagged target version");
        }
    }
    ctx.events.publish(EngineEvent::new(
        "feature.completed",
        json!({"feature": feature_id.to_string()}),
    ));
    Ok(true)
}
