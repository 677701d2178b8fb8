use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hermes_plan::Task;
use hermes_repo::task_branch_name;
use hermes_types::{EngineEvent, HermesError, Status, TaskId, TaskKind, TaskResult};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::FailureStrategy;
use crate::context::EngineContext;
use crate::engine::finalize_feature_if_complete;
use crate::executor::TaskExecutor;
use crate::resolver::{ConflictResolver, ResolutionOutcome};

/// Residual dependency DAG over the plan's unfinished tasks, tracked by
/// in-degree counting. Completion re-opens the ready set without any
/// re-sorting; failure leaves dependents permanently gated.
#[derive(Debug)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    in_degree: HashMap<TaskId, usize>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    done: HashSet<TaskId>,
    failed: HashSet<TaskId>,
}

impl TaskGraph {
    /// Build from the full task list. NOT_STARTED tasks become nodes;
    /// dependencies on COMPLETED tasks are already satisfied; dependencies
    /// on IN_PROGRESS/BLOCKED tasks gate the dependent for the whole run.
    pub fn build(all_tasks: &[Task]) -> Result<Self, HermesError> {
        let status_by_id: HashMap<TaskId, Status> =
            all_tasks.iter().map(|t| (t.id, t.status)).collect();
        let pending: Vec<&Task> = all_tasks
            .iter()
            .filter(|t| t.status == Status::NotStarted)
            .collect();
        hermes_plan::detect_cycle(&pending)?;

        let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut tasks = HashMap::new();

        for task in &pending {
            let mut degree = 0usize;
            for dep in &task.dependencies {
                match status_by_id.get(dep) {
                    Some(Status::Completed) => {}
                    Some(Status::NotStarted) => {
                        degree += 1;
                        dependents.entry(*dep).or_default().push(task.id);
                    }
                    // Unfinished and not in this run's graph: the edge can
                    // never be released.
                    _ => degree += 1,
                }
            }
            in_degree.insert(task.id, degree);
            tasks.insert(task.id, (*task).clone());
        }

        Ok(Self {
            tasks,
            in_degree,
            dependents,
            done: HashSet::new(),
            failed: HashSet::new(),
        })
    }

    /// The current batch: in-degree zero, not yet finished, ordered by
    /// priority then lowest id so dispatch is deterministic.
    pub fn ready_batch(&self) -> Vec<Task> {
        let mut batch: Vec<Task> = self
            .in_degree
            .iter()
            .filter(|&(id, degree)| {
                *degree == 0 && !self.done.contains(id) && !self.failed.contains(id)
            })
            .filter_map(|(id, _)| self.tasks.get(id).cloned())
            .collect();
        batch.sort_by_key(|t| (t.priority, t.id));
        batch
    }

    pub fn mark_done(&mut self, id: TaskId) {
        if !self.done.insert(id) {
            return;
        }
        if let Some(dependents) = self.dependents.get(&id) {
            for dependent in dependents.clone() {
                if let Some(degree) = self.in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
    }

    pub fn mark_failed(&mut self, id: TaskId) {
        self.failed.insert(id);
    }

    pub fn unfinished(&self) -> usize {
        self.tasks.len() - self.done.len() - self.failed.len()
    }
}

/// Per-batch outcome handed back to the engine.
#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
}

/// Parallel-mode orchestration: batches of independent tasks run
/// concurrently on isolated worktrees, then merge deterministically.
pub struct ParallelScheduler {
    ctx: Arc<EngineContext>,
}

impl ParallelScheduler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<ScheduleReport, HermesError> {
        let ctx = &self.ctx;
        let repo = ctx.repo();
        let base = repo.current_branch().await?;
        let mut graph = TaskGraph::build(&ctx.plan.list_tasks().await)?;
        let mut report = ScheduleReport::default();
        let mut retries: HashMap<TaskId, u32> = HashMap::new();

        while graph.unfinished() > 0 {
            if cancel.is_cancelled() {
                return Err(HermesError::Cancelled);
            }
            let mut batch = graph.ready_batch();
            if batch.is_empty() {
                // Remaining tasks are gated behind failures.
                break;
            }
            // A non-parallelizable task gets a wave of its own when it is
            // next in dispatch order; otherwise the wave holds only tasks
            // that may share it.
            if !batch[0].parallelizable {
                batch.truncate(1);
            } else {
                batch.retain(|t| t.parallelizable);
            }

            info!(
                size = batch.len(),
                ids = %batch.iter().map(|t| t.id.to_string()).collect::<Vec<_>>().join(","),
                "dispatching batch"
            );
            ctx.events.publish(EngineEvent::new(
                "batch.start",
                json!({"tasks": batch.iter().map(|t| t.id.to_string()).collect::<Vec<_>>()}),
            ));

            let results = self.run_batch(&batch, &base, cancel).await?;

            let mut successes: Vec<TaskResult> =
                results.iter().filter(|r| r.success).cloned().collect();
            successes.sort_by_key(|r| (r.completed_at, r.task_id));
            let failures: Vec<TaskResult> =
                results.into_iter().filter(|r| !r.success).collect();

            for result in successes {
                match self.merge_result(&result, &base, cancel).await? {
                    MergeDisposition::Landed => {
                        graph.mark_done(result.task_id);
                        report.completed.push(result.task_id);
                    }
                    MergeDisposition::Rescheduled => {
                        // Stays pending; the next wave re-runs it after its
                        // sibling's work is on the integration branch.
                    }
                    MergeDisposition::Degraded => {
                        graph.mark_failed(result.task_id);
                        report.failed.push(result.task_id);
                    }
                }
            }

            let mut stop = false;
            for failure in failures {
                match ctx.config.failure_strategy {
                    FailureStrategy::FailFast => {
                        graph.mark_failed(failure.task_id);
                        report.failed.push(failure.task_id);
                        stop = true;
                    }
                    FailureStrategy::Continue => {
                        graph.mark_failed(failure.task_id);
                        report.failed.push(failure.task_id);
                    }
                    FailureStrategy::Retry => {
                        let attempts = retries.entry(failure.task_id).or_insert(0);
                        *attempts += 1;
                        if *attempts <= ctx.config.task_retry_limit {
                            warn!(task = %failure.task_id, attempt = *attempts, "re-queueing failed task");
                            ctx.plan
                                .set_task_status(failure.task_id, Status::NotStarted)
                                .await?;
                        } else {
                            graph.mark_failed(failure.task_id);
                            report.failed.push(failure.task_id);
                        }
                    }
                    FailureStrategy::FallbackSequential => {
                        // Demote to a solo re-run: reset the status and mark
                        // the task non-parallelizable for the rest of the run.
                        ctx.plan
                            .set_task_status(failure.task_id, Status::NotStarted)
                            .await?;
                        if let Some(task) = graph.tasks.get_mut(&failure.task_id) {
                            if task.parallelizable {
                                task.parallelizable = false;
                            } else {
                                // A second solo failure is final.
                                graph.mark_failed(failure.task_id);
                                report.failed.push(failure.task_id);
                            }
                        }
                    }
                }
            }
            if stop {
                break;
            }
        }

        Ok(report)
    }

    /// Run one batch on isolated worktrees under the worker cap. Worktrees
    /// are removed on every exit path, including worker panics.
    async fn run_batch(
        &self,
        batch: &[Task],
        base: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskResult>, HermesError> {
        let ctx = &self.ctx;
        let cap = ctx.config.max_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(cap));
        let batch_cancel = cancel.child_token();
        let mut join_set: JoinSet<Result<TaskResult, HermesError>> = JoinSet::new();

        for task in batch.iter().cloned() {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let worker_cancel = batch_cancel.clone();
            let base = base.to_string();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| HermesError::Cancelled)?;
                if worker_cancel.is_cancelled() {
                    return Err(HermesError::Cancelled);
                }
                run_worker(ctx, task, &base, &worker_cancel).await
            });
        }

        let mut results = Vec::new();
        let mut fatal: Option<HermesError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(result)) => {
                    if !result.success
                        && matches!(ctx.config.failure_strategy, FailureStrategy::FailFast)
                    {
                        batch_cancel.cancel();
                    }
                    results.push(result);
                }
                Ok(Err(err)) => {
                    // Breaker opening or cancellation ends the whole run;
                    // cancel siblings. A sibling's own Cancelled must not
                    // shadow the error that triggered it.
                    batch_cancel.cancel();
                    let supersedes = match (&fatal, &err) {
                        (None, _) => true,
                        (Some(HermesError::Cancelled), other) => {
                            !matches!(other, HermesError::Cancelled)
                        }
                        _ => false,
                    };
                    if supersedes {
                        fatal = Some(err);
                    }
                }
                Err(join_err) => {
                    batch_cancel.cancel();
                    if fatal.is_none() {
                        fatal = Some(HermesError::Io(format!("worker panicked: {join_err}")));
                    }
                }
            }
        }

        if let Some(err) = fatal {
            // Cancelled workers with no outside cancellation are the
            // fail-fast strategy cutting a batch short, not a fatal error;
            // their tasks were already reset by their own exit paths.
            let fail_fast_cut =
                matches!(err, HermesError::Cancelled) && !cancel.is_cancelled();
            if !fail_fast_cut {
                self.rollback_unmerged(&results).await;
                return Err(err);
            }
        }
        Ok(results)
    }

    async fn merge_result(
        &self,
        result: &TaskResult,
        base: &str,
        cancel: &CancellationToken,
    ) -> Result<MergeDisposition, HermesError> {
        let ctx = &self.ctx;
        let repo = ctx.repo();
        let Some(branch) = result.branch_name.as_deref() else {
            // Nothing was committed for this task; just finish it.
            ctx.plan
                .set_task_status(result.task_id, Status::Completed)
                .await?;
            self.finish_feature_if_complete(result.task_id, base).await?;
            return Ok(MergeDisposition::Landed);
        };

        match repo.merge_into_base(branch, base, true).await {
            Ok(commit) => {
                ctx.events.publish(EngineEvent::new(
                    "merge.landed",
                    json!({"task": result.task_id.to_string(), "branch": branch, "commit": commit}),
                ));
                ctx.plan
                    .set_task_status(result.task_id, Status::Completed)
                    .await?;
                self.finish_feature_if_complete(result.task_id, base).await?;
                Ok(MergeDisposition::Landed)
            }
            Err(HermesError::MergeConflict { paths }) => {
                warn!(task = %result.task_id, ?paths, "merge conflict");
                let resolver =
                    ConflictResolver::new(ctx.config.conflict_policy, ctx.config.validate_merges);
                let provider = ctx.providers.provider_for(TaskKind::Coding).await.ok();
                let task = ctx.plan.get_task(result.task_id).await?;
                let outcome = resolver
                    .resolve(
                        &repo,
                        branch,
                        "work already merged into the integration branch",
                        &format!("{}: {}", task.id, task.description),
                        provider.as_ref(),
                        ctx.config.invocation_timeout(),
                        cancel,
                    )
                    .await?;
                match outcome {
                    ResolutionOutcome::Resolved { commit } => {
                        ctx.events.publish(EngineEvent::new(
                            "merge.resolved",
                            json!({"task": task.id.to_string(), "commit": commit}),
                        ));
                        repo.delete_branch(branch).await?;
                        ctx.plan
                            .set_task_status(result.task_id, Status::Completed)
                            .await?;
                        self.finish_feature_if_complete(result.task_id, base).await?;
                        Ok(MergeDisposition::Landed)
                    }
                    ResolutionOutcome::Reschedule => {
                        repo.delete_branch(branch).await?;
                        ctx.plan
                            .set_task_status(result.task_id, Status::NotStarted)
                            .await?;
                        Ok(MergeDisposition::Rescheduled)
                    }
                    ResolutionOutcome::Unresolved => {
                        repo.delete_branch(branch).await?;
                        ctx.plan
                            .set_task_status(result.task_id, Status::Blocked)
                            .await?;
                        Ok(MergeDisposition::Degraded)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn finish_feature_if_complete(
        &self,
        task: TaskId,
        base: &str,
    ) -> Result<(), HermesError> {
        let ctx = &self.ctx;
        let task = ctx.plan.get_task(task).await?;
        finalize_feature_if_complete(ctx, task.feature_id, base).await?;
        Ok(())
    }

    /// Batch abandonment: remove per-task branches and worktrees and return
    /// the batch's finished-but-unmerged tasks to NOT_STARTED. Workers that
    /// exited through failure or cancellation already reset their own task.
    async fn rollback_unmerged(&self, results: &[TaskResult]) {
        let repo = self.ctx.repo();
        for result in results {
            if let Some(branch) = result.branch_name.as_deref() {
                let _ = repo.delete_branch(branch).await;
            }
            let path = self.ctx.paths.worktree_dir(result.task_id);
            if path.exists() {
                let _ = repo.remove_worktree(&path).await;
            }
            if result.success {
                let _ = self
                    .ctx
                    .plan
                    .set_task_status(result.task_id, Status::NotStarted)
                    .await;
            }
        }
    }
}

enum MergeDisposition {
    Landed,
    Rescheduled,
    Degraded,
}

async fn run_worker(
    ctx: Arc<EngineContext>,
    task: Task,
    base: &str,
    cancel: &CancellationToken,
) -> Result<TaskResult, HermesError> {
    let repo = ctx.repo();
    let branch = task_branch_name(task.id);
    let worktree_path = ctx.paths.worktree_dir(task.id);
    let feature = ctx.plan.get_feature(task.feature_id).await?;

    // A crashed earlier run may have left debris behind.
    if worktree_path.exists() {
        let _ = repo.remove_worktree(&worktree_path).await;
    }
    if repo.branch_exists(&branch).await? {
        repo.delete_branch(&branch).await?;
    }

    let worktree = repo.add_worktree(&worktree_path, &branch, base).await?;
    let executor = TaskExecutor::new(ctx.clone());
    let outcome = executor
        .run_task(&task, &feature, &worktree, &branch, false, cancel)
        .await;

    if let Err(err) = repo.remove_worktree(&worktree_path).await {
        warn!(task = %task.id, %err, "failed to remove worktree");
    }
    match &outcome {
        Ok(result) if !result.success => {
            // Keep nothing of a failed task's branch.
            let _ = repo.delete_branch(&branch).await;
        }
        Err(_) => {
            let _ = repo.delete_branch(&branch).await;
        }
        Ok(_) => {}
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_types::{FeatureId, Priority};

    fn task(id: &str, status: Status, priority: Priority, deps: &[&str]) -> Task {
        Task {
            id: id.parse().unwrap(),
            feature_id: FeatureId::new(1),
            name: id.to_string(),
            status,
            priority,
            estimated_effort: None,
            description: String::new(),
            technical_details: String::new(),
            files_to_touch: Vec::new(),
            dependencies: deps.iter().map(|d| d.parse().unwrap()).collect(),
            success_criteria: Vec::new(),
            parallelizable: true,
            line: 1,
        }
    }

    #[test]
    fn batches_follow_dependency_waves() {
        let tasks = vec![
            task("T001", Status::NotStarted, Priority::P2, &[]),
            task("T002", Status::NotStarted, Priority::P1, &[]),
            task("T003", Status::NotStarted, Priority::P2, &["T001", "T002"]),
        ];
        let mut graph = TaskGraph::build(&tasks).unwrap();

        let batch = graph.ready_batch();
        // Priority order: the P1 task dispatches first.
        assert_eq!(
            batch.iter().map(|t| t.id.to_string()).collect::<Vec<_>>(),
            vec!["T002", "T001"]
        );

        graph.mark_done("T001".parse().unwrap());
        assert!(graph.ready_batch().iter().all(|t| t.id.to_string() != "T003"));
        graph.mark_done("T002".parse().unwrap());
        assert_eq!(graph.ready_batch()[0].id.to_string(), "T003");
    }

    #[test]
    fn completed_dependencies_are_already_satisfied() {
        let tasks = vec![
            task("T001", Status::Completed, Priority::P2, &[]),
            task("T002", Status::NotStarted, Priority::P2, &["T001"]),
        ];
        let graph = TaskGraph::build(&tasks).unwrap();
        assert_eq!(graph.ready_batch()[0].id.to_string(), "T002");
    }

    #[test]
    fn failed_task_gates_its_dependents_forever() {
        let tasks = vec![
            task("T001", Status::NotStarted, Priority::P2, &[]),
            task("T002", Status::NotStarted, Priority::P2, &["T001"]),
        ];
        let mut graph = TaskGraph::build(&tasks).unwrap();
        graph.mark_failed("T001".parse().unwrap());
        assert!(graph.ready_batch().is_empty());
        assert_eq!(graph.unfinished(), 1);
    }

    #[test]
    fn blocked_dependency_outside_the_graph_gates_the_dependent() {
        let tasks = vec![
            task("T001", Status::Blocked, Priority::P2, &[]),
            task("T002", Status::NotStarted, Priority::P2, &["T001"]),
        ];
        let graph = TaskGraph::build(&tasks).unwrap();
        assert!(graph.ready_batch().is_empty());
    }

    #[test]
    fn cycle_in_pending_tasks_is_rejected() {
        let tasks = vec![
            task("T001", Status::NotStarted, Priority::P2, &["T002"]),
            task("T002", Status::NotStarted, Priority::P2, &["T001"]),
        ];
        let err = TaskGraph::build(&tasks).unwrap_err();
        assert_eq!(err.code(), "INVALID_PLAN");
    }
}
