use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hermes_core::{
    CircuitBreaker, Engine, EngineConfig, EngineContext, EventBus, RateLimiter,
    ResponseAnalyzer, RunStateStore, WorkspacePaths, DEFAULT_TEMPLATE,
};
use hermes_plan::PlanStore;
use hermes_providers::{EventStream, Provider, ProviderRegistry};
use hermes_types::{
    ExecuteOptions, HermesError, Status, StreamEvent, TaskId, TokenUsage,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct Script {
    files: Vec<(&'static str, &'static str)>,
    output: &'static str,
    fail_cancelled: bool,
}

impl Script {
    fn completes(files: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            files,
            output: "TASK COMPLETE\n",
            fail_cancelled: false,
        }
    }

    fn stalls() -> Self {
        Self {
            files: Vec::new(),
            output: "still analyzing the code\n",
            fail_cancelled: false,
        }
    }

    fn cancels() -> Self {
        Self {
            files: Vec::new(),
            output: "",
            fail_cancelled: true,
        }
    }

    fn replies(output: &'static str) -> Self {
        Self {
            files: Vec::new(),
            output,
            fail_cancelled: false,
        }
    }
}

/// Deterministic stand-in for an assistant subprocess: each invocation pops
/// the next script, writes its files into the working directory, and
/// streams its output.
struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    invocations: AtomicU32,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Script>, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            invocations: AtomicU32::new(0),
        })
    }

    fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute_stream(
        &self,
        opts: ExecuteOptions,
        _cancel: CancellationToken,
    ) -> Result<EventStream, HermesError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if script.fail_cancelled {
            return Err(HermesError::Cancelled);
        }
        for (path, content) in &script.files {
            let full = opts.working_dir.join(path);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(full, content).await?;
        }
        let events = vec![
            Ok(StreamEvent::Text {
                text: script.output.to_string(),
            }),
            Ok(StreamEvent::Result {
                duration_ms: 5,
                cost_usd: None,
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
            }),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

fn run_git(root: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_stdout(root: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .expect("git runs");
    String::from_utf8_lossy(&output.stdout).to_string()
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    paths: WorkspacePaths,
}

async fn setup(docs: &[(&str, &str)]) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    run_git(&root, &["init", "-b", "main"]);
    run_git(&root, &["config", "user.email", "hermes@example.com"]);
    run_git(&root, &["config", "user.name", "Hermes"]);
    std::fs::write(root.join("README.md"), "# project\n").unwrap();
    run_git(&root, &["add", "-A"]);
    run_git(&root, &["commit", "-m", "chore: initial commit"]);

    let paths = WorkspacePaths::at(root.join(".hermes"));
    paths
        .init_workspace(DEFAULT_TEMPLATE)
        .await
        .expect("init workspace");
    for (name, content) in docs {
        std::fs::write(paths.tasks_dir().join(name), content).unwrap();
    }
    Harness {
        _dir: dir,
        root,
        paths,
    }
}

async fn build_ctx(
    harness: &Harness,
    provider: Arc<ScriptedProvider>,
    tweak: impl FnOnce(&mut EngineConfig),
) -> Arc<EngineContext> {
    let mut config = EngineConfig::default();
    tweak(&mut config);
    let providers = ProviderRegistry::with_providers(
        vec![provider as Arc<dyn Provider>],
        "auto".to_string(),
        "auto".to_string(),
    );
    EngineContext::assemble_with(
        harness.paths.clone(),
        config,
        providers,
        harness.root.clone(),
        EventBus::new(),
    )
    .await
    .expect("assemble context")
}

async fn task_status(ctx: &Arc<EngineContext>, id: &str) -> Status {
    ctx.plan
        .get_task(id.parse::<TaskId>().unwrap())
        .await
        .unwrap()
        .status
}

const LINEAR_PLAN: &str = "\
# Feature: F001 - Demo Feature

**Feature ID**: F001
**Feature Name**: Demo Feature
**Priority**: P1
**Status**: NOT_STARTED
**Target Version**: v0.1.0

## Task: T001 - First task

**Task ID**: T001
**Status**: NOT_STARTED
**Priority**: P1

**Dependencies**:
- None

**Success Criteria**:
- [ ] first output exists

## Task: T002 - Second task

**Task ID**: T002
**Status**: NOT_STARTED
**Priority**: P1

**Dependencies**:
- T001

**Success Criteria**:
- [ ] second output exists

## Task: T003 - Third task

**Task ID**: T003
**Status**: NOT_STARTED
**Priority**: P1

**Dependencies**:
- T002

**Success Criteria**:
- [ ] third output exists
";

const INDEPENDENT_PLAN: &str = "\
# Feature: F001 - Demo Feature

**Feature ID**: F001
**Feature Name**: Demo Feature
**Priority**: P1
**Status**: NOT_STARTED

## Task: T001 - First task

**Task ID**: T001
**Status**: NOT_STARTED
**Priority**: P1

**Dependencies**:
- None

## Task: T002 - Second task

**Task ID**: T002
**Status**: NOT_STARTED
**Priority**: P1

**Dependencies**:
- None

## Task: T003 - Third task

**Task ID**: T003
**Status**: NOT_STARTED
**Priority**: P1

**Dependencies**:
- None
";

const CONFLICT_PLAN: &str = "\
# Feature: F001 - Demo Feature

**Feature ID**: F001
**Feature Name**: Demo Feature
**Priority**: P1
**Status**: NOT_STARTED

## Task: T001 - Left edit

**Task ID**: T001
**Status**: NOT_STARTED
**Priority**: P1

**Dependencies**:
- None

## Task: T002 - Right edit

**Task ID**: T002
**Status**: NOT_STARTED
**Priority**: P1

**Dependencies**:
- None
";

// S1: a linear plan completes in order, the feature branch merges once,
// and the target version is tagged.
#[tokio::test]
async fn linear_plan_completes_in_dependency_order() {
    let harness = setup(&[("001-demo.md", LINEAR_PLAN)]).await;
    let provider = ScriptedProvider::new(
        vec![
            Script::completes(vec![("src_one.txt", "one\n")]),
            Script::completes(vec![("src_two.txt", "two\n")]),
            Script::completes(vec![("src_three.txt", "three\n")]),
        ],
        Script::stalls(),
    );
    let ctx = build_ctx(&harness, provider.clone(), |_| {}).await;

    let report = Engine::new(ctx.clone())
        .run(&CancellationToken::new())
        .await
        .expect("run succeeds");

    assert!(report.plan_complete);
    assert_eq!(
        report
            .completed
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>(),
        vec!["T001", "T002", "T003"]
    );
    for id in ["T001", "T002", "T003"] {
        assert_eq!(task_status(&ctx, id).await, Status::Completed);
    }
    assert_eq!(
        ctx.plan
            .get_feature("F001".parse().unwrap())
            .await
            .unwrap()
            .status,
        Status::Completed
    );

    // One feature branch, merged once and deleted.
    let branches = git_stdout(&harness.root, &["branch", "--list", "feature/*"]);
    assert!(branches.trim().is_empty(), "branch survived: {branches}");
    let merges = git_stdout(&harness.root, &["log", "--merges", "--oneline"]);
    assert_eq!(merges.lines().count(), 1, "{merges}");

    // The work landed on the integration branch.
    assert_eq!(git_stdout(&harness.root, &["rev-parse", "--abbrev-ref", "HEAD"]).trim(), "main");
    for file in ["src_one.txt", "src_two.txt", "src_three.txt"] {
        assert!(harness.root.join(file).exists(), "{file} missing on main");
    }
    let tags = git_stdout(&harness.root, &["tag", "--list"]);
    assert!(tags.contains("v0.1.0"), "{tags}");

    // Three calls, zero retries.
    assert_eq!(provider.invocations(), 3);
    assert_eq!(ctx.limiter.calls_made().await, 3);

    let run_state = RunStateStore::load(harness.paths.run_state_file())
        .await
        .unwrap();
    assert!(!run_state.is_resumable().await);
    assert_eq!(run_state.snapshot().await.journal.len(), 3);
}

// S2: three loops with no file changes open the breaker; the run exits with
// CircuitOpen and stays halted until a manual reset.
#[tokio::test]
async fn stagnation_opens_the_breaker_and_halts_subsequent_runs() {
    let harness = setup(&[("001-demo.md", LINEAR_PLAN)]).await;
    let provider = ScriptedProvider::new(Vec::new(), Script::stalls());
    let ctx = build_ctx(&harness, provider.clone(), |_| {}).await;

    let err = Engine::new(ctx.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CIRCUIT_OPEN");
    assert_eq!(provider.invocations(), 3);

    let state = ctx.breaker.state().await;
    assert_eq!(state.reason, "no progress in 3 loops");
    assert_eq!(task_status(&ctx, "T001").await, Status::InProgress);

    // A fresh run without `reset` refuses immediately.
    let ctx2 = build_ctx(&harness, provider.clone(), |_| {}).await;
    let err = Engine::new(ctx2.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CIRCUIT_OPEN");
    assert!(err.to_string().contains("no progress in 3 loops"), "{err}");
    assert_eq!(provider.invocations(), 3, "no further provider calls");

    ctx2.breaker.reset("operator reset").await.unwrap();
    assert!(ctx2.breaker.can_execute().await);
}

// S3: an independent batch runs on isolated worktrees, merges
// deterministically, and cleans up every worktree and branch.
#[tokio::test]
async fn parallel_batch_completes_on_isolated_worktrees() {
    let harness = setup(&[("001-demo.md", INDEPENDENT_PLAN)]).await;
    let provider = ScriptedProvider::new(
        vec![
            Script::completes(vec![("out_a.txt", "a\n")]),
            Script::completes(vec![("out_b.txt", "b\n")]),
            Script::completes(vec![("out_c.txt", "c\n")]),
        ],
        Script::stalls(),
    );
    let ctx = build_ctx(&harness, provider.clone(), |config| {
        config.parallel = true;
        config.max_workers = 3;
    })
    .await;

    let report = Engine::new(ctx.clone())
        .run(&CancellationToken::new())
        .await
        .expect("run succeeds");
    assert!(report.plan_complete);
    assert_eq!(report.completed.len(), 3);
    assert_eq!(provider.invocations(), 3);

    for id in ["T001", "T002", "T003"] {
        assert_eq!(task_status(&ctx, id).await, Status::Completed);
    }
    for file in ["out_a.txt", "out_b.txt", "out_c.txt"] {
        assert!(harness.root.join(file).exists(), "{file} missing on main");
    }

    // Per-task branches and worktrees are gone.
    let branches = git_stdout(&harness.root, &["branch", "--list", "hermes/*"]);
    assert!(branches.trim().is_empty(), "{branches}");
    let leftover: Vec<_> = std::fs::read_dir(harness.paths.worktrees_dir())
        .map(|entries| entries.flatten().collect())
        .unwrap_or_default();
    assert!(leftover.is_empty(), "worktrees left behind: {leftover:?}");
}

// S4: with an hourly budget of 2, the third task blocks until the
// wall-clock hour rolls, then executes.
#[tokio::test]
async fn rate_limited_third_task_waits_for_the_hour_boundary() {
    let harness = setup(&[("001-demo.md", INDEPENDENT_PLAN)]).await;
    let provider = ScriptedProvider::new(
        vec![
            Script::completes(vec![("out_a.txt", "a\n")]),
            Script::completes(vec![("out_b.txt", "b\n")]),
            Script::completes(vec![("out_c.txt", "c\n")]),
        ],
        Script::stalls(),
    );

    let offset = Arc::new(AtomicI64::new(0));
    let clock_offset = offset.clone();
    let clock = move || -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 40, 0).unwrap()
            + chrono::Duration::seconds(clock_offset.load(Ordering::SeqCst))
    };

    let mut config = EngineConfig::default();
    config.calls_per_hour = 2;
    let events = EventBus::new();
    let limiter = RateLimiter::load(
        config.calls_per_hour,
        harness.paths.call_count_file(),
        harness.paths.last_reset_file(),
        events.clone(),
    )
    .await
    .unwrap()
    .with_clock(clock)
    .with_tick(Duration::from_millis(10));

    let ctx = Arc::new(EngineContext {
        plan: PlanStore::load(harness.paths.tasks_dir()).await.unwrap(),
        providers: ProviderRegistry::with_providers(
            vec![provider.clone() as Arc<dyn Provider>],
            "auto".to_string(),
            "auto".to_string(),
        ),
        breaker: CircuitBreaker::load(
            harness.paths.circuit_state_file(),
            harness.paths.circuit_history_file(),
            events.clone(),
        )
        .await
        .unwrap(),
        limiter,
        analyzer: ResponseAnalyzer::load(harness.paths.analyzer_state_file()).await,
        run_state: RunStateStore::load(harness.paths.run_state_file())
            .await
            .unwrap(),
        events,
        paths: harness.paths.clone(),
        config,
        repo_root: harness.root.clone(),
    });

    let engine_ctx = ctx.clone();
    let run = tokio::spawn(async move {
        Engine::new(engine_ctx).run(&CancellationToken::new()).await
    });

    // Two tasks land inside the hour; the third blocks on the budget.
    let mut settled = false;
    for _ in 0..200 {
        let progress = ctx.plan.progress().await;
        if progress.completed_tasks == 2 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(settled, "first two tasks did not complete in time");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.plan.progress().await.completed_tasks, 2);
    assert_eq!(provider.invocations(), 2);

    // Roll the hour; the blocked acquire admits the third task.
    offset.store(1300, Ordering::SeqCst);
    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run finishes after the roll")
        .expect("join")
        .expect("run succeeds");
    assert!(report.plan_complete);
    assert_eq!(provider.invocations(), 3);
    // Only the third call counts against the new hour's window.
    assert_eq!(ctx.limiter.calls_made().await, 1);
}

// S5: a run interrupted between tasks resumes from the journal and
// finishes the remaining work on the same feature branch.
#[tokio::test]
async fn interrupted_run_resumes_with_the_next_task() {
    let harness = setup(&[("001-demo.md", LINEAR_PLAN)]).await;
    let provider = ScriptedProvider::new(
        vec![
            Script::completes(vec![("src_one.txt", "one\n")]),
            Script::cancels(),
        ],
        Script::stalls(),
    );
    let ctx = build_ctx(&harness, provider.clone(), |_| {}).await;
    let err = Engine::new(ctx.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CANCELLED");

    assert_eq!(task_status(&ctx, "T001").await, Status::Completed);
    // Cancellation leaves nothing IN_PROGRESS and journals the interruption.
    assert_eq!(task_status(&ctx, "T002").await, Status::NotStarted);
    let run_state = RunStateStore::load(harness.paths.run_state_file())
        .await
        .unwrap();
    assert!(run_state.is_resumable().await);

    // Relaunch: T002 is selected next and the plan completes.
    let provider2 = ScriptedProvider::new(
        vec![
            Script::completes(vec![("src_two.txt", "two\n")]),
            Script::completes(vec![("src_three.txt", "three\n")]),
        ],
        Script::stalls(),
    );
    let ctx2 = build_ctx(&harness, provider2.clone(), |_| {}).await;
    let report = Engine::new(ctx2.clone())
        .run(&CancellationToken::new())
        .await
        .expect("resume succeeds");
    assert!(report.plan_complete);
    assert_eq!(
        report
            .completed
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>(),
        vec!["T002", "T003"]
    );
    assert_eq!(provider2.invocations(), 2);
    for file in ["src_one.txt", "src_two.txt", "src_three.txt"] {
        assert!(harness.root.join(file).exists(), "{file} missing on main");
    }
}

// S6: two parallel tasks edit the same file; the second merge conflicts and
// the assistant-mediated resolver produces the accepted merged content.
#[tokio::test]
async fn same_file_conflict_is_resolved_by_the_assistant() {
    let harness = setup(&[("001-demo.md", CONFLICT_PLAN)]).await;
    let provider = ScriptedProvider::new(
        vec![
            Script::completes(vec![("shared.txt", "left\n")]),
            Script::completes(vec![("shared.txt", "right\n")]),
            Script::replies("```\nleft and right\n```\n"),
        ],
        Script::stalls(),
    );
    let ctx = build_ctx(&harness, provider.clone(), |config| {
        config.parallel = true;
        config.max_workers = 2;
    })
    .await;

    let report = Engine::new(ctx.clone())
        .run(&CancellationToken::new())
        .await
        .expect("run succeeds");
    assert!(report.plan_complete);
    assert_eq!(task_status(&ctx, "T001").await, Status::Completed);
    assert_eq!(task_status(&ctx, "T002").await, Status::Completed);

    // Two task runs plus one resolution call.
    assert_eq!(provider.invocations(), 3);
    assert_eq!(
        std::fs::read_to_string(harness.root.join("shared.txt")).unwrap(),
        "left and right\n"
    );
    let branches = git_stdout(&harness.root, &["branch", "--list", "hermes/*"]);
    assert!(branches.trim().is_empty(), "{branches}");
    // One integration commit per merge: a merge commit for the clean side
    // and the resolver's merge commit for the conflicted side.
    let merges = git_stdout(&harness.root, &["log", "--merges", "--oneline"]);
    assert_eq!(merges.lines().count(), 2, "{merges}");
}
