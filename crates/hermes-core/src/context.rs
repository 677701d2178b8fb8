use std::path::PathBuf;
use std::sync::Arc;

use hermes_plan::PlanStore;
use hermes_providers::ProviderRegistry;
use hermes_repo::GitRepo;
use hermes_types::HermesError;

use crate::analyzer::ResponseAnalyzer;
use crate::breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::paths::WorkspacePaths;
use crate::rate_limit::RateLimiter;
use crate::run_state::RunStateStore;

/// Everything the engine shares across workers. Constructed once at start,
/// torn down at exit; each store guards its own mutation.
pub struct EngineContext {
    pub paths: WorkspacePaths,
    pub config: EngineConfig,
    pub plan: PlanStore,
    pub providers: ProviderRegistry,
    pub breaker: CircuitBreaker,
    pub limiter: RateLimiter,
    pub analyzer: ResponseAnalyzer,
    pub run_state: RunStateStore,
    pub events: EventBus,
    pub repo_root: PathBuf,
}

impl EngineContext {
    /// Standard assembly from a workspace and the resolved configuration.
    pub async fn assemble(
        paths: WorkspacePaths,
        config: EngineConfig,
        repo_root: PathBuf,
    ) -> Result<Arc<Self>, HermesError> {
        let events = EventBus::new();
        let providers = ProviderRegistry::new(
            paths.tmp_dir(),
            config.planning_ai.clone(),
            config.coding_ai.clone(),
        );
        Self::assemble_with(paths, config, providers, repo_root, events).await
    }

    /// Assembly with a caller-supplied provider registry (tests inject
    /// scripted providers this way).
    pub async fn assemble_with(
        paths: WorkspacePaths,
        config: EngineConfig,
        providers: ProviderRegistry,
        repo_root: PathBuf,
        events: EventBus,
    ) -> Result<Arc<Self>, HermesError> {
        let plan = PlanStore::load(paths.tasks_dir()).await?;
        let breaker = CircuitBreaker::load(
            paths.circuit_state_file(),
            paths.circuit_history_file(),
            events.clone(),
        )
        .await?;
        let limiter = RateLimiter::load(
            config.calls_per_hour,
            paths.call_count_file(),
            paths.last_reset_file(),
            events.clone(),
        )
        .await?;
        let analyzer = ResponseAnalyzer::load(paths.analyzer_state_file()).await;
        let run_state = RunStateStore::load(paths.run_state_file()).await?;

        Ok(Arc::new(Self {
            paths,
            config,
            plan,
            providers,
            breaker,
            limiter,
            analyzer,
            run_state,
            events,
            repo_root,
        }))
    }

    pub fn repo(&self) -> GitRepo {
        GitRepo::open(&self.repo_root)
    }
}
