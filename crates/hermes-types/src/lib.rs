mod error;
mod event;
mod execution;
mod ids;
mod plan;

pub use error::HermesError;
pub use event::EngineEvent;
pub use execution::{
    ExecuteOptions, ExecutionResult, StreamEvent, TaskKind, TaskResult, TokenUsage,
};
pub use ids::{FeatureId, TaskId};
pub use plan::{Priority, Status};
