mod document;
mod graph;
mod progress;
mod store;

pub use document::{parse_feature_document, render_feature_document, Criterion, Feature, Task};
pub use graph::{detect_cycle, ready_task_ids};
pub use progress::{FeatureProgress, PlanProgress};
pub use store::PlanStore;
