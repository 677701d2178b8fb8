use std::collections::BTreeMap;

use hermes_types::{FeatureId, Status};
use serde::Serialize;

use crate::document::Feature;

#[derive(Debug, Clone, Serialize)]
pub struct FeatureProgress {
    pub feature_id: FeatureId,
    pub name: String,
    pub status: Status,
    pub total_tasks: usize,
    pub completed_tasks: usize,
}

impl FeatureProgress {
    pub fn ratio(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.completed_tasks as f64 / self.total_tasks as f64
    }
}

/// Derived view over the plan. Never persisted; always recomputed from the
/// store so it cannot drift.
#[derive(Debug, Clone, Serialize)]
pub struct PlanProgress {
    pub by_status: BTreeMap<String, usize>,
    pub features: Vec<FeatureProgress>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
}

impl PlanProgress {
    pub fn compute(features: &[Feature]) -> Self {
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for status in Status::ALL {
            by_status.insert(status.as_str().to_string(), 0);
        }
        let mut total = 0usize;
        let mut completed = 0usize;
        let mut per_feature = Vec::with_capacity(features.len());

        for feature in features {
            let mut feature_completed = 0usize;
            for task in &feature.tasks {
                total += 1;
                *by_status.entry(task.status.as_str().to_string()).or_insert(0) += 1;
                if task.status == Status::Completed {
                    completed += 1;
                    feature_completed += 1;
                }
            }
            per_feature.push(FeatureProgress {
                feature_id: feature.id,
                name: feature.name.clone(),
                status: feature.status,
                total_tasks: feature.tasks.len(),
                completed_tasks: feature_completed,
            });
        }

        Self {
            by_status,
            features: per_feature,
            total_tasks: total,
            completed_tasks: completed,
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.completed_tasks as f64 * 100.0 / self.total_tasks as f64
    }

    /// The derived `tasks-status.md` summary document.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str("# Plan Status\n\n");
        out.push_str(&format!(
            "**Overall**: {}/{} tasks ({:.1}%)\n\n",
            self.completed_tasks,
            self.total_tasks,
            self.percent_complete()
        ));
        out.push_str("| Feature | Status | Done | Total |\n");
        out.push_str("|---------|--------|------|-------|\n");
        for feature in &self.features {
            out.push_str(&format!(
                "| {} {} | {} | {} | {} |\n",
                feature.feature_id,
                feature.name,
                feature.status,
                feature.completed_tasks,
                feature.total_tasks
            ));
        }
        out.push('\n');
        for (status, count) in &self.by_status {
            if *count > 0 {
                out.push_str(&format!("- {}: {}\n", status, count));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_feature_document;
    use std::path::Path;

    #[test]
    fn computes_counts_and_percentage() {
        let doc = "\
**Feature ID**: F001
**Feature Name**: Demo
**Priority**: P1
**Status**: IN_PROGRESS

## Task: T001 - a

**Status**: COMPLETED
**Priority**: P1

## Task: T002 - b

**Status**: NOT_STARTED
**Priority**: P2
";
        let feature = parse_feature_document(Path::new("001.md"), doc).unwrap();
        let progress = PlanProgress::compute(&[feature]);
        assert_eq!(progress.total_tasks, 2);
        assert_eq!(progress.completed_tasks, 1);
        assert!((progress.percent_complete() - 50.0).abs() < f64::EPSILON);
        assert_eq!(progress.by_status["COMPLETED"], 1);

        let summary = progress.render_summary();
        assert!(summary.contains("F001 Demo"));
        assert!(summary.contains("50.0%"));
    }
}
