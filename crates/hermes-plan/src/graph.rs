use std::collections::HashMap;

use hermes_types::{HermesError, Status, TaskId};

use crate::document::Task;

/// DFS 3-color cycle check over the dependency edges. On a cycle, the error
/// names both endpoints of the back edge.
pub fn detect_cycle(tasks: &[&Task]) -> Result<(), HermesError> {
    let mut adj: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for task in tasks {
        adj.entry(task.id).or_default();
        for dep in &task.dependencies {
            adj.entry(task.id).or_default().push(*dep);
        }
    }

    // 0 = white, 1 = gray, 2 = black
    let mut color: HashMap<TaskId, u8> = adj.keys().map(|id| (*id, 0u8)).collect();
    let mut ids: Vec<TaskId> = adj.keys().copied().collect();
    ids.sort();

    for id in ids {
        if color[&id] == 0 {
            if let Some((from, to)) = find_back_edge(id, &adj, &mut color) {
                return Err(HermesError::invalid_plan(format!(
                    "dependency cycle: back edge {from} -> {to}"
                )));
            }
        }
    }
    Ok(())
}

fn find_back_edge(
    node: TaskId,
    adj: &HashMap<TaskId, Vec<TaskId>>,
    color: &mut HashMap<TaskId, u8>,
) -> Option<(TaskId, TaskId)> {
    color.insert(node, 1);
    if let Some(neighbors) = adj.get(&node) {
        for neighbor in neighbors {
            match color.get(neighbor).copied() {
                Some(1) => return Some((node, *neighbor)),
                Some(0) | None => {
                    if let Some(edge) = find_back_edge(*neighbor, adj, color) {
                        return Some(edge);
                    }
                }
                _ => {}
            }
        }
    }
    color.insert(node, 2);
    None
}

/// Tasks whose dependencies are all COMPLETED and whose own status is
/// NOT_STARTED, in id order.
pub fn ready_task_ids(tasks: &[&Task]) -> Vec<TaskId> {
    let status_by_id: HashMap<TaskId, Status> = tasks.iter().map(|t| (t.id, t.status)).collect();
    let mut ready: Vec<TaskId> = tasks
        .iter()
        .filter(|t| t.status == Status::NotStarted)
        .filter(|t| {
            t.dependencies
                .iter()
                .all(|dep| status_by_id.get(dep) == Some(&Status::Completed))
        })
        .map(|t| t.id)
        .collect();
    ready.sort();
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_types::{FeatureId, Priority};

    fn task(id: &str, status: Status, deps: &[&str]) -> Task {
        Task {
            id: id.parse().unwrap(),
            feature_id: FeatureId::new(1),
            name: id.to_string(),
            status,
            priority: Priority::P2,
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
    fn linear_chain_has_no_cycle() {
        let tasks = vec![
            task("T001", Status::NotStarted, &[]),
            task("T002", Status::NotStarted, &["T001"]),
            task("T003", Status::NotStarted, &["T002"]),
        ];
        let refs: Vec<&Task> = tasks.iter().collect();
        assert!(detect_cycle(&refs).is_ok());
    }

    #[test]
    fn cycle_error_names_back_edge_endpoints() {
        let tasks = vec![
            task("T001", Status::NotStarted, &["T003"]),
            task("T002", Status::NotStarted, &["T001"]),
            task("T003", Status::NotStarted, &["T002"]),
        ];
        let refs: Vec<&Task> = tasks.iter().collect();
        let err = detect_cycle(&refs).unwrap_err().to_string();
        assert!(err.contains("cycle"), "{err}");
        assert!(err.contains("T0"), "{err}");
        assert!(err.contains("->"), "{err}");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let tasks = vec![task("T001", Status::NotStarted, &["T001"])];
        let refs: Vec<&Task> = tasks.iter().collect();
        assert!(detect_cycle(&refs).is_err());
    }

    #[test]
    fn ready_set_requires_completed_dependencies() {
        let tasks = vec![
            task("T001", Status::Completed, &[]),
            task("T002", Status::NotStarted, &["T001"]),
            task("T003", Status::NotStarted, &["T002"]),
            task("T004", Status::InProgress, &[]),
        ];
        let refs: Vec<&Task> = tasks.iter().collect();
        let ready = ready_task_ids(&refs);
        assert_eq!(ready, vec!["T002".parse::<TaskId>().unwrap()]);
    }
}
