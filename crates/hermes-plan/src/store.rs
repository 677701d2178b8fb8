use std::collections::HashSet;
use std::path::{Path, PathBuf};

use hermes_types::{FeatureId, HermesError, Status, TaskId};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::document::{
    field_value, heading_task_name, is_task_heading, parse_feature_document,
    render_feature_document, Feature, Task,
};
use crate::graph::{detect_cycle, ready_task_ids};
use crate::progress::PlanProgress;

const STATUS_SUMMARY_FILE: &str = "tasks-status.md";
const RESERVED_DOCS: [&str; 2] = [STATUS_SUMMARY_FILE, "run-state.md"];

/// The plan store owns the feature documents in one directory and is the
/// only mutator of task/feature status. Mutations rewrite exactly the
/// affected field and replace the document atomically (tmp write + rename).
#[derive(Debug)]
pub struct PlanStore {
    tasks_dir: PathBuf,
    features: RwLock<Vec<Feature>>,
}

impl PlanStore {
    pub async fn load(tasks_dir: impl AsRef<Path>) -> Result<Self, HermesError> {
        let tasks_dir = tasks_dir.as_ref().to_path_buf();
        fs::create_dir_all(&tasks_dir).await?;
        let features = read_all_features(&tasks_dir).await?;
        validate_plan(&features)?;
        debug!(
            count = features.len(),
            dir = %tasks_dir.display(),
            "plan loaded"
        );
        Ok(Self {
            tasks_dir,
            features: RwLock::new(features),
        })
    }

    pub async fn reload(&self) -> Result<(), HermesError> {
        let features = read_all_features(&self.tasks_dir).await?;
        validate_plan(&features)?;
        *self.features.write().await = features;
        Ok(())
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    pub async fn list_features(&self) -> Vec<Feature> {
        self.features.read().await.clone()
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.features
            .read()
            .await
            .iter()
            .flat_map(|f| f.tasks.iter().cloned())
            .collect()
    }

    pub async fn get_feature(&self, id: FeatureId) -> Result<Feature, HermesError> {
        self.features
            .read()
            .await
            .iter()
            .find(|f| f.id == id)
            .cloned()
            .ok_or_else(|| HermesError::not_found(format!("feature {id}")))
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, HermesError> {
        self.features
            .read()
            .await
            .iter()
            .flat_map(|f| f.tasks.iter())
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| HermesError::not_found(format!("task {id}")))
    }

    /// Rewrite exactly the status field of the matching task section. The
    /// document either ends up with the new status or is left unchanged.
    pub async fn set_task_status(&self, id: TaskId, status: Status) -> Result<(), HermesError> {
        let mut features = self.features.write().await;
        let feature = features
            .iter_mut()
            .find(|f| f.tasks.iter().any(|t| t.id == id))
            .ok_or_else(|| HermesError::not_found(format!("task {id}")))?;
        let Some(task) = feature.tasks.iter_mut().find(|t| t.id == id) else {
            return Err(HermesError::not_found(format!("task {id}")));
        };

        if !task.status.can_transition_to(status) {
            return Err(HermesError::invariant(format!(
                "task {id}: illegal transition {} -> {}",
                task.status, status
            )));
        }

        let content = fs::read_to_string(&feature.path).await?;
        let updated = edit_task_status(&content, id, status)?;
        write_atomic(&feature.path, &updated).await?;
        task.status = status;

        let summary = PlanProgress::compute(&features).render_summary();
        drop(features);
        self.write_summary(&summary).await
    }

    pub async fn set_feature_status(
        &self,
        id: FeatureId,
        status: Status,
    ) -> Result<(), HermesError> {
        let mut features = self.features.write().await;
        let feature = features
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| HermesError::not_found(format!("feature {id}")))?;

        let content = fs::read_to_string(&feature.path).await?;
        let updated = edit_feature_status(&content, status)?;
        write_atomic(&feature.path, &updated).await?;
        feature.status = status;

        let summary = PlanProgress::compute(&features).render_summary();
        drop(features);
        self.write_summary(&summary).await
    }

    /// Mark every success-criteria checkbox of the task's section as done.
    pub async fn complete_success_criteria(&self, id: TaskId) -> Result<(), HermesError> {
        let mut features = self.features.write().await;
        let feature = features
            .iter_mut()
            .find(|f| f.tasks.iter().any(|t| t.id == id))
            .ok_or_else(|| HermesError::not_found(format!("task {id}")))?;
        let Some(task) = feature.tasks.iter_mut().find(|t| t.id == id) else {
            return Err(HermesError::not_found(format!("task {id}")));
        };

        let content = fs::read_to_string(&feature.path).await?;
        let updated = mark_task_criteria_done(&content, id)?;
        write_atomic(&feature.path, &updated).await?;
        for criterion in &mut task.success_criteria {
            criterion.done = true;
        }
        Ok(())
    }

    /// (next feature id, next task id) = 1 + max over existing ids.
    pub async fn next_ids(&self) -> (FeatureId, TaskId) {
        let features = self.features.read().await;
        let next_feature = features
            .iter()
            .map(|f| f.id.index())
            .max()
            .map(|n| FeatureId::new(n + 1))
            .unwrap_or_else(|| FeatureId::new(1));
        let next_task = features
            .iter()
            .flat_map(|f| f.tasks.iter())
            .map(|t| t.id.index())
            .max()
            .map(|n| TaskId::new(n + 1))
            .unwrap_or_else(|| TaskId::new(1));
        (next_feature, next_task)
    }

    /// Write a new feature document. The feature id must continue the
    /// sequence and its task ids must be contiguous after the current max.
    pub async fn append_feature(&self, feature: &Feature) -> Result<PathBuf, HermesError> {
        let (expected_feature, expected_task) = self.next_ids().await;
        if feature.id != expected_feature {
            return Err(HermesError::id_collision(format!(
                "feature id {} (expected {expected_feature})",
                feature.id
            )));
        }
        let mut expected = expected_task;
        for task in &feature.tasks {
            if task.id != expected {
                return Err(HermesError::id_collision(format!(
                    "task id {} (expected {expected})",
                    task.id
                )));
            }
            expected = expected.next();
        }

        let path = self
            .tasks_dir
            .join(format!("{:03}-{}.md", feature.id.index(), slugify(&feature.name)));
        let mut stored = feature.clone();
        stored.path = path.clone();
        write_atomic(&path, &render_feature_document(&stored)).await?;

        let mut features = self.features.write().await;
        features.push(stored);
        features.sort_by_key(|f| f.id);
        let summary = PlanProgress::compute(&features).render_summary();
        drop(features);
        self.write_summary(&summary).await?;
        Ok(path)
    }

    /// All tasks whose dependencies are all COMPLETED and whose own status
    /// is NOT_STARTED.
    pub async fn ready_tasks(&self) -> Vec<Task> {
        let features = self.features.read().await;
        let all: Vec<&Task> = features.iter().flat_map(|f| f.tasks.iter()).collect();
        let ready = ready_task_ids(&all);
        let ready_set: HashSet<TaskId> = ready.into_iter().collect();
        all.into_iter()
            .filter(|t| ready_set.contains(&t.id))
            .cloned()
            .collect()
    }

    /// Highest-priority ready task (ties broken by lowest id); if none are
    /// ready but some are IN_PROGRESS, the oldest of those.
    pub async fn next_task(&self) -> Option<Task> {
        let mut ready = self.ready_tasks().await;
        ready.sort_by_key(|t| (t.priority, t.id));
        if let Some(task) = ready.into_iter().next() {
            return Some(task);
        }
        let mut in_progress: Vec<Task> = self
            .list_tasks()
            .await
            .into_iter()
            .filter(|t| t.status == Status::InProgress)
            .collect();
        in_progress.sort_by_key(|t| t.id);
        in_progress.into_iter().next()
    }

    pub async fn progress(&self) -> PlanProgress {
        PlanProgress::compute(&self.features.read().await)
    }

    pub async fn write_status_summary(&self) -> Result<(), HermesError> {
        let summary = self.progress().await.render_summary();
        self.write_summary(&summary).await
    }

    async fn write_summary(&self, summary: &str) -> Result<(), HermesError> {
        write_atomic(&self.tasks_dir.join(STATUS_SUMMARY_FILE), summary).await
    }
}

async fn read_all_features(tasks_dir: &Path) -> Result<Vec<Feature>, HermesError> {
    let mut features = Vec::new();
    let mut dir = fs::read_dir(tasks_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".md") || RESERVED_DOCS.contains(&name) {
            continue;
        }
        let content = fs::read_to_string(&path).await?;
        features.push(parse_feature_document(&path, &content)?);
    }
    features.sort_by_key(|f| f.id);
    Ok(features)
}

fn validate_plan(features: &[Feature]) -> Result<(), HermesError> {
    let mut feature_ids = HashSet::new();
    let mut task_ids = HashSet::new();
    for feature in features {
        if !feature_ids.insert(feature.id) {
            return Err(HermesError::invalid_plan(format!(
                "duplicate feature id {} ({})",
                feature.id,
                feature.path.display()
            )));
        }
        for task in &feature.tasks {
            if !task_ids.insert(task.id) {
                return Err(HermesError::invalid_plan(format!(
                    "duplicate task id {} ({})",
                    task.id,
                    feature.path.display()
                )));
            }
        }
    }

    for feature in features {
        for task in &feature.tasks {
            for dep in &task.dependencies {
                if !task_ids.contains(dep) {
                    return Err(HermesError::invalid_plan(format!(
                        "task {} depends on unknown task {dep} ({})",
                        task.id,
                        feature.path.display()
                    )));
                }
            }
        }
    }

    let all: Vec<&Task> = features.iter().flat_map(|f| f.tasks.iter()).collect();
    detect_cycle(&all)
}

async fn write_atomic(path: &Path, content: &str) -> Result<(), HermesError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_hyphen = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "feature".to_string()
    } else {
        slug
    }
}

/// Byte range of a task's section: from its heading line to just before the
/// next task heading (or EOF).
fn task_section_bounds(content: &str, id: TaskId) -> Result<(usize, usize), HermesError> {
    let mut start: Option<usize> = None;
    let mut offset = 0usize;

    for line in content.split_inclusive('\n') {
        if is_task_heading(line) {
            if let Some(found) = start {
                return Ok((found, offset));
            }
            if heading_task_name(line).map(|(hid, _)| hid) == Some(id) {
                start = Some(offset);
            }
        }
        offset += line.len();
    }

    match start {
        Some(s) => Ok((s, content.len())),
        None => Err(HermesError::not_found(format!("task section {id}"))),
    }
}

/// Replace only the value of the first `Status` field inside the task's
/// section; every other byte of the document is preserved.
fn edit_task_status(content: &str, id: TaskId, status: Status) -> Result<String, HermesError> {
    let (start, end) = task_section_bounds(content, id)?;
    let section = &content[start..end];
    let replaced = replace_status_line(section).ok_or_else(|| {
        HermesError::invariant(format!("task {id} has no Status field to rewrite"))
    })?;
    let mut out = String::with_capacity(content.len());
    out.push_str(&content[..start]);
    out.push_str(&section[..replaced.0]);
    out.push_str(&rewrite_status_value(&section[replaced.0..replaced.1], status));
    out.push_str(&section[replaced.1..]);
    out.push_str(&content[end..]);
    Ok(out)
}

/// Replace the feature-level status line (the first one before any task
/// heading).
fn edit_feature_status(content: &str, status: Status) -> Result<String, HermesError> {
    let header_end = content
        .split_inclusive('\n')
        .scan(0usize, |offset, line| {
            let start = *offset;
            *offset += line.len();
            Some((start, line))
        })
        .find(|(_, line)| {
            let t = line.trim();
            t.starts_with("## Task:") || t.starts_with("## task:")
        })
        .map(|(start, _)| start)
        .unwrap_or(content.len());

    let header = &content[..header_end];
    let replaced = replace_status_line(header).ok_or_else(|| {
        HermesError::invariant("feature header has no Status field to rewrite".to_string())
    })?;
    let mut out = String::with_capacity(content.len());
    out.push_str(&header[..replaced.0]);
    out.push_str(&rewrite_status_value(&header[replaced.0..replaced.1], status));
    out.push_str(&header[replaced.1..]);
    out.push_str(&content[header_end..]);
    Ok(out)
}

/// Byte range of the first status field line within `text`.
fn replace_status_line(text: &str) -> Option<(usize, usize)> {
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        if field_value(line.trim_end_matches(['\n', '\r']), "status").is_some() {
            return Some((offset, offset + line.len()));
        }
        offset += line.len();
    }
    None
}

fn rewrite_status_value(line: &str, status: Status) -> String {
    let Some(colon) = line.find(':') else {
        return line.to_string();
    };
    let trailing_newline = if line.ends_with('\n') { "\n" } else { "" };
    format!("{}: {}{}", &line[..colon], status, trailing_newline)
}

fn mark_task_criteria_done(content: &str, id: TaskId) -> Result<String, HermesError> {
    let (start, end) = task_section_bounds(content, id)?;
    let section = &content[start..end];
    let updated = section
        .split_inclusive('\n')
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("- [ ]") {
                line.replacen("- [ ]", "- [x]", 1)
            } else {
                line.to_string()
            }
        })
        .collect::<String>();
    let mut out = String::with_capacity(content.len());
    out.push_str(&content[..start]);
    out.push_str(&updated);
    out.push_str(&content[end..]);
    Ok(out)
}
