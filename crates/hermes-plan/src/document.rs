use std::path::{Path, PathBuf};
use std::str::FromStr;

use hermes_types::{FeatureId, HermesError, Priority, Status, TaskId};

/// One success-criteria checkbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub feature_id: FeatureId,
    pub name: String,
    pub status: Status,
    pub priority: Priority,
    pub estimated_effort: Option<String>,
    pub description: String,
    pub technical_details: String,
    pub files_to_touch: Vec<String>,
    pub dependencies: Vec<TaskId>,
    pub success_criteria: Vec<Criterion>,
    pub parallelizable: bool,
    /// 1-based line of the `## Task:` heading in the owning document.
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct Feature {
    pub id: FeatureId,
    pub name: String,
    pub status: Status,
    pub priority: Priority,
    pub target_version: Option<String>,
    pub estimated_duration: Option<String>,
    pub tasks: Vec<Task>,
    /// The document is the authoritative location; the filename is advisory.
    pub path: PathBuf,
}

impl Feature {
    pub fn is_complete(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == Status::Completed)
    }
}

fn parse_error(path: &Path, line: usize, detail: impl std::fmt::Display) -> HermesError {
    HermesError::invalid_plan(format!("{}:{}: {}", path.display(), line, detail))
}

/// Recognize a `**Key**: value` (or bare `Key: value`) field line. Keys are
/// matched case-insensitively with interior whitespace collapsed.
pub(crate) fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let trimmed = line.trim();
    let stripped = trimmed
        .strip_prefix("**")
        .map(|rest| rest.replacen("**", "", 1))
        .unwrap_or_else(|| trimmed.to_string());
    let (candidate, value) = stripped.split_once(':')?;
    let normalized = candidate.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized == key {
        // The value slice must borrow from the original line so callers can
        // compute byte offsets; re-find it.
        let idx = line.find(':')?;
        return Some(line[idx + 1..].trim());
    }
    None
}

pub(crate) fn is_task_heading(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with("## Task:") || trimmed.starts_with("## task:")
}

pub(crate) fn heading_task_name(line: &str) -> Option<(TaskId, String)> {
    let rest = line.trim().strip_prefix("##")?.trim();
    let rest = rest
        .strip_prefix("Task:")
        .or_else(|| rest.strip_prefix("task:"))?
        .trim();
    let (id_part, name) = match rest.split_once('-') {
        Some((id_part, name)) => (id_part.trim(), name.trim().to_string()),
        None => (rest, String::new()),
    };
    let id = TaskId::from_str(id_part).ok()?;
    Some((id, name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListSection {
    None,
    Files,
    Dependencies,
    Criteria,
    Description,
    TechnicalDetails,
}

/// Parse one feature document. Forgiving about whitespace, strict about
/// identifiers and enumerated values; errors carry path and line.
pub fn parse_feature_document(path: &Path, content: &str) -> Result<Feature, HermesError> {
    let mut feature_id: Option<FeatureId> = None;
    let mut feature_name: Option<String> = None;
    let mut feature_status: Option<Status> = None;
    let mut feature_priority: Option<Priority> = None;
    let mut target_version: Option<String> = None;
    let mut estimated_duration: Option<String> = None;
    let mut tasks: Vec<Task> = Vec::new();

    struct TaskDraft {
        id: TaskId,
        name: String,
        line: usize,
        status: Option<Status>,
        priority: Option<Priority>,
        estimated_effort: Option<String>,
        description: String,
        technical_details: String,
        files: Vec<String>,
        deps: Vec<TaskId>,
        criteria: Vec<Criterion>,
        parallelizable: bool,
    }

    let mut draft: Option<TaskDraft> = None;
    let mut section = ListSection::None;

    let finish = |draft: TaskDraft,
                  feature_id: FeatureId,
                  path: &Path|
     -> Result<Task, HermesError> {
        let status = draft.status.ok_or_else(|| {
            parse_error(path, draft.line, format!("task {} missing Status", draft.id))
        })?;
        let priority = draft.priority.ok_or_else(|| {
            parse_error(path, draft.line, format!("task {} missing Priority", draft.id))
        })?;
        Ok(Task {
            id: draft.id,
            feature_id,
            name: draft.name,
            status,
            priority,
            estimated_effort: draft.estimated_effort,
            description: draft.description.trim().to_string(),
            technical_details: draft.technical_details.trim().to_string(),
            files_to_touch: draft.files,
            dependencies: draft.deps,
            success_criteria: draft.criteria,
            parallelizable: draft.parallelizable,
            line: draft.line,
        })
    };

    for (idx, raw_line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim_end();

        if is_task_heading(line) {
            let (id, name) = heading_task_name(line)
                .ok_or_else(|| parse_error(path, line_no, "malformed task heading"))?;
            if let Some(done) = draft.take() {
                let feature_id = feature_id
                    .ok_or_else(|| parse_error(path, done.line, "task section before feature header"))?;
                tasks.push(finish(done, feature_id, path)?);
            }
            draft = Some(TaskDraft {
                id,
                name,
                line: line_no,
                status: None,
                priority: None,
                estimated_effort: None,
                description: String::new(),
                technical_details: String::new(),
                files: Vec::new(),
                deps: Vec::new(),
                criteria: Vec::new(),
                parallelizable: true,
            });
            section = ListSection::None;
            continue;
        }

        match draft.as_mut() {
            None => {
                // Feature header block.
                if let Some(value) = field_value(line, "feature id") {
                    feature_id = Some(
                        FeatureId::from_str(value)
                            .map_err(|e| parse_error(path, line_no, e))?,
                    );
                } else if let Some(value) = field_value(line, "feature name") {
                    feature_name = Some(value.to_string());
                } else if let Some(value) = field_value(line, "status") {
                    feature_status =
                        Some(Status::from_str(value).map_err(|e| parse_error(path, line_no, e))?);
                } else if let Some(value) = field_value(line, "priority") {
                    feature_priority =
                        Some(Priority::from_str(value).map_err(|e| parse_error(path, line_no, e))?);
                } else if let Some(value) = field_value(line, "target version") {
                    if !value.is_empty() {
                        target_version = Some(value.to_string());
                    }
                } else if let Some(value) = field_value(line, "estimated duration") {
                    if !value.is_empty() {
                        estimated_duration = Some(value.to_string());
                    }
                }
            }
            Some(task) => {
                if let Some(value) = field_value(line, "task id") {
                    let declared = TaskId::from_str(value)
                        .map_err(|e| parse_error(path, line_no, e))?;
                    if declared != task.id {
                        return Err(parse_error(
                            path,
                            line_no,
                            format!("task id field `{declared}` disagrees with heading `{}`", task.id),
                        ));
                    }
                    section = ListSection::None;
                } else if let Some(value) = field_value(line, "status") {
                    task.status =
                        Some(Status::from_str(value).map_err(|e| parse_error(path, line_no, e))?);
                    section = ListSection::None;
                } else if let Some(value) = field_value(line, "priority") {
                    task.priority =
                        Some(Priority::from_str(value).map_err(|e| parse_error(path, line_no, e))?);
                    section = ListSection::None;
                } else if let Some(value) = field_value(line, "estimated effort") {
                    if !value.is_empty() {
                        task.estimated_effort = Some(value.to_string());
                    }
                    section = ListSection::None;
                } else if let Some(value) = field_value(line, "parallelizable") {
                    task.parallelizable = !matches!(
                        value.trim().to_lowercase().as_str(),
                        "false" | "no" | "0"
                    );
                    section = ListSection::None;
                } else if field_value(line, "description").is_some() {
                    section = ListSection::Description;
                    let inline = field_value(line, "description").unwrap_or_default();
                    if !inline.is_empty() {
                        task.description.push_str(inline);
                        task.description.push('\n');
                    }
                } else if field_value(line, "technical details").is_some() {
                    section = ListSection::TechnicalDetails;
                    let inline = field_value(line, "technical details").unwrap_or_default();
                    if !inline.is_empty() {
                        task.technical_details.push_str(inline);
                        task.technical_details.push('\n');
                    }
                } else if field_value(line, "files to touch").is_some() {
                    section = ListSection::Files;
                } else if field_value(line, "dependencies").is_some()
                    || field_value(line, "depends on").is_some()
                {
                    section = ListSection::Dependencies;
                } else if field_value(line, "success criteria").is_some() {
                    section = ListSection::Criteria;
                } else {
                    let trimmed = line.trim();
                    match section {
                        ListSection::Files => {
                            if let Some(item) = trimmed.strip_prefix("- ") {
                                task.files.push(item.trim().to_string());
                            }
                        }
                        ListSection::Dependencies => {
                            if let Some(item) = trimmed.strip_prefix("- ") {
                                let item = item.trim();
                                if !item.eq_ignore_ascii_case("none") {
                                    let dep = TaskId::from_str(item)
                                        .map_err(|e| parse_error(path, line_no, e))?;
                                    task.deps.push(dep);
                                }
                            }
                        }
                        ListSection::Criteria => {
                            if let Some(rest) = trimmed
                                .strip_prefix("- [ ]")
                                .map(|r| (r, false))
                                .or_else(|| trimmed.strip_prefix("- [x]").map(|r| (r, true)))
                                .or_else(|| trimmed.strip_prefix("- [X]").map(|r| (r, true)))
                            {
                                task.criteria.push(Criterion {
                                    text: rest.0.trim().to_string(),
                                    done: rest.1,
                                });
                            }
                        }
                        ListSection::Description => {
                            if !trimmed.is_empty() {
                                task.description.push_str(trimmed);
                                task.description.push('\n');
                            }
                        }
                        ListSection::TechnicalDetails => {
                            if !trimmed.is_empty() {
                                task.technical_details.push_str(trimmed);
                                task.technical_details.push('\n');
                            }
                        }
                        ListSection::None => {}
                    }
                }
            }
        }
    }

    if let Some(done) = draft.take() {
        let fid = feature_id
            .ok_or_else(|| parse_error(path, done.line, "task section before feature header"))?;
        tasks.push(finish(done, fid, path)?);
    }

    let id = feature_id.ok_or_else(|| parse_error(path, 1, "missing Feature ID"))?;
    let name = feature_name.ok_or_else(|| parse_error(path, 1, "missing Feature Name"))?;
    let status = feature_status.ok_or_else(|| parse_error(path, 1, "missing feature Status"))?;
    let priority =
        feature_priority.ok_or_else(|| parse_error(path, 1, "missing feature Priority"))?;

    let mut seen = std::collections::HashSet::new();
    for task in &tasks {
        if !seen.insert(task.id) {
            return Err(parse_error(
                path,
                task.line,
                format!("duplicate task id {}", task.id),
            ));
        }
    }

    Ok(Feature {
        id,
        name,
        status,
        priority,
        target_version,
        estimated_duration,
        tasks,
        path: path.to_path_buf(),
    })
}

/// Render a feature back into its canonical document form. Used when a new
/// feature is appended; existing documents are edited in place, never
/// re-rendered, so operator formatting survives.
pub fn render_feature_document(feature: &Feature) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Feature: {} - {}\n\n", feature.id, feature.name));
    out.push_str(&format!("**Feature ID**: {}\n", feature.id));
    out.push_str(&format!("**Feature Name**: {}\n", feature.name));
    out.push_str(&format!("**Priority**: {}\n", feature.priority));
    out.push_str(&format!("**Status**: {}\n", feature.status));
    if let Some(version) = &feature.target_version {
        out.push_str(&format!("**Target Version**: {}\n", version));
    }
    if let Some(duration) = &feature.estimated_duration {
        out.push_str(&format!("**Estimated Duration**: {}\n", duration));
    }

    for task in &feature.tasks {
        out.push('\n');
        out.push_str(&format!("## Task: {} - {}\n\n", task.id, task.name));
        out.push_str(&format!("**Task ID**: {}\n", task.id));
        out.push_str(&format!("**Status**: {}\n", task.status));
        out.push_str(&format!("**Priority**: {}\n", task.priority));
        if let Some(effort) = &task.estimated_effort {
            out.push_str(&format!("**Estimated Effort**: {}\n", effort));
        }
        if !task.parallelizable {
            out.push_str("**Parallelizable**: false\n");
        }
        if !task.description.is_empty() {
            out.push_str("\n**Description**:\n");
            out.push_str(&task.description);
            out.push('\n');
        }
        if !task.technical_details.is_empty() {
            out.push_str("\n**Technical Details**:\n");
            out.push_str(&task.technical_details);
            out.push('\n');
        }
        if !task.files_to_touch.is_empty() {
            out.push_str("\n**Files to Touch**:\n");
            for file in &task.files_to_touch {
                out.push_str(&format!("- {}\n", file));
            }
        }
        out.push_str("\n**Dependencies**:\n");
        if task.dependencies.is_empty() {
            out.push_str("- None\n");
        } else {
            for dep in &task.dependencies {
                out.push_str(&format!("- {}\n", dep));
            }
        }
        if !task.success_criteria.is_empty() {
            out.push_str("\n**Success Criteria**:\n");
            for criterion in &task.success_criteria {
                let mark = if criterion.done { "x" } else { " " };
                out.push_str(&format!("- [{}] {}\n", mark, criterion.text));
            }
        }
    }
    out
}
