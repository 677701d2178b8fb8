use hermes_plan::{Feature, Task};

pub const CONTEXT_START: &str = "<!-- hermes:context:start -->";
pub const CONTEXT_END: &str = "<!-- hermes:context:end -->";

/// Default PROMPT.md written by `init`. The operator owns the file; the
/// engine only ever rewrites the delimited context region.
pub const DEFAULT_TEMPLATE: &str = "\
# Hermes Task Prompt

You are working inside a git checkout on the branch named in the context
block. Implement exactly one task, commit nothing yourself, and keep the
working tree buildable.

When you finish the task, print a line `TASK COMPLETE: <task id>`.
If you cannot proceed, print `TASK BLOCKED: <reason>`.
If every task in the plan is already done, print `ALL TASKS COMPLETE`.

<!-- hermes:context:start -->
<!-- hermes:context:end -->
";

#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    pub feature: &'a Feature,
    pub task: &'a Task,
    pub branch: &'a str,
}

fn render_context(ctx: &TaskContext<'_>) -> String {
    let task = ctx.task;
    let mut out = String::new();
    out.push_str(&format!(
        "## Current Task\n\nFeature: {} - {}\nTask: {} - {}\nBranch: {}\n",
        ctx.feature.id, ctx.feature.name, task.id, task.name, ctx.branch
    ));
    if !task.description.is_empty() {
        out.push_str(&format!("\n### Description\n{}\n", task.description));
    }
    if !task.technical_details.is_empty() {
        out.push_str(&format!(
            "\n### Technical Notes\n{}\n",
            task.technical_details
        ));
    }
    if !task.files_to_touch.is_empty() {
        out.push_str("\n### Files Likely Involved\n");
        for file in &task.files_to_touch {
            out.push_str(&format!("- {file}\n"));
        }
    }
    if !task.success_criteria.is_empty() {
        out.push_str("\n### Success Criteria\n");
        for criterion in &task.success_criteria {
            out.push_str(&format!("- {}\n", criterion.text));
        }
    }
    out
}

/// Replace the delimited region of the template with this task's context.
/// Injection is idempotent: re-running against an already-injected
/// template produces the same document.
pub fn inject_context(template: &str, ctx: &TaskContext<'_>) -> String {
    let context = render_context(ctx);
    let block = format!("{CONTEXT_START}\n{context}{CONTEXT_END}");
    match (template.find(CONTEXT_START), template.find(CONTEXT_END)) {
        (Some(start), Some(end)) if end >= start => {
            let after = end + CONTEXT_END.len();
            format!("{}{}{}", &template[..start], block, &template[after..])
        }
        // Missing or mangled markers: append a fresh region instead of
        // guessing at the operator's layout.
        _ => format!("{}\n{}\n", template.trim_end(), block),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_plan::parse_feature_document;
    use std::path::Path;

    const DOC: &str = "\
**Feature ID**: F001
**Feature Name**: Demo
**Priority**: P1
**Status**: NOT_STARTED

## Task: T001 - first

**Status**: NOT_STARTED
**Priority**: P1

**Description**:
Build the thing.

**Files to Touch**:
- src/thing.rs

**Success Criteria**:
- [ ] thing exists
";

    fn feature() -> Feature {
        parse_feature_document(Path::new("001.md"), DOC).unwrap()
    }

    #[test]
    fn injects_task_context_between_markers() {
        let feature = feature();
        let ctx = TaskContext {
            feature: &feature,
            task: &feature.tasks[0],
            branch: "feature/F001-demo",
        };
        let injected = inject_context(DEFAULT_TEMPLATE, &ctx);
        assert!(injected.contains("Task: T001 - first"));
        assert!(injected.contains("Branch: feature/F001-demo"));
        assert!(injected.contains("- src/thing.rs"));
        assert!(injected.contains("- thing exists"));
        // Operator text outside the region is untouched.
        assert!(injected.contains("# Hermes Task Prompt"));
    }

    #[test]
    fn reinjection_is_idempotent() {
        let feature = feature();
        let ctx = TaskContext {
            feature: &feature,
            task: &feature.tasks[0],
            branch: "feature/F001-demo",
        };
        let once = inject_context(DEFAULT_TEMPLATE, &ctx);
        let twice = inject_context(&once, &ctx);
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_markers_appends_a_region() {
        let feature = feature();
        let ctx = TaskContext {
            feature: &feature,
            task: &feature.tasks[0],
            branch: "main",
        };
        let injected = inject_context("custom template without markers", &ctx);
        assert!(injected.starts_with("custom template without markers"));
        assert!(injected.contains(CONTEXT_START));
        assert_eq!(inject_context(&injected, &ctx), injected);
    }
}
