use hermes_types::{FeatureId, TaskId};

const MAX_BRANCH_LEN: usize = 60;

/// `feature/<id>-<sanitized-name>`: lowercased, non-alphanumerics collapsed
/// to single hyphens, bounded length.
pub fn feature_branch_name(id: FeatureId, name: &str) -> String {
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
    let slug = slug.trim_end_matches('-');
    let mut branch = if slug.is_empty() {
        format!("feature/{id}")
    } else {
        format!("feature/{id}-{slug}")
    };
    if branch.len() > MAX_BRANCH_LEN {
        branch.truncate(MAX_BRANCH_LEN);
        while branch.ends_with('-') {
            branch.pop();
        }
    }
    branch
}

/// Per-task branch used in parallel mode.
pub fn task_branch_name(id: TaskId) -> String {
    format!("hermes/{id}")
}
