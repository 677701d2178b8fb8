/// Conventional commit text for a completed task or component change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    pub subject: String,
    pub body: String,
}

/// `feat(<scope>): <message>` with a body enumerating the satisfied
/// criteria and the files touched.
pub fn build_commit_message(
    scope: &str,
    message: &str,
    criteria: &[String],
    files: &[String],
) -> CommitMessage {
    let subject = format!("feat({scope}): {message}");
    let mut body = String::new();
    if !criteria.is_empty() {
        body.push_str("Satisfied criteria:\n");
        for criterion in criteria {
            body.push_str(&format!("- {criterion}\n"));
        }
    }
    if !files.is_empty() {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("Files:\n");
        for file in files {
            body.push_str(&format!("- {file}\n"));
        }
    }
    CommitMessage { subject, body }
}
