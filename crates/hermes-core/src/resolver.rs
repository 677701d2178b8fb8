use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hermes_providers::Provider;
use hermes_repo::GitRepo;
use hermes_types::{ExecuteOptions, HermesError, TaskId, TaskResult};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConflictPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Merge concluded with the given commit.
    Resolved { commit: String },
    /// Policy says to re-run the losing task after the other lands.
    Reschedule,
    /// No resolution; the caller degrades the task.
    Unresolved,
}

/// Detects and (optionally) resolves merge conflicts between sibling
/// branches, dispatching same-hunk conflicts to the assistant when the
/// policy allows it.
pub struct ConflictResolver {
    policy: ConflictPolicy,
    validate_merges: bool,
}

/// Pairs of results whose `files_changed` intersect; disjoint pairs
/// auto-merge without intervention.
pub fn overlapping_files(results: &[TaskResult]) -> Vec<(TaskId, TaskId, Vec<String>)> {
    let mut overlaps = Vec::new();
    for (i, left) in results.iter().enumerate() {
        for right in &results[i + 1..] {
            let shared: Vec<String> = left
                .files_changed
                .iter()
                .filter(|f| right.files_changed.contains(f))
                .cloned()
                .collect();
            if !shared.is_empty() {
                overlaps.push((left.task_id, right.task_id, shared));
            }
        }
    }
    overlaps
}

/// Pull the merged file out of an assistant reply: the first fenced code
/// block if there is one, the whole reply otherwise.
pub fn extract_file_content(reply: &str) -> String {
    let trimmed = reply.trim();
    if let Some(fence_start) = trimmed.find("```") {
        let after_fence = &trimmed[fence_start + 3..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        if let Some(fence_end) = body.find("```") {
            return body[..fence_end].to_string();
        }
    }
    let mut content = trimmed.to_string();
    content.push('\n');
    content
}

/// Cheap acceptance check, keyed by extension. File types without a
/// validator are accepted optimistically.
pub fn validate_file_content(path: &str, content: &str) -> bool {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str::<serde_json::Value>(content).is_ok(),
        _ => true,
    }
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy, validate_merges: bool) -> Self {
        Self {
            policy,
            validate_merges,
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Resolve a merge of `branch` into the currently checked-out base that
    /// the coordinator already reported as conflicting. The repository is
    /// in its pre-merge state on entry and on every non-`Resolved` exit.
    pub async fn resolve(
        &self,
        repo: &GitRepo,
        branch: &str,
        left_intent: &str,
        right_intent: &str,
        provider: Option<&Arc<dyn Provider>>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResolutionOutcome, HermesError> {
        match self.policy {
            ConflictPolicy::AutoMergeOnly => Ok(ResolutionOutcome::Unresolved),
            ConflictPolicy::SequentialFallback => Ok(ResolutionOutcome::Reschedule),
            ConflictPolicy::AssistantMediated => {
                let Some(provider) = provider else {
                    return Ok(ResolutionOutcome::Unresolved);
                };
                self.assistant_resolve(repo, branch, left_intent, right_intent, provider, timeout, cancel)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn assistant_resolve(
        &self,
        repo: &GitRepo,
        branch: &str,
        left_intent: &str,
        right_intent: &str,
        provider: &Arc<dyn Provider>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResolutionOutcome, HermesError> {
        let conflicted = repo.start_merge(branch).await?;
        if conflicted.is_empty() {
            // Three-way merge handled it; only the commit is missing.
            repo.stage_all().await?;
            let commit = repo
                .commit(&format!("merge {branch} (auto-resolved)"), "")
                .await?;
            return Ok(ResolutionOutcome::Resolved { commit });
        }

        for path in &conflicted {
            if cancel.is_cancelled() {
                repo.abort_merge().await?;
                return Err(HermesError::Cancelled);
            }
            let base = repo.merge_stage_content(1, path).await?.unwrap_or_default();
            let ours = repo.merge_stage_content(2, path).await?.unwrap_or_default();
            let theirs = repo.merge_stage_content(3, path).await?.unwrap_or_default();

            let prompt = resolution_prompt(path, &base, &ours, &theirs, left_intent, right_intent);
            let result = provider
                .execute(
                    ExecuteOptions {
                        prompt,
                        working_dir: repo.root().to_path_buf(),
                        timeout,
                        stream: false,
                    },
                    cancel.clone(),
                )
                .await;

            let merged = match result {
                Ok(result) if result.success => extract_file_content(&result.output),
                Ok(result) => {
                    warn!(path, error = ?result.error, "assistant failed to produce a merge");
                    repo.abort_merge().await?;
                    return Ok(ResolutionOutcome::Unresolved);
                }
                Err(err) => {
                    repo.abort_merge().await?;
                    return Err(err);
                }
            };

            if self.validate_merges && !validate_file_content(path, &merged) {
                warn!(path, "assistant merge failed validation");
                repo.abort_merge().await?;
                return Ok(ResolutionOutcome::Unresolved);
            }
            tokio::fs::write(repo.root().join(path), merged).await?;
        }

        repo.stage_all().await?;
        let commit = repo
            .commit(
                &format!("merge {branch} (assistant-resolved)"),
                &format!("Conflicted paths:\n{}", list_paths(&conflicted)),
            )
            .await?;
        info!(branch, commit = %commit, files = conflicted.len(), "assistant-mediated merge");
        Ok(ResolutionOutcome::Resolved { commit })
    }
}

fn list_paths(paths: &[String]) -> String {
    paths
        .iter()
        .map(|p| format!("- {p}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn resolution_prompt(
    path: &str,
    base: &str,
    ours: &str,
    theirs: &str,
    left_intent: &str,
    right_intent: &str,
) -> String {
    format!(
        "Two branches changed `{path}` in the same region and git cannot merge \
them. Produce the full merged file content, honoring both intents.\n\n\
Intent of the change already on the integration branch:\n{left_intent}\n\n\
Intent of the incoming branch:\n{right_intent}\n\n\
### Common ancestor\n```\n{base}\n```\n\n\
### Integration branch version\n```\n{ours}\n```\n\n\
### Incoming branch version\n```\n{theirs}\n```\n\n\
Reply with only the merged file content in a single fenced code block."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hermes_types::TokenUsage;

    fn result(task: &str, files: &[&str]) -> TaskResult {
        TaskResult {
            task_id: task.parse().unwrap(),
            success: true,
            output: String::new(),
            files_changed: files.iter().map(ToString::to_string).collect(),
            error: None,
            branch_name: None,
            duration_seconds: 1.0,
            usage: TokenUsage::default(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn disjoint_results_have_no_overlap() {
        let results = vec![
            result("T001", &["src/a.rs"]),
            result("T002", &["src/b.rs"]),
        ];
        assert!(overlapping_files(&results).is_empty());
    }

    #[test]
    fn shared_files_are_reported_pairwise() {
        let results = vec![
            result("T001", &["src/a.rs", "src/shared.rs"]),
            result("T002", &["src/shared.rs"]),
            result("T003", &["src/c.rs"]),
        ];
        let overlaps = overlapping_files(&results);
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].0.to_string(), "T001");
        assert_eq!(overlaps[0].1.to_string(), "T002");
        assert_eq!(overlaps[0].2, vec!["src/shared.rs".to_string()]);
    }

    #[test]
    fn extracts_fenced_content() {
        let reply = "Here is the merged file:\n```rust\nfn main() {}\n```\nDone.";
        assert_eq!(extract_file_content(reply), "fn main() {}\n");
    }

    #[test]
    fn plain_reply_is_taken_verbatim() {
        assert_eq!(extract_file_content("line one\nline two"), "line one\nline two\n");
    }

    #[test]
    fn json_validator_rejects_garbage() {
        assert!(validate_file_content("config.json", "{\"ok\": true}"));
        assert!(!validate_file_content("config.json", "{not json"));
        assert!(validate_file_content("main.rs", "anything goes"));
    }

    #[tokio::test]
    async fn auto_merge_only_never_consults_the_assistant() {
        let resolver = ConflictResolver::new(ConflictPolicy::AutoMergeOnly, false);
        let repo = GitRepo::open("/nonexistent");
        let outcome = resolver
            .resolve(
                &repo,
                "hermes/T002",
                "left",
                "right",
                None,
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ResolutionOutcome::Unresolved);
    }

    #[tokio::test]
    async fn sequential_fallback_requests_reschedule() {
        let resolver = ConflictResolver::new(ConflictPolicy::SequentialFallback, false);
        let repo = GitRepo::open("/nonexistent");
        let outcome = resolver
            .resolve(
                &repo,
                "hermes/T002",
                "left",
                "right",
                None,
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ResolutionOutcome::Reschedule);
    }
}
