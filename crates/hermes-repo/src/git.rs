use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use hermes_types::HermesError;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Digest-per-path view of the working tree, used to compute the files a
/// single assistant invocation actually changed.
pub type TreeSnapshot = HashMap<String, String>;

/// Thin coordinator over a git working copy (the integration checkout or an
/// isolated worktree). Nothing here mutates the integration branch unless
/// the caller asks for a merge or a tag.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git(&self, args: &[&str]) -> Result<String, HermesError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| HermesError::Io(format!("failed to run git: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HermesError::Io(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Like `git`, but failure is part of the expected protocol (merge
    /// conflicts, missing refs); returns (success, stdout, stderr).
    async fn git_unchecked(&self, args: &[&str]) -> Result<(bool, String, String), HermesError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| HermesError::Io(format!("failed to run git: {err}")))?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }

    pub async fn is_repo(&self) -> bool {
        self.git_unchecked(&["rev-parse", "--git-dir"])
            .await
            .map(|(ok, _, _)| ok)
            .unwrap_or(false)
    }

    pub async fn current_branch(&self) -> Result<String, HermesError> {
        Ok(self
            .git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            .to_string())
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool, HermesError> {
        let reference = format!("refs/heads/{name}");
        let (ok, _, _) = self
            .git_unchecked(&["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        Ok(ok)
    }

    pub async fn create_branch(&self, name: &str, base: Option<&str>) -> Result<(), HermesError> {
        match base {
            Some(base) => self.git(&["branch", name, base]).await?,
            None => self.git(&["branch", name]).await?,
        };
        Ok(())
    }

    pub async fn checkout(&self, name: &str) -> Result<(), HermesError> {
        self.git(&["checkout", name]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str) -> Result<(), HermesError> {
        self.git(&["branch", "-D", name]).await?;
        Ok(())
    }

    pub async fn stage_all(&self) -> Result<(), HermesError> {
        self.git(&["add", "-A"]).await?;
        Ok(())
    }

    pub async fn commit(&self, subject: &str, body: &str) -> Result<String, HermesError> {
        if body.is_empty() {
            self.git(&["commit", "-m", subject]).await?;
        } else {
            self.git(&["commit", "-m", subject, "-m", body]).await?;
        }
        self.head_commit().await
    }

    pub async fn head_commit(&self) -> Result<String, HermesError> {
        Ok(self.git(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    /// Uncommitted paths (staged, unstaged, untracked) from porcelain status.
    pub async fn changed_files(&self) -> Result<Vec<String>, HermesError> {
        let output = self.git(&["status", "--porcelain"]).await?;
        Ok(output
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| {
                let path = &line[3..];
                match path.split_once(" -> ") {
                    Some((_, renamed)) => renamed.to_string(),
                    None => path.to_string(),
                }
            })
            .collect())
    }

    /// Merge `branch` into `base` with an explicit merge commit. On
    /// conflict the merge is aborted, the repository is back in its
    /// pre-merge state, and the conflicted paths are returned in the error.
    pub async fn merge_into_base(
        &self,
        branch: &str,
        base: &str,
        delete_after: bool,
    ) -> Result<String, HermesError> {
        self.checkout(base).await?;
        let message = format!("merge {branch} into {base}");
        let (ok, _, stderr) = self
            .git_unchecked(&["merge", "--no-ff", branch, "-m", &message])
            .await?;
        if !ok {
            let paths = self.conflicted_paths().await?;
            let _ = self.git_unchecked(&["merge", "--abort"]).await;
            if paths.is_empty() {
                return Err(HermesError::Io(format!(
                    "git merge failed: {}",
                    stderr.trim()
                )));
            }
            return Err(HermesError::MergeConflict { paths });
        }
        let hash = self.head_commit().await?;
        if delete_after {
            self.delete_branch(branch).await?;
        }
        debug!(branch, base, commit = %hash, "merged");
        Ok(hash)
    }

    /// Begin a merge without committing, leaving any conflicts in the tree
    /// for the resolver. Returns the conflicted paths (empty means the
    /// merge staged cleanly and only needs `commit`).
    pub async fn start_merge(&self, branch: &str) -> Result<Vec<String>, HermesError> {
        let (ok, _, stderr) = self
            .git_unchecked(&["merge", "--no-ff", "--no-commit", branch])
            .await?;
        let paths = self.conflicted_paths().await?;
        if !ok && paths.is_empty() {
            let _ = self.git_unchecked(&["merge", "--abort"]).await;
            return Err(HermesError::Io(format!(
                "git merge failed: {}",
                stderr.trim()
            )));
        }
        Ok(paths)
    }

    pub async fn abort_merge(&self) -> Result<(), HermesError> {
        let _ = self.git_unchecked(&["merge", "--abort"]).await?;
        Ok(())
    }

    pub async fn conflicted_paths(&self) -> Result<Vec<String>, HermesError> {
        let output = self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Content of one side of an in-progress merge: stage 1 = base,
    /// 2 = ours, 3 = theirs.
    pub async fn merge_stage_content(
        &self,
        stage: u8,
        path: &str,
    ) -> Result<Option<String>, HermesError> {
        let spec = format!(":{stage}:{path}");
        let (ok, stdout, _) = self.git_unchecked(&["show", &spec]).await?;
        Ok(ok.then_some(stdout))
    }

    pub async fn tag_annotated(
        &self,
        name: &str,
        target: &str,
        message: &str,
    ) -> Result<(), HermesError> {
        self.git(&["tag", "-a", name, "-m", message, target]).await?;
        Ok(())
    }

    pub async fn tag_exists(&self, name: &str) -> Result<bool, HermesError> {
        let reference = format!("refs/tags/{name}");
        let (ok, _, _) = self
            .git_unchecked(&["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        Ok(ok)
    }

    /// Check out `branch` (created at `base`) in a new linked worktree at
    /// `path`. The worktree shares the object store but has its own HEAD
    /// and working copy.
    pub async fn add_worktree(
        &self,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<GitRepo, HermesError> {
        let path_text = path.to_string_lossy().to_string();
        self.git(&["worktree", "add", "-b", branch, &path_text, base])
            .await?;
        Ok(GitRepo::open(path))
    }

    pub async fn remove_worktree(&self, path: &Path) -> Result<(), HermesError> {
        let path_text = path.to_string_lossy().to_string();
        self.git(&["worktree", "remove", "--force", &path_text])
            .await?;
        let _ = self.git_unchecked(&["worktree", "prune"]).await;
        Ok(())
    }

    pub async fn list_worktrees(&self) -> Result<Vec<PathBuf>, HermesError> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        Ok(output
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    /// Digest every tracked and untracked (non-ignored) file in one pass.
    pub async fn snapshot_tree(&self) -> Result<TreeSnapshot, HermesError> {
        let listing = self
            .git(&["ls-files", "--cached", "--others", "--exclude-standard"])
            .await?;
        let paths: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect();
        if paths.is_empty() {
            return Ok(TreeSnapshot::new());
        }

        let mut child = Command::new("git")
            .args(["hash-object", "--stdin-paths"])
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| HermesError::Io(format!("failed to run git hash-object: {err}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            let joined = paths.join("\n") + "\n";
            stdin
                .write_all(joined.as_bytes())
                .await
                .map_err(|err| HermesError::Io(err.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|err| HermesError::Io(err.to_string()))?;
        let digests: Vec<&str> = std::str::from_utf8(&output.stdout)
            .unwrap_or("")
            .lines()
            .collect();

        // A path deleted between listing and hashing yields a short digest
        // list; pair what we can and let diff_since flag the rest.
        Ok(paths
            .into_iter()
            .zip(digests.into_iter().map(ToString::to_string))
            .collect())
    }

    /// Paths added, removed, or modified since `before`.
    pub async fn diff_since(&self, before: &TreeSnapshot) -> Result<Vec<String>, HermesError> {
        let after = self.snapshot_tree().await?;
        let mut changed: Vec<String> = Vec::new();
        for (path, digest) in &after {
            if before.get(path) != Some(digest) {
                changed.push(path.clone());
            }
        }
        for path in before.keys() {
            if !after.contains_key(path) {
                changed.push(path.clone());
            }
        }
        changed.sort();
        Ok(changed)
    }
}
