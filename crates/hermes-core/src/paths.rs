use std::path::{Path, PathBuf};

use hermes_types::HermesError;
use tokio::fs;

pub const WORKSPACE_ENV: &str = "HERMES_HOME";
const DEFAULT_WORKSPACE: &str = ".hermes";

/// Resolution and layout of the on-disk workspace. Everything the engine
/// persists lives under one root: flag wins, then the environment
/// override, then `./.hermes`.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn resolve(flag: Option<PathBuf>) -> Self {
        if let Some(root) = flag {
            return Self { root };
        }
        if let Ok(dir) = std::env::var(WORKSPACE_ENV) {
            if !dir.trim().is_empty() {
                return Self {
                    root: PathBuf::from(dir),
                };
            }
        }
        Self {
            root: PathBuf::from(DEFAULT_WORKSPACE),
        }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn prompt_template(&self) -> PathBuf {
        self.root.join("PROMPT.md")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn run_state_file(&self) -> PathBuf {
        self.tasks_dir().join("run-state.md")
    }

    pub fn circuit_state_file(&self) -> PathBuf {
        self.root.join("circuit-state.json")
    }

    pub fn circuit_history_file(&self) -> PathBuf {
        self.root.join("circuit-history.json")
    }

    pub fn analyzer_state_file(&self) -> PathBuf {
        self.root.join("analyzer-state.json")
    }

    pub fn call_count_file(&self) -> PathBuf {
        self.root.join(".call_count")
    }

    pub fn last_reset_file(&self) -> PathBuf {
        self.root.join(".last_reset")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    pub fn worktree_dir(&self, task: hermes_types::TaskId) -> PathBuf {
        self.worktrees_dir().join(task.to_string())
    }

    /// Create the workspace skeleton. Existing files are left alone so
    /// re-running `init` is harmless.
    pub async fn init_workspace(&self, default_prompt: &str) -> Result<(), HermesError> {
        for dir in [
            self.root.clone(),
            self.tasks_dir(),
            self.logs_dir(),
            self.tmp_dir(),
            self.worktrees_dir(),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        // Keep engine state out of the repository's working-tree diffs.
        let gitignore = self.root.join(".gitignore");
        if !gitignore.exists() {
            fs::write(gitignore, "*\n").await?;
        }
        if !self.prompt_template().exists() {
            fs::write(self.prompt_template(), default_prompt).await?;
        }
        Ok(())
    }
}
