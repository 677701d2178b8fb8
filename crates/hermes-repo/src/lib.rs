mod commit;
mod git;
mod naming;

pub use commit::{build_commit_message, CommitMessage};
pub use git::{GitRepo, TreeSnapshot};
pub use naming::{feature_branch_name, task_branch_name};
