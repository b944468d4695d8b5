pub mod git;

pub use git::{Committer, GitError, GitOperator, MergeStyle};
pub use git::libgit::{LibGitOperator, LocalBranch};
