use std::path::PathBuf;
use thiserror::Error;

/// Typed errors for the core. Fatal variants are returned wrapped in
/// `anyhow::Error` by most call sites; warning variants are additionally
/// logged and accumulated by callers that care (retention, registry scans).
#[derive(Error, Debug)]
pub enum BiuError {
    #[error("corrupt log in snapshot {snapshot:?} at line {line}: {reason}")]
    CorruptLog {
        snapshot: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("snapshot {snapshot:?} has no backup.log")]
    MissingLog { snapshot: PathBuf },

    #[error("command {argv:?} exited with status {exit}: {stderr}")]
    ExecFailed { argv: Vec<String>, exit: i32, stderr: String },

    #[error("failed to link {link:?} to {target:?}: {cause}")]
    LinkFailed {
        target: PathBuf,
        link: PathBuf,
        cause: String,
    },

    #[error("--force-delete={force_delete} would delete all {available} snapshot(s)")]
    RetentionRefused { force_delete: usize, available: usize },

    #[error("retention plan wants to keep {keep} snapshot(s) but the budget is {budget}; remaining plan entries were skipped")]
    BudgetExceeded { keep: usize, budget: usize },

    #[error("directory name {name:?} does not parse as a snapshot timestamp")]
    UnparseableSnapshotName { name: String },
}
