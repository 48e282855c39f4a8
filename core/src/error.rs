use std::io;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, LoafErr>;

#[derive(Error, Debug)]
pub enum LoafErr {
    /// A required argument is missing or malformed.
    #[error("{0}")]
    InvalidInput(String),

    /// Unknown tool name or background session id.
    #[error("{0}")]
    NotFound(String),

    /// The operation does not apply to this target (e.g. resizing a pipe
    /// session, an unrecognised special key).
    #[error("{0}")]
    Unsupported(String),

    /// The foreground command exceeded its budget.
    #[error("timeout waiting for child process to exit")]
    Timeout,

    /// The caller's cancellation signal fired.
    #[error("aborted by cancellation signal")]
    Aborted,

    /// Returned when the child could not be spawned (its stdout/stderr pipes
    /// could not be captured).
    #[error("spawn failed: child stdout/stderr not captured")]
    Spawn,

    /// No runnable shell could be resolved on this machine.
    #[error("no runnable shell found")]
    EnvUnavailable,

    #[error(transparent)]
    Patch(#[from] loaf_apply_patch::ApplyPatchError),

    #[error(transparent)]
    Compact(#[from] loaf_compact::CompactError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl LoafErr {
    /// Short machine-readable status tag used in structured tool failures.
    pub fn status(&self) -> &'static str {
        match self {
            LoafErr::InvalidInput(_) => "invalid_input",
            LoafErr::NotFound(_) => "not_found",
            LoafErr::Unsupported(_) => "unsupported",
            LoafErr::Timeout => "timeout",
            LoafErr::Aborted => "aborted",
            LoafErr::Spawn => "spawn_failed",
            LoafErr::EnvUnavailable => "env_unavailable",
            LoafErr::Patch(loaf_apply_patch::ApplyPatchError::ParseError(_)) => "patch_parse_error",
            LoafErr::Patch(loaf_apply_patch::ApplyPatchError::MatchError(_)) => "patch_match_error",
            LoafErr::Patch(_) => "patch_io_error",
            LoafErr::Compact(_) => "compact_error",
            LoafErr::Io(_) => "io_error",
            LoafErr::Json(_) => "invalid_input",
            LoafErr::TokioJoin(_) => "internal",
        }
    }
}
