pub mod lifecycle;

pub use lifecycle::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Safety verdict for a candidate script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Read,
    Write,
    Unsafe,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Read => "read",
            Classification::Write => "write",
            Classification::Unsafe => "unsafe",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an execution ended. `ExecutionResult::success` is only true for a
/// `Completed` run whose exit code was zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Completed { exit_code: Option<i32> },
    SyntaxRejected,
    TimedOut,
    Cancelled,
    RuntimeUnavailable,
    PermissionDenied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub outcome: ExecutionOutcome,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn completed(exit_code: Option<i32>, stdout: String, stderr: String, execution_time_ms: u64) -> Self {
        Self {
            success: exit_code == Some(0),
            stdout,
            stderr,
            outcome: ExecutionOutcome::Completed { exit_code },
            execution_time_ms,
        }
    }

    /// Failed run whose stderr is the display text of `error`.
    pub fn failure(outcome: ExecutionOutcome, error: &GateError, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: error.to_string(),
            outcome,
            execution_time_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("Cannot access that location.")]
    ContainmentViolation,

    #[error("Cannot perform that operation.")]
    DangerousConstruct,

    #[error("Script would modify the filesystem during a read-only step.")]
    MutationInReadPhase,

    #[error("PowerShell syntax error: {0}")]
    SyntaxInvalid(String),

    #[error("Script execution timed out after {0} seconds. The operation may be too complex or the system may be slow.")]
    ExecutionTimeout(u64),

    #[error("Script execution was cancelled.")]
    Cancelled,

    #[error("PowerShell ({0}) is not available on this system. Please ensure PowerShell is installed and in PATH.")]
    RuntimeUnavailable(String),

    #[error("Permission denied: {0}. Check that you have permission to access the requested resources.")]
    PermissionDenied(String),

    #[error("Results too large ({size_kb}KB). Try a more specific request.")]
    OutputTooLarge { size_kb: usize },

    #[error("Cancelled.")]
    NotApproved,

    #[error("Script execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Script generation failed: {0}")]
    Generation(String),

    #[error("Audit log error: {0}")]
    Audit(String),
}

pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_serialization() {
        let json = serde_json::to_string(&Classification::Unsafe).unwrap();
        assert_eq!(json, "\"unsafe\"");

        let parsed: Classification = serde_json::from_str("\"write\"").unwrap();
        assert_eq!(parsed, Classification::Write);
        assert_eq!(Classification::Read.to_string(), "read");
    }

    #[test]
    fn test_completed_result_success_tracks_exit_code() {
        let ok = ExecutionResult::completed(Some(0), "out".to_string(), String::new(), 3);
        assert!(ok.success);

        let failed = ExecutionResult::completed(Some(1), String::new(), "boom".to_string(), 3);
        assert!(!failed.success);

        // Killed by a signal: no exit code
        let killed = ExecutionResult::completed(None, String::new(), String::new(), 3);
        assert!(!killed.success);
    }

    #[test]
    fn test_failure_uses_error_message() {
        let result = ExecutionResult::failure(
            ExecutionOutcome::TimedOut,
            &GateError::ExecutionTimeout(60),
            60_000,
        );
        assert!(!result.success);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.contains("timed out after 60 seconds"));
        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
    }

    #[test]
    fn test_classification_errors_do_not_leak_detail() {
        assert_eq!(GateError::ContainmentViolation.to_string(), "Cannot access that location.");
        assert_eq!(GateError::DangerousConstruct.to_string(), "Cannot perform that operation.");
    }
}
