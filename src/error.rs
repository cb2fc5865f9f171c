/// Typed error surface for the ContextFS engine.
///
/// Command handlers return `Result<T, ContextFsError>` instead of throwing;
/// the CLI and RPC layers convert this into `anyhow::Result` at the edge,
/// matching the teacher's anyhow-at-the-edges style (`tools/*.rs` use
/// `anyhow::Context` the same way).
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextFsError {
    #[error("contextfs lock timeout: {0}")]
    Lock(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("id conflict: {0} (try `ctx gc` or re-run migration)")]
    Conflict(String),

    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid argument: {0}")]
    Usage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ContextFsError {
    /// Stable, single-line message suitable for a trace's `error` field.
    pub fn trace_line(&self) -> String {
        let s = self.to_string();
        s.lines().next().unwrap_or(&s).to_string()
    }

    pub fn exit_code(&self) -> i32 {
        1
    }
}

pub type Result<T> = std::result::Result<T, ContextFsError>;

impl From<serde_json::Error> for ContextFsError {
    fn from(e: serde_json::Error) -> Self {
        ContextFsError::Parse(e.to_string())
    }
}

impl From<rusqlite::Error> for ContextFsError {
    fn from(e: rusqlite::Error) -> Self {
        ContextFsError::Internal(format!("sqlite: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_line_is_single_line() {
        let e = ContextFsError::Conflict("H-abc123 matches 2 turns".to_string());
        let line = e.trace_line();
        assert!(!line.contains('\n'));
        assert!(line.contains("H-abc123"));
    }

    #[test]
    fn exit_codes_are_nonzero() {
        assert_eq!(ContextFsError::NotFound("x".into()).exit_code(), 1);
    }
}
