//! Core error taxonomy.
//!
//! Every user-visible failure carries a stable machine-readable code plus a
//! human message. Internal detail goes to the log under the trace ID, never
//! into the error surface.

use thiserror::Error;

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller violated a precondition (invalid chain, negative amount,
    /// malformed address). No retry.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-key or state-machine violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Refused because an emergency stop is active.
    #[error("emergency stop active: {0}")]
    EmergencyActive(String),

    /// Passphrase mismatch or cross-user access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Price feed or RPC unreachable or timed out.
    #[error("external service unavailable: {0}")]
    ExternalUnavailable(String),

    /// Trade execution returned a terminal failure.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// An invariant would be broken by the requested write.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code for API surfaces and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InputInvalid(_) => "input_invalid",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::EmergencyActive(_) => "emergency_active",
            CoreError::Unauthorized(_) => "unauthorized",
            CoreError::StoreUnavailable(_) => "store_unavailable",
            CoreError::ExternalUnavailable(_) => "external_unavailable",
            CoreError::ExecutionFailed(_) => "execution_failed",
            CoreError::IntegrityViolation(_) => "integrity_violation",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Process exit code when the failure aborts the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::InputInvalid(_) => 2,
            CoreError::StoreUnavailable(_) => 3,
            CoreError::IntegrityViolation(_) => 4,
            CoreError::EmergencyActive(_) => 5,
            _ => 1,
        }
    }

    /// Whether an idempotent caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::StoreUnavailable(_) | CoreError::ExternalUnavailable(_)
        )
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound("row".to_string()),
            rusqlite::Error::SqliteFailure(code, msg) => match code.code {
                rusqlite::ErrorCode::ConstraintViolation => {
                    CoreError::Conflict(msg.clone().unwrap_or_else(|| "constraint".to_string()))
                }
                _ => CoreError::StoreUnavailable(err.to_string()),
            },
            _ => CoreError::StoreUnavailable(err.to_string()),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::InputInvalid("x".into()).code(), "input_invalid");
        assert_eq!(CoreError::EmergencyActive("x".into()).code(), "emergency_active");
        assert_eq!(CoreError::Internal("x".into()).code(), "internal");
    }

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(CoreError::InputInvalid("bad".into()).exit_code(), 2);
        assert_eq!(CoreError::StoreUnavailable("io".into()).exit_code(), 3);
        assert_eq!(CoreError::IntegrityViolation("i3".into()).exit_code(), 4);
        assert_eq!(CoreError::EmergencyActive("stop".into()).exit_code(), 5);
        assert_eq!(CoreError::Conflict("dup".into()).exit_code(), 1);
    }

    #[test]
    fn no_rows_maps_to_not_found() {
        let err: CoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
