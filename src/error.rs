//! Engine error taxonomy
//!
//! Nothing here is fatal to the process. Each tick isolates failures so a
//! single pattern or agent cannot block the rest of its batch:
//! - `DataUnavailable` / `InsufficientData`: unit aborted, nothing mutated
//! - `OracleUnavailable`: deterministic fallback used
//! - `InvariantViolation`: offending sub-step skipped, pass continues
//! - `StoreConflict`: retried with backoff, then surfaced as a degraded tick

use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Segment or indicator fetch failed
    #[error("data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    /// Segment too short to evaluate a pattern
    #[error("insufficient data for pattern {pattern_id}: {bars} bars")]
    InsufficientData { pattern_id: String, bars: usize },

    /// Reasoning oracle failed or is absent
    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("invariant violation on {entity}: {reason}")]
    InvariantViolation { entity: String, reason: String },

    /// Concurrent update lost the race too many times
    #[error("store conflict after {attempts} attempts")]
    StoreConflict { attempts: u32 },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl EngineError {
    pub fn invariant(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvariantViolation {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn data_unavailable(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::DataUnavailable {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    /// True for SQLite busy/locked failures, which are worth a backoff retry
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Data problems abort a unit of work without mutating anything
    pub fn is_data_problem(&self) -> bool {
        matches!(
            self,
            EngineError::DataUnavailable { .. } | EngineError::InsufficientData { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_retryable() {
        let err = EngineError::Store(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_data_errors_not_retryable() {
        let err = EngineError::data_unavailable("BTCUSD", "feed down");
        assert!(!err.is_retryable());
        assert!(err.is_data_problem());
        assert!(err.to_string().contains("BTCUSD"));
    }

    #[test]
    fn test_invariant_message() {
        let err = EngineError::invariant("sharing:7", "already validated");
        assert_eq!(err.to_string(), "invariant violation on sharing:7: already validated");
        assert!(!err.is_data_problem());
    }
}
