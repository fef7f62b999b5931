//! SQL execution contract.
//!
//! The Oracle driver and its connection pool live behind an external gateway;
//! Core A consumes only this `execute(sql, opts)` contract. Error strings are
//! preserved verbatim because the repair loop keys on ORA-/DPY-/DPI- codes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Call timeout floor; anything lower gets raised to this.
pub const MIN_CALL_TIMEOUT_MS: u64 = 180_000;

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout_ms: u64,
    pub tag: String,
    /// Accuracy mode disables row capping for exact aggregates.
    pub accuracy_mode: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self { timeout_ms: MIN_CALL_TIMEOUT_MS, tag: String::new(), accuracy_mode: false }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_cap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub query_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecErrorClass {
    DbError,
    ClientTimeout,
    ExecError,
}

impl ExecErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecErrorClass::DbError => "DB_ERROR",
            ExecErrorClass::ClientTimeout => "CLIENT_TIMEOUT",
            ExecErrorClass::ExecError => "EXEC_ERROR",
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ExecError {
    pub class: ExecErrorClass,
    pub message: String,
    pub elapsed_ms: u64,
}

impl ExecError {
    pub fn new(message: impl Into<String>, elapsed_ms: u64) -> Self {
        let message = message.into();
        Self { class: classify_error(&message), message, elapsed_ms }
    }
}

const CLIENT_TIMEOUT_MARKERS: &[&str] = &["DPY-4024", "DPI-1067", "ORA-03156"];
const CONNECTION_RESET_MARKERS: &[&str] = &["DPY-4011", "DPI-1080", "CONNECTION CLOSED", "CONNECTION RESET"];

/// Classify an executor error string for reporting and repair routing.
pub fn classify_error(message: &str) -> ExecErrorClass {
    let upper = message.to_uppercase();
    if CLIENT_TIMEOUT_MARKERS.iter().any(|m| upper.contains(m)) {
        return ExecErrorClass::ClientTimeout;
    }
    if upper.contains("ORA-") || upper.contains("DPI-") || upper.contains("DPY-") {
        return ExecErrorClass::DbError;
    }
    ExecErrorClass::ExecError
}

/// Connection-level failures worth one pool reset + retry.
pub fn is_connection_reset(message: &str) -> bool {
    let upper = message.to_uppercase();
    CONNECTION_RESET_MARKERS.iter().any(|m| upper.contains(m))
}

/// Floor the requested timeout and flag timeouts close to the outer request
/// budget; those get logged as `timeout_near_limit`.
pub fn effective_timeout_ms(requested_ms: u64, request_budget_ms: u64) -> (u64, bool) {
    let timeout = requested_ms.max(MIN_CALL_TIMEOUT_MS);
    let near_limit = request_budget_ms > 0 && (timeout as f64) > (request_budget_ms as f64) * 0.9;
    (timeout, near_limit)
}

/// `Execute(sql, {timeoutMs, tag, accuracyMode})`.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str, opts: &ExecOptions) -> Result<ExecResult, ExecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_codes_classify_as_client_timeout() {
        assert_eq!(classify_error("DPY-4024: call timeout"), ExecErrorClass::ClientTimeout);
        assert_eq!(classify_error("ORA-03156: timeout"), ExecErrorClass::ClientTimeout);
        assert_eq!(classify_error("ORA-00942: table does not exist"), ExecErrorClass::DbError);
        assert_eq!(classify_error("socket hangup"), ExecErrorClass::ExecError);
    }

    #[test]
    fn timeout_floors_and_flags_near_limit() {
        let (timeout, near) = effective_timeout_ms(30_000, 200_000);
        assert_eq!(timeout, MIN_CALL_TIMEOUT_MS);
        assert!(!near);

        let (timeout, near) = effective_timeout_ms(195_000, 200_000);
        assert_eq!(timeout, 195_000);
        assert!(near);
    }

    #[test]
    fn connection_reset_markers_detected() {
        assert!(is_connection_reset("DPY-4011: the database or network closed the connection"));
        assert!(is_connection_reset("connection closed by peer"));
        assert!(!is_connection_reset("ORA-00904: invalid identifier"));
    }
}
