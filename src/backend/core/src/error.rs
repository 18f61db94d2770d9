//! Error handling for the governance pipeline.
//!
//! This module provides:
//! - A single structured error type with codes, context and chaining
//! - Stable machine-readable codes with severity and retryability
//! - User-facing messages kept apart from internal detail
//! - Severity-driven logging with tracing and an error counter
//!
//! # Usage
//!
//! ```rust,ignore
//! use vmgov_core::error::{GovernanceError, Result, ErrorContext};
//!
//! fn load() -> Result<()> {
//!     read_file()
//!         .context("Failed to load request payload")?;
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for governance operations.
pub type Result<T> = std::result::Result<T, GovernanceError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be matched on by callers and tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Governance Errors (1000-1099)
    PolicyInputInvalid,
    InvalidTicketState,
    InvalidStateTransition,
    ValidationError,

    // Execution Errors (1100-1199)
    ProviderTransient,
    ProviderPermanent,
    LeaseExpired,
    PoolExhausted,
    ShuttingDown,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    TransactionConflict,
    RecordNotFound,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::PolicyInputInvalid => 1000,
            Self::InvalidTicketState => 1001,
            Self::InvalidStateTransition => 1002,
            Self::ValidationError => 1003,

            Self::ProviderTransient => 1100,
            Self::ProviderPermanent => 1101,
            Self::LeaseExpired => 1102,
            Self::PoolExhausted => 1103,
            Self::ShuttingDown => 1104,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::TransactionConflict => 2003,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable by the component that raised it.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransactionConflict
                | Self::DatabaseConnectionFailed
                | Self::ProviderTransient
                | Self::PoolExhausted
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "governance",
            1100..=1199 => "execution",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, wrong ticket state)
    Low,
    /// Operational issues (contention, provider hiccups, stale leases)
    Medium,
    /// System errors (database failures, bad configuration)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::PolicyInputInvalid
            | ErrorCode::InvalidTicketState
            | ErrorCode::InvalidStateTransition
            | ErrorCode::ValidationError
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord => Self::Low,

            ErrorCode::TransactionConflict
            | ErrorCode::ProviderTransient
            | ErrorCode::ProviderPermanent
            | ErrorCode::LeaseExpired
            | ErrorCode::PoolExhausted
            | ErrorCode::ShuttingDown => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (event, ticket, job)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the governance pipeline.
#[derive(Error, Debug)]
pub struct GovernanceError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to show to the requester or operator
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for GovernanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl GovernanceError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Malformed input to the auto-approval policy or a submission.
    pub fn policy_input_invalid(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::PolicyInputInvalid,
            format!("Invalid policy input: {}", message.into()),
        )
    }

    /// A ticket was not in the state an operation requires.
    pub fn invalid_ticket_state(
        ticket_id: impl fmt::Display,
        current: impl fmt::Display,
        expected: impl fmt::Display,
    ) -> Self {
        Self::new(
            ErrorCode::InvalidTicketState,
            format!(
                "Ticket {} is {}, expected {}",
                ticket_id, current, expected
            ),
        )
        .with_details(ErrorDetails::new().with_entity("ticket", ticket_id.to_string()))
        .with_context("current_state", current.to_string())
    }

    /// A state machine refused a transition.
    pub fn invalid_state_transition(
        entity: &'static str,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid {} state transition: {} -> {}", entity, from, to),
        )
        .with_context("from_state", from.to_string())
        .with_context("to_state", to.to_string())
    }

    /// Optimistic or row-lock contention; the transaction may be retried.
    pub fn transaction_conflict(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::TransactionConflict,
            "The transaction conflicted with a concurrent writer",
            message,
        )
    }

    /// A worker reported on a job it no longer holds.
    pub fn lease_expired(job_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::LeaseExpired,
            format!("Lease on job {} expired or was reclaimed", job_id),
        )
        .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    /// Transient provider failure.
    pub fn provider_transient(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ProviderTransient,
            format!("Provider call failed transiently: {}", message.into()),
        )
    }

    /// Permanent provider failure.
    pub fn provider_permanent(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ProviderPermanent,
            format!("Provider rejected the request: {}", message.into()),
        )
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Check for a transaction conflict.
    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::TransactionConflict
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Emit this error at the level its severity calls for.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let entity = self.details.entity_id.as_deref().unwrap_or("-");

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => error!(
                error_code = %code,
                category = category,
                entity = entity,
                severity = ?self.severity(),
                internal = ?self.internal_message,
                source = ?self.source,
                "{}",
                self.user_message
            ),
            ErrorSeverity::Medium => warn!(
                error_code = %code,
                category = category,
                entity = entity,
                internal = ?self.internal_message,
                "{}",
                self.user_message
            ),
            ErrorSeverity::Low => debug!(
                error_code = %code,
                category = category,
                entity = entity,
                "{}",
                self.user_message
            ),
        }
    }

    fn record_metrics(&self) {
        counter!(
            "vmgov_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Attach pipeline context to foreign errors and missing values.
pub trait ErrorContext<T> {
    /// Wrap the failure as an internal error carrying `message`.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the failure under a specific code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|source| {
            let detail = source.to_string();
            GovernanceError::internal(format!("{}: {}", message.into(), detail)).with_source(source)
        })
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|source| GovernanceError::new(code, source.to_string()).with_source(source))
    }
}

/// `None` reads as a missing record.
impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| GovernanceError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| GovernanceError::new(code, format!("{} (no value)", code)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLSTATE codes that mean "try the transaction again".
const CONFLICT_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
];

impl From<sqlx::Error> for GovernanceError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                let sqlstate = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
                if CONFLICT_SQLSTATES.contains(&sqlstate.as_str()) {
                    return Self::transaction_conflict(error.to_string()).with_source(error);
                }
                if sqlstate == "23505" {
                    return Self::with_internal(
                        ErrorCode::DuplicateRecord,
                        "A record with this identifier already exists",
                        format!("Constraint violation: {:?}", db_err.constraint()),
                    )
                    .with_source(error);
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for GovernanceError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::DatabaseError,
            "Database migration failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for GovernanceError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for GovernanceError {
    fn from(error: reqwest::Error) -> Self {
        let transient = error.is_timeout()
            || error.is_connect()
            || error
                .status()
                .map(|s| s.is_server_error() || s.as_u16() == 429 || s.as_u16() == 408)
                .unwrap_or(!error.is_status());

        let code = if transient {
            ErrorCode::ProviderTransient
        } else {
            ErrorCode::ProviderPermanent
        };

        Self::with_internal(code, "Cluster API request failed", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for GovernanceError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::ProviderTransient,
            "Operation timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for GovernanceError {
    fn from(error: std::io::Error) -> Self {
        // Only timeouts are worth another attempt.
        let code = if error.kind() == std::io::ErrorKind::TimedOut {
            ErrorCode::ProviderTransient
        } else {
            ErrorCode::InternalError
        };
        Self::with_internal(code, "I/O failure", error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for GovernanceError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<GovernanceError>() {
            Ok(governance_error) => governance_error,
            Err(error) => Self::internal(error.to_string()),
        }
    }
}

impl From<config::ConfigError> for GovernanceError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::TransactionConflict.is_retryable());
        assert!(ErrorCode::ProviderTransient.is_retryable());
        assert!(!ErrorCode::ProviderPermanent.is_retryable());
        assert!(!ErrorCode::InvalidTicketState.is_retryable());
        assert!(!ErrorCode::PolicyInputInvalid.is_retryable());
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::InvalidTicketState.category(), "governance");
        assert_eq!(ErrorCode::LeaseExpired.category(), "execution");
        assert_eq!(ErrorCode::TransactionConflict.category(), "database");
        assert_eq!(ErrorCode::InvalidConfiguration.category(), "configuration");
    }

    #[test]
    fn test_invalid_ticket_state() {
        let error = GovernanceError::invalid_ticket_state("t-1", "approved", "pending_approval");
        assert_eq!(error.code(), ErrorCode::InvalidTicketState);
        assert!(error.user_message().contains("approved"));
        assert_eq!(error.details().entity_type.as_deref(), Some("ticket"));
        assert!(error.details().context.contains_key("current_state"));
    }

    #[test]
    fn test_error_details_builder() {
        let details = ErrorDetails::new()
            .with_entity("job", "abc-123")
            .with_retry_after(30)
            .with_context("attempt", 2);

        assert_eq!(details.entity_type, Some("job".to_string()));
        assert_eq!(details.entity_id, Some("abc-123".to_string()));
        assert_eq!(details.retry_after_secs, Some(30));
        assert!(details.context.contains_key("attempt"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::PolicyInputInvalid),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::TransactionConflict),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DatabaseError),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DatabaseConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.context("ticket missing").unwrap_err();
        assert_eq!(error.code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_error_display() {
        let error = GovernanceError::with_internal(
            ErrorCode::DatabaseError,
            "Database unavailable",
            "Connection refused: localhost:5432",
        );

        let display = format!("{}", error);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("Database unavailable"));
        assert!(display.contains("Connection refused"));
    }

    #[test]
    fn test_serde_json_error_maps_to_deserialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error = GovernanceError::from(err);
        assert_eq!(error.code(), ErrorCode::DeserializationError);
    }
}
