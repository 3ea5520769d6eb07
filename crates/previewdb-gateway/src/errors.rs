//! Client-visible error classification
//!
//! Every error that reaches a client is turned into a [`ClassifiedError`]:
//! - Backend errors keep the SQLSTATE the database reported
//! - Errors without one are mapped to a PostgreSQL SQLSTATE by message
//! - Proxy-side refusals (unsupported federation, timeouts) get fixed codes

use crate::backend::BackendError;
use crate::federation::RewriteError;
use std::borrow::Cow;
use std::fmt;

/// PostgreSQL SQLSTATE error codes
/// See: https://www.postgresql.org/docs/current/errcodes-appendix.html
pub mod sqlstate {
    // Class 08 — Connection Exception
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const PROTOCOL_VIOLATION: &str = "08P01";

    // Class 0A — Feature Not Supported
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";

    // Class 22 — Data Exception
    pub const DATA_EXCEPTION: &str = "22000";
    pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";

    // Class 25 — Invalid Transaction State
    pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";

    // Class 26 — Invalid SQL Statement Name
    pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";

    // Class 28 — Invalid Authorization Specification
    pub const INVALID_AUTHORIZATION: &str = "28000";

    // Class 42 — Syntax Error or Access Rule Violation
    pub const SYNTAX_ERROR: &str = "42601";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const UNDEFINED_COLUMN: &str = "42703";
    pub const UNDEFINED_FUNCTION: &str = "42883";

    // Class 34 — Invalid Cursor Name
    pub const INVALID_CURSOR_NAME: &str = "34000";

    // Class 53 — Insufficient Resources
    pub const TOO_MANY_CONNECTIONS: &str = "53300";

    // Class 57 — Operator Intervention
    pub const QUERY_CANCELED: &str = "57014";

    // Class XX — Internal Error
    pub const INTERNAL_ERROR: &str = "XX000";
}

/// Error category for classification and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Error raised by a backend store while executing
    Backend,
    /// SQL syntax errors
    Syntax,
    /// Object not found (table, column, function)
    NotFound,
    /// Query timeout
    Timeout,
    /// Authentication/authorization errors
    Auth,
    /// Resource limits (connections)
    Resource,
    /// Connection errors
    Connection,
    /// Feature refused by the proxy
    Unsupported,
    /// Internal/unknown errors
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Backend => write!(f, "backend"),
            ErrorCategory::Syntax => write!(f, "syntax"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Auth => write!(f, "auth"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Connection => write!(f, "connection"),
            ErrorCategory::Unsupported => write!(f, "unsupported"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// A classified error with all information needed for an ErrorResponse
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    /// PostgreSQL SQLSTATE code
    pub sqlstate: Cow<'static, str>,
    /// Error category for metrics
    pub category: ErrorCategory,
    /// Primary message
    pub message: String,
    /// Optional hint for the user
    pub hint: Option<String>,
    /// Optional detail with more context
    pub detail: Option<String>,
}

impl ClassifiedError {
    pub fn new(
        sqlstate: impl Into<Cow<'static, str>>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            sqlstate: sqlstate.into(),
            category,
            message: message.into(),
            hint: None,
            detail: None,
        }
    }

    /// Add a hint to the error
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Add detail to the error
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.sqlstate)
    }
}

/// Classify an error raised by the backend that produced the final result
pub fn classify_backend_error(err: &BackendError) -> ClassifiedError {
    match err {
        BackendError::Database {
            code: Some(code),
            message,
            detail,
            hint,
        } => ClassifiedError {
            sqlstate: Cow::Owned(code.clone()),
            category: category_for_sqlstate(code),
            message: message.clone(),
            hint: hint.clone(),
            detail: detail.clone(),
        },
        BackendError::Database { message, .. } => classify_message(message),
        BackendError::Unavailable(message) => ClassifiedError::new(
            sqlstate::CONNECTION_FAILURE,
            ErrorCategory::Connection,
            format!("backend unavailable: {}", message),
        )
        .with_hint("Retry the query. If the issue persists, check the backend store."),
        BackendError::Protocol(message) => classify_message(message),
    }
}

/// Federation refused the query under the reject policy
pub fn unsupported_federation(err: &RewriteError) -> ClassifiedError {
    ClassifiedError::new(
        sqlstate::FEATURE_NOT_SUPPORTED,
        ErrorCategory::Unsupported,
        err.to_string(),
    )
    .with_hint(
        "Federated tables support single-table SELECT with WHERE, ORDER BY and LIMIT. \
         Query the table without the clause or set federation.unsupported_clause_policy to passthrough.",
    )
}

pub fn query_timeout(secs: u64) -> ClassifiedError {
    ClassifiedError::new(
        sqlstate::QUERY_CANCELED,
        ErrorCategory::Timeout,
        format!("canceling statement due to proxy timeout after {} seconds", secs),
    )
    .with_hint("Add a more selective WHERE clause or LIMIT, or raise limits.query_timeout_secs.")
}

/// The pinned connection of an open transaction was lost; the client still
/// has to end the block
pub fn transaction_aborted() -> ClassifiedError {
    ClassifiedError::new(
        sqlstate::IN_FAILED_SQL_TRANSACTION,
        ErrorCategory::Connection,
        "current transaction is aborted, commands ignored until end of transaction block",
    )
    .with_hint("Issue ROLLBACK to start over.")
}

pub fn unknown_statement(name: &str) -> ClassifiedError {
    ClassifiedError::new(
        sqlstate::INVALID_SQL_STATEMENT_NAME,
        ErrorCategory::NotFound,
        format!("prepared statement \"{}\" does not exist", name),
    )
}

pub fn unknown_portal(name: &str) -> ClassifiedError {
    ClassifiedError::new(
        sqlstate::INVALID_CURSOR_NAME,
        ErrorCategory::NotFound,
        format!("portal \"{}\" does not exist", name),
    )
}

/// Binary results, or a binary parameter of a type without a text rendering here
pub fn binary_format_unsupported(what: &str) -> ClassifiedError {
    ClassifiedError::new(
        sqlstate::FEATURE_NOT_SUPPORTED,
        ErrorCategory::Unsupported,
        format!("binary format is not supported for {}", what),
    )
    .with_hint("Request text format (format code 0).")
}

pub fn invalid_parameter(index: usize, reason: &str) -> ClassifiedError {
    ClassifiedError::new(
        sqlstate::INVALID_TEXT_REPRESENTATION,
        ErrorCategory::Backend,
        format!("invalid value for parameter ${}: {}", index + 1, reason),
    )
}

pub fn protocol_violation(message: impl Into<String>) -> ClassifiedError {
    ClassifiedError::new(
        sqlstate::PROTOCOL_VIOLATION,
        ErrorCategory::Connection,
        message,
    )
}

pub fn too_many_connections(limit: usize) -> ClassifiedError {
    ClassifiedError::new(
        sqlstate::TOO_MANY_CONNECTIONS,
        ErrorCategory::Resource,
        format!("sorry, too many clients already (limit {})", limit),
    )
}

/// Map a SQLSTATE class to a metrics category
fn category_for_sqlstate(code: &str) -> ErrorCategory {
    match code {
        sqlstate::SYNTAX_ERROR => ErrorCategory::Syntax,
        sqlstate::UNDEFINED_TABLE | sqlstate::UNDEFINED_COLUMN | sqlstate::UNDEFINED_FUNCTION => {
            ErrorCategory::NotFound
        }
        sqlstate::QUERY_CANCELED => ErrorCategory::Timeout,
        sqlstate::FEATURE_NOT_SUPPORTED => ErrorCategory::Unsupported,
        _ => match code.get(..2) {
            Some("08") => ErrorCategory::Connection,
            Some("28") => ErrorCategory::Auth,
            Some("53") => ErrorCategory::Resource,
            _ => ErrorCategory::Backend,
        },
    }
}

/// Classify an error that carries no SQLSTATE from its text
pub fn classify_message(raw_error: &str) -> ClassifiedError {
    let error_lower = raw_error.to_lowercase();
    let message = extract_core_message(raw_error);

    if error_lower.contains("syntax error") || error_lower.contains("parse error") {
        return ClassifiedError::new(sqlstate::SYNTAX_ERROR, ErrorCategory::Syntax, message);
    }

    if error_lower.contains("does not exist") {
        if error_lower.contains("column") {
            return ClassifiedError::new(
                sqlstate::UNDEFINED_COLUMN,
                ErrorCategory::NotFound,
                message,
            );
        }
        if error_lower.contains("function") {
            return ClassifiedError::new(
                sqlstate::UNDEFINED_FUNCTION,
                ErrorCategory::NotFound,
                message,
            );
        }
        return ClassifiedError::new(sqlstate::UNDEFINED_TABLE, ErrorCategory::NotFound, message);
    }

    if error_lower.contains("timeout") || error_lower.contains("timed out") {
        return ClassifiedError::new(sqlstate::QUERY_CANCELED, ErrorCategory::Timeout, message);
    }

    if error_lower.contains("connection")
        || error_lower.contains("broken pipe")
        || error_lower.contains("reset by peer")
    {
        return ClassifiedError::new(
            sqlstate::CONNECTION_FAILURE,
            ErrorCategory::Connection,
            message,
        );
    }

    if error_lower.contains("permission denied") || error_lower.contains("authentication") {
        return ClassifiedError::new(sqlstate::INVALID_AUTHORIZATION, ErrorCategory::Auth, message);
    }

    if error_lower.contains("invalid input") || error_lower.contains("out of range") {
        return ClassifiedError::new(sqlstate::DATA_EXCEPTION, ErrorCategory::Backend, message);
    }

    ClassifiedError::new(sqlstate::INTERNAL_ERROR, ErrorCategory::Internal, message)
}

/// Strip driver prefixes and cap the length
fn extract_core_message(error: &str) -> String {
    let mut msg = error.trim();

    for prefix in ["error returned from database:", "error communicating with database:"] {
        if let Some(rest) = msg.strip_prefix(prefix) {
            msg = rest.trim();
        }
    }

    if msg.len() > 500 {
        let mut end = 497;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        return format!("{}...", &msg[..end]);
    }
    msg.to_string()
}
