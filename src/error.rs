//! Unified error types for the interception toolkit
//!
//! Every layer (shim, middlewares, audit, rewriter) reports through
//! one error enum so callers can classify failures without knowing
//! which layer produced them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all toolkit operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum GateError {
    /// The verdict cache classified this statement as banned; the
    /// statement was refused before reaching the driver.
    #[error("sql is banned: {query}")]
    Banned { query: String },

    /// The verdict cache classified this statement as alarmed. Never
    /// returned from a call path; only attached to log events.
    #[error("sql is alarmed")]
    Alarm,

    /// Invalid or incomplete configuration at provision time
    #[error("config error: {message}")]
    Config { message: String },

    /// The wrapped driver cannot satisfy a required capability
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// A statement could not be rewritten; carries the original text
    #[error("rewrite failed for {query:?}: {message}")]
    Rewrite { query: String, message: String },

    /// Failure decoding a result row into a typed value
    #[error("decode error: {message}")]
    Decode { message: String },

    /// Operation exceeded its deadline
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Fault propagated unchanged from the vendor driver
    #[error("driver error: {message}")]
    Driver { message: String },

    /// The driver layer declines this call; the caller should fall
    /// back to the next strategy. Never logged as an error.
    #[error("driver skipped the call")]
    Skip,
}

impl GateError {
    pub fn banned(query: impl Into<String>) -> Self {
        Self::Banned { query: query.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { message: msg.into() }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported { message: msg.into() }
    }

    pub fn rewrite(query: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Rewrite { query: query.into(), message: msg.into() }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode { message: msg.into() }
    }

    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver { message: msg.into() }
    }

    /// Coarse classification used by callers that need to distinguish
    /// refusals from infrastructure faults.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Banned { .. } => ErrorKind::InvalidArgument,
            Self::Config { .. } => ErrorKind::InvalidArgument,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Rewrite { .. } => ErrorKind::InvalidArgument,
            Self::Decode { .. } => ErrorKind::Internal,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Alarm | Self::Driver { .. } => ErrorKind::Unavailable,
            Self::Skip => ErrorKind::Skip,
        }
    }

    /// Returns true for the banned refusal, regardless of the query
    /// text it carries.
    pub fn is_banned(&self) -> bool {
        matches!(self, Self::Banned { .. })
    }
}

/// Error classification, orthogonal to the concrete variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    Unsupported,
    Timeout,
    Unavailable,
    Internal,
    Skip,
}

/// Result type alias for toolkit operations
pub type GateResult<T> = Result<T, GateError>;
