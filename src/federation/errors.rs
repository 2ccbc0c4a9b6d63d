//! Gateway error types.
//!
//! Every failure the federation core can produce maps onto one [`ErrorKind`]
//! of the shared taxonomy. At the transport boundary errors are flattened into
//! an [`ErrorObject`] (numeric code + message) via [`GatewayError::error_object`].

use serde::Serialize;
use thiserror::Error;

use super::types::error_codes;

/// The shared error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A session cannot be established or maintained.
    Connection,
    /// A backend sent a malformed message.
    Protocol,
    /// Invalid capability/endpoint definition or argument validation failure.
    Schema,
    /// Deadline exceeded.
    Timeout,
    /// Backend-reported business failure.
    Remote,
    /// Unknown qualified name.
    NotFound,
    /// Namespace collision at registration.
    Conflict,
}

/// Errors that can occur during gateway operations.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// A backend connection could not be established or was lost.
    #[error("connection error for '{target}': {reason}")]
    Connection { target: String, reason: String },

    /// The backend session is not connected.
    #[error("backend '{session}' is disconnected")]
    Disconnected { session: String },

    /// A backend reply could not be understood.
    #[error("protocol error from '{target}': {reason}")]
    Protocol { target: String, reason: String },

    /// A definition or a set of call arguments failed validation.
    #[error("schema error for '{subject}': {}", issues.join("; "))]
    Schema {
        subject: String,
        issues: Vec<String>,
    },

    /// The request deadline elapsed.
    #[error("'{target}' timed out after {elapsed_ms}ms")]
    Timeout { target: String, elapsed_ms: u64 },

    /// The backend (or wrapped API) reported a failure.
    #[error("remote error [{code}]: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No capability with this name is registered.
    #[error("unknown capability: '{name}'")]
    NotFound { name: String },

    /// A qualified name is already taken.
    #[error("name '{name}' from '{incoming_owner}' conflicts with '{existing_owner}'")]
    Conflict {
        name: String,
        existing_owner: String,
        incoming_owner: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl GatewayError {
    /// Convenience constructor for a single-issue schema error.
    pub fn schema(subject: impl Into<String>, issue: impl Into<String>) -> Self {
        Self::Schema {
            subject: subject.into(),
            issues: vec![issue.into()],
        }
    }

    /// Map this error onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::Disconnected { .. } => ErrorKind::Connection,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Schema { .. } | Self::Config { .. } => ErrorKind::Schema,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
        }
    }

    /// Whether a retry of the same call could plausibly succeed.
    ///
    /// Only timeouts and lost connections qualify. Remote and schema failures
    /// are deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Timeout)
    }

    /// Flatten into the structured `{code, message}` object handed to transports.
    pub fn error_object(&self) -> ErrorObject {
        let code = match self {
            Self::Remote { code, .. } => *code,
            Self::Connection { .. } | Self::Disconnected { .. } => error_codes::CONNECTION_ERROR,
            Self::Protocol { .. } => error_codes::PROTOCOL_ERROR,
            Self::Schema { .. } | Self::Config { .. } => error_codes::INVALID_PARAMS,
            Self::Timeout { .. } => error_codes::TIMEOUT,
            Self::NotFound { .. } => error_codes::NOT_FOUND,
            Self::Conflict { .. } => error_codes::CONFLICT,
        };

        let data = match self {
            Self::Remote { data, .. } => data.clone(),
            Self::Schema { issues, .. } => Some(serde_json::json!({ "issues": issues })),
            _ => None,
        };

        ErrorObject {
            code,
            message: self.to_string(),
            data,
        }
    }
}

/// Structured error object crossing the transport boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorObject {
    /// Build an error object for a JSON-RPC level failure.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Protocol {
            target: "json".into(),
            reason: e.to_string(),
        }
    }
}
