//! Application error types.
//!
//! These errors are serializable so the HTTP layer can return them as
//! structured JSON, and cloneable so a single-flight report generation can
//! hand the same failure to every waiting request.

use serde::Serialize;
use thiserror::Error;

/// Application-level errors.
///
/// All variants serialize to a structured JSON object for API consumers.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    /// The tracker could not be reached after the retry budget was spent.
    #[error("Tracker unavailable: {message}")]
    TrackerUnavailable {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempts: Option<u32>,
    },

    /// The tracker rejected our credentials. Requires re-authorizing the connection.
    #[error("Tracker authentication error: {message}")]
    TrackerAuth {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tracker_id: Option<i64>,
    },

    /// The tracker returned a permanent (non-retryable) error.
    #[error("Tracker API error: {message}")]
    TrackerApi {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// The actor is not allowed to perform the requested action.
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Malformed request (unknown sprint, inverted time range, ...).
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// Requested resource not found.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// Internal application error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a tracker-unavailable error.
    pub fn tracker_unavailable(message: impl Into<String>) -> Self {
        Self::TrackerUnavailable {
            message: message.into(),
            attempts: None,
        }
    }

    /// Create a tracker-unavailable error recording how many attempts were made.
    pub fn tracker_unavailable_after(message: impl Into<String>, attempts: u32) -> Self {
        Self::TrackerUnavailable {
            message: message.into(),
            attempts: Some(attempts),
        }
    }

    /// Create a tracker authentication error.
    pub fn tracker_auth(message: impl Into<String>) -> Self {
        Self::TrackerAuth {
            message: message.into(),
            tracker_id: None,
        }
    }

    /// Create a tracker authentication error for a specific tracker connection.
    pub fn tracker_auth_for(message: impl Into<String>, tracker_id: i64) -> Self {
        Self::TrackerAuth {
            message: message.into(),
            tracker_id: Some(tracker_id),
        }
    }

    /// Create a tracker API error with status code and endpoint.
    pub fn tracker_api(message: impl Into<String>, status_code: u16, endpoint: impl Into<String>) -> Self {
        Self::TrackerApi {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create a forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field name.
    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    /// Create a not found error with ID.
    pub fn not_found_with_id(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.to_string()),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a database error with operation context.
    pub fn database_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the caller may safely retry the same request later.
    ///
    /// Only upstream availability problems are transient; everything else
    /// needs a configuration or request fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TrackerUnavailable { .. })
    }

    /// Stable machine-readable code used by the HTTP layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TrackerUnavailable { .. } => "TRACKER_UNAVAILABLE",
            Self::TrackerAuth { .. } => "TRACKER_AUTH",
            Self::TrackerApi { .. } => "TRACKER_API",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Validation { .. } => "VALIDATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Database { .. } => "DATABASE",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

// Conversions from common error types

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::tracker_unavailable("Request timed out")
        } else if err.is_connect() {
            Self::tracker_unavailable("Failed to connect to tracker")
        } else if err.is_decode() {
            Self::internal(format!("Failed to parse tracker response: {}", err))
        } else {
            Self::tracker_unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}

impl From<crate::db::DbError> for AppError {
    fn from(err: crate::db::DbError) -> Self {
        Self::database(err.to_string())
    }
}
