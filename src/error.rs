//! Error Module
//!
//! Classification of API failures shared by every component.

use serde::Serialize;

/// Classified outcome of a failed API call.
///
/// The variant decides retry and teardown policy, so callers never
/// inspect status codes themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ApiError {
    /// Credential missing or rejected by the server
    #[error("Not authenticated")]
    Unauthenticated,

    /// Request was wrong; retrying will not help
    #[error("Invalid request: {message}")]
    Invalid {
        status: Option<u16>,
        message: String,
    },

    /// Transient network or server fault
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Superseded by sign-out or a newer selection
    #[error("Request cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn invalid<S: Into<String>>(status: Option<u16>, message: S) -> Self {
        Self::Invalid {
            status,
            message: message.into(),
        }
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable(message.into())
    }

    /// Map a non-2xx HTTP status to its class
    pub fn from_status(status: u16, message: Option<String>) -> Self {
        match status {
            401 => Self::Unauthenticated,
            400..=499 => Self::Invalid {
                status: Some(status),
                message: message.unwrap_or_else(|| format!("Status: {}", status)),
            },
            _ => Self::Unavailable(message.unwrap_or_else(|| format!("Status: {}", status))),
        }
    }

    /// Only transient faults are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::Unauthenticated)
    }
}
