use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BackendLifecycleState;

/// Broad error category used for user-facing handling and session teardown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendErrorCategory {
    /// Missing or rejected credential. Ends the session.
    Auth,
    /// The request could not complete (connect, DNS, TLS, broken body).
    Network,
    /// Input rejected locally; no request was issued.
    Validation,
    /// The backend answered with a non-success status.
    Rejected,
    /// Serialization/deserialization failure.
    Serialization,
    /// Credential store / local persistence failure.
    Storage,
    /// Internal backend bug or invariant break.
    Internal,
}

/// Stable backend error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BackendError {
    /// High-level error category.
    pub category: BackendErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status when the backend rejected the request.
    pub status: Option<u16>,
}

impl BackendError {
    /// Construct a new backend error.
    pub fn new(
        category: BackendErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Shorthand for a local validation failure.
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Validation, code, message)
    }

    /// Build an error from a non-success HTTP response.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let category = classify_http_status(status);
        let code = match (category, status) {
            (BackendErrorCategory::Auth, _) => "unauthorized",
            (_, 403) => "forbidden",
            (_, 404) => "not_found",
            _ => "request_rejected",
        };
        Self {
            category,
            code: code.to_owned(),
            message: detail.into(),
            status: Some(status),
        }
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: BackendLifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            BackendErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while backend is in state {current:?}"),
        )
    }

    pub fn is_auth(&self) -> bool {
        self.category == BackendErrorCategory::Auth
    }

    /// Text suitable for an inline error line next to the failed control.
    pub fn inline_message(&self) -> String {
        match self.category {
            BackendErrorCategory::Auth => "Session expired, please sign in again".to_owned(),
            BackendErrorCategory::Network => "Network unavailable".to_owned(),
            BackendErrorCategory::Validation => self.message.clone(),
            BackendErrorCategory::Rejected => match self.status {
                Some(status) if !self.message.is_empty() => {
                    format!("Request failed ({status}): {}", self.message)
                }
                Some(status) => format!("Request failed ({status})"),
                None => "Request failed".to_owned(),
            },
            BackendErrorCategory::Serialization => "Unexpected server response".to_owned(),
            BackendErrorCategory::Storage => "Could not access saved credentials".to_owned(),
            BackendErrorCategory::Internal => format!("Internal error ({})", self.code),
        }
    }
}

/// Map non-success HTTP status codes to backend error categories.
///
/// Only 401 means the credential is gone; 403 is a per-resource refusal.
pub fn classify_http_status(status: u16) -> BackendErrorCategory {
    match status {
        401 => BackendErrorCategory::Auth,
        400..=599 => BackendErrorCategory::Rejected,
        _ => BackendErrorCategory::Internal,
    }
}
