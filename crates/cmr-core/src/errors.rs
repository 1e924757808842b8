//! Error taxonomy shared by every cross-model relations component.
//!
//! Each variant maps to a stable machine-readable [`ErrorCode`] so batch
//! results can carry structured per-item errors across the model boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error type for cross-model relation operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CmrError {
    /// Relation, application, token or unit absent
    #[error("{message} not found")]
    NotFound {
        /// What was not found
        message: String,
    },

    /// Token export or registration repeated
    #[error("{message} already exists")]
    AlreadyExists {
        /// What already exists
        message: String,
    },

    /// Credential missing, expired, or declaring mismatched caveats
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Why access was refused
        message: String,
    },

    /// Malformed tag, settings value or argument
    #[error("{message} not valid")]
    NotValid {
        /// What was malformed
        message: String,
    },

    /// Any other backend or system failure
    #[error("internal error: {message}")]
    Internal {
        /// Error message describing the failure
        message: String,
    },
}

/// Stable, machine-readable error codes carried in per-item results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "not found")]
    NotFound,
    #[serde(rename = "already exists")]
    AlreadyExists,
    #[serde(rename = "unauthorized access")]
    PermissionDenied,
    #[serde(rename = "not valid")]
    NotValid,
}

impl ErrorCode {
    /// Wire representation of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not found",
            ErrorCode::AlreadyExists => "already exists",
            ErrorCode::PermissionDenied => "unauthorized access",
            ErrorCode::NotValid => "not valid",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CmrError {
    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an already exists error
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
        }
    }

    /// Create a permission denied error
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Create a not valid error
    pub fn not_valid(message: impl Into<String>) -> Self {
        Self::NotValid {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable code for this error, `None` for internal failures
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            CmrError::NotFound { .. } => Some(ErrorCode::NotFound),
            CmrError::AlreadyExists { .. } => Some(ErrorCode::AlreadyExists),
            CmrError::PermissionDenied { .. } => Some(ErrorCode::PermissionDenied),
            CmrError::NotValid { .. } => Some(ErrorCode::NotValid),
            CmrError::Internal { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CmrError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, CmrError::AlreadyExists { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, CmrError::PermissionDenied { .. })
    }

    pub fn is_not_valid(&self) -> bool {
        matches!(self, CmrError::NotValid { .. })
    }
}

/// Standard Result type for cross-model relation operations
pub type Result<T> = std::result::Result<T, CmrError>;

/// Structured error carried in a per-item batch result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl ErrorInfo {
    /// Convert back into a typed error, keeping the original message
    pub fn into_error(self) -> CmrError {
        match self.code {
            Some(ErrorCode::NotFound) => CmrError::NotFound {
                message: strip_suffix(self.message, " not found"),
            },
            Some(ErrorCode::AlreadyExists) => CmrError::AlreadyExists {
                message: strip_suffix(self.message, " already exists"),
            },
            Some(ErrorCode::PermissionDenied) => CmrError::PermissionDenied {
                message: strip_prefix(self.message, "permission denied: "),
            },
            Some(ErrorCode::NotValid) => CmrError::NotValid {
                message: strip_suffix(self.message, " not valid"),
            },
            None => CmrError::Internal {
                message: strip_prefix(self.message, "internal error: "),
            },
        }
    }
}

fn strip_suffix(message: String, suffix: &str) -> String {
    match message.strip_suffix(suffix) {
        Some(stripped) => stripped.to_string(),
        None => message,
    }
}

fn strip_prefix(message: String, prefix: &str) -> String {
    match message.strip_prefix(prefix) {
        Some(stripped) => stripped.to_string(),
        None => message,
    }
}

impl From<&CmrError> for ErrorInfo {
    fn from(err: &CmrError) -> Self {
        Self {
            message: err.to_string(),
            code: err.code(),
        }
    }
}

impl From<CmrError> for ErrorInfo {
    fn from(err: CmrError) -> Self {
        Self::from(&err)
    }
}

impl From<ErrorInfo> for CmrError {
    fn from(info: ErrorInfo) -> Self {
        info.into_error()
    }
}

impl From<std::io::Error> for CmrError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::permission_denied(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CmrError {
    fn from(err: serde_json::Error) -> Self {
        Self::not_valid(format!("json ({err})"))
    }
}
