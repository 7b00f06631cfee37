//! Elevation error types
//!
//! One variant per failure class of the LOCAL branch. Every variant is
//! surfaced to the caller; nothing in the elevation path catches and drops
//! an error, and nothing is retried locally.

use std::path::PathBuf;
use thiserror::Error;

use crate::platform::PlatformError;

/// Result type alias for elevation operations
pub type ElevationResult<T> = Result<T, ElevationError>;

/// Errors that can occur while elevating a run
#[derive(Error, Debug)]
pub enum ElevationError {
    /// Workspace descriptor missing/invalid, workspace unreachable, or no credentials
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Environment lookup or registration failed against the platform
    #[error("Environment resolution failed: {message}")]
    EnvironmentResolution { message: String },

    /// Source tree unreadable, bad ignore policy, or corrupt artifact
    #[error("Packaging failed for {path}: {message}")]
    Packaging { path: PathBuf, message: String },

    /// The platform rejected or could not accept the job
    #[error("Job submission failed: {message}")]
    Submission {
        message: String,
        /// Diagnostic payload returned by the platform, if any
        diagnostics: Option<serde_json::Value>,
    },

    /// Invalid input parameters (e.g. partial environment deletion)
    #[error("Validation error: {message}")]
    Validation { message: String },
}

impl ElevationError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an environment resolution error
    pub fn environment(message: impl Into<String>) -> Self {
        Self::EnvironmentResolution {
            message: message.into(),
        }
    }

    /// Create a packaging error
    pub fn packaging(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Packaging {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a submission error without a diagnostic payload
    pub fn submission(message: impl Into<String>) -> Self {
        Self::Submission {
            message: message.into(),
            diagnostics: None,
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Map a platform failure during job creation, keeping the platform's body
    /// as structured diagnostics when it parses as JSON.
    pub fn from_submission(context: &str, err: PlatformError) -> Self {
        let diagnostics = err.diagnostics();
        Self::Submission {
            message: format!("{context}: {err}"),
            diagnostics,
        }
    }

    /// Short machine-readable code, used in CLI output
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "CONFIGURATION",
            Self::EnvironmentResolution { .. } => "ENVIRONMENT_RESOLUTION",
            Self::Packaging { .. } => "PACKAGING",
            Self::Submission { .. } => "SUBMISSION",
            Self::Validation { .. } => "VALIDATION",
        }
    }
}
