//! Execution context detection
//!
//! Decides, once per process, whether we are running on the developer's
//! machine or already inside a job on the remote platform.
//!
//! Two markers count as "remote":
//! - `AZUREML_RUN_ID`, injected by the platform into every job process
//! - `ELEVATION_SUBMITTED_RUN`, injected by [`crate::submitter`] into every job
//!   this crate submits, so a submitted job can never resubmit itself even if
//!   the platform marker is missing
//!
//! Anything else (markers absent, empty, malformed, or an offline run id)
//! resolves to [`ExecutionContext::Local`].

use serde::{Deserialize, Serialize};

/// Environment variable the platform sets inside every job
pub const PLATFORM_RUN_ID_VAR: &str = "AZUREML_RUN_ID";

/// Environment variable the platform sets to the experiment name
pub const PLATFORM_EXPERIMENT_VAR: &str = "AZUREML_EXPERIMENT_NAME";

/// Environment variable injected into every job submitted by this crate
pub const ELEVATION_MARKER_VAR: &str = "ELEVATION_SUBMITTED_RUN";

/// Run ids of this shape are produced by the platform SDK outside of a job
const OFFLINE_RUN_PREFIX: &str = "OfflineRun";

/// Markers found in the process environment of a remote job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMarkers {
    /// Run id (platform id when present, otherwise the elevation marker)
    pub run_id: String,
    /// Experiment name, when the platform supplies one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment: Option<String>,
}

/// Where the current process is executing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "context")]
pub enum ExecutionContext {
    /// Developer machine; the guard will package and submit
    Local,
    /// Inside a platform job; the guard returns immediately
    Remote(RunMarkers),
}

impl ExecutionContext {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl std::fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote(markers) => write!(f, "remote (run {})", markers.run_id),
        }
    }
}

/// Detect the execution context from the real process environment.
///
/// Call this once at process start and pass the result down.
pub fn detect_context() -> ExecutionContext {
    detect_context_from(|key| std::env::var(key).ok())
}

/// Detect the execution context from an arbitrary variable lookup.
pub fn detect_context_from<F>(lookup: F) -> ExecutionContext
where
    F: Fn(&str) -> Option<String>,
{
    let platform_id = lookup(PLATFORM_RUN_ID_VAR).and_then(well_formed);
    let marker_id = lookup(ELEVATION_MARKER_VAR).and_then(well_formed);

    match platform_id.or(marker_id) {
        Some(run_id) => ExecutionContext::Remote(RunMarkers {
            run_id,
            experiment: lookup(PLATFORM_EXPERIMENT_VAR)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }),
        // Fail open: without a trustworthy marker we assume local and submit.
        None => ExecutionContext::Local,
    }
}

fn well_formed(raw: String) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || value.starts_with(OFFLINE_RUN_PREFIX) {
        return None;
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    valid.then(|| value.to_string())
}
