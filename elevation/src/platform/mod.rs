//! Remote platform boundary
//!
//! Everything the elevation path asks of the cloud goes through
//! [`RemotePlatform`]. Two implementations ship with the crate:
//! - [`AzureMlPlatform`]: blocking REST client against the Azure ML control plane
//! - [`InMemoryPlatform`]: recording implementation for dry runs and tests

mod azure;
mod memory;

pub use azure::{AzureMlPlatform, DEFAULT_ARM_ENDPOINT};
pub use memory::{InMemoryPlatform, PlatformCall};

use thiserror::Error;

use crate::environment::EnvironmentSpec;
use crate::packager::SourcePackage;
use crate::submitter::{JobHandle, JobSpec};
use crate::workspace::WorkspaceHandle;

/// Failures reported by a platform implementation
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform unreachable: {0}")]
    Unreachable(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A name that cannot be used as a resource path segment
    #[error("invalid resource name: {0}")]
    InvalidName(String),
}

impl PlatformError {
    /// Rejection body parsed as JSON, if it is JSON.
    pub fn diagnostics(&self) -> Option<serde_json::Value> {
        match self {
            Self::Rejected { body, .. } => serde_json::from_str(body).ok(),
            _ => None,
        }
    }
}

/// Operations the elevation path needs from the remote platform.
///
/// No implementation retries internally; callers surface every failure.
#[cfg_attr(test, mockall::automock)]
pub trait RemotePlatform {
    /// Check the workspace exists and the caller can reach it.
    fn validate_workspace(&self, workspace: &WorkspaceHandle) -> Result<(), PlatformError>;

    /// Whether a compute target with this name is registered in the workspace.
    fn compute_target_exists(
        &self,
        workspace: &WorkspaceHandle,
        compute_target: &str,
    ) -> Result<bool, PlatformError>;

    /// Look up a registered environment by name and content hash.
    fn find_environment_by_hash(
        &self,
        workspace: &WorkspaceHandle,
        name: &str,
        content_hash: &str,
    ) -> Result<Option<EnvironmentSpec>, PlatformError>;

    /// Fetch a registered environment by exact name and version.
    fn get_environment(
        &self,
        workspace: &WorkspaceHandle,
        name: &str,
        version: &str,
    ) -> Result<Option<EnvironmentSpec>, PlatformError>;

    /// Register an environment version. Slow; may trigger an image build.
    fn register_environment(
        &self,
        workspace: &WorkspaceHandle,
        spec: &EnvironmentSpec,
    ) -> Result<(), PlatformError>;

    /// Delete exactly one environment version.
    fn delete_environment(
        &self,
        workspace: &WorkspaceHandle,
        name: &str,
        version: &str,
    ) -> Result<(), PlatformError>;

    /// Upload a source package and return the platform id of the code asset.
    fn upload_source(
        &self,
        workspace: &WorkspaceHandle,
        package: &SourcePackage,
    ) -> Result<String, PlatformError>;

    /// Create a job. Not idempotent.
    fn create_job(&self, spec: &JobSpec) -> Result<JobHandle, PlatformError>;

    /// Current platform status string of a job.
    fn job_status(
        &self,
        workspace: &WorkspaceHandle,
        job_name: &str,
    ) -> Result<String, PlatformError>;
}
