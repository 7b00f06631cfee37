//! Elevation Library
//!
//! Runs a data-science script on an Azure ML compute cluster without the
//! script knowing about it. One call at the top of the script decides:
//! - inside a platform job: return run info and let the script continue
//! - on a developer machine: package the source, resolve a managed
//!   environment, submit a command job, then stop the local process
//!
//! # Components
//!
//! - [`context`]: local vs. remote detection from process environment markers
//! - [`environment`]: content-hashed reuse or registration of environments
//! - [`packager`]: prebuilt artifact or filtered directory snapshot
//! - [`submitter`]: job assembly and submission
//! - [`guard`]: the decision point tying the others together
//! - [`platform`]: the remote boundary, with REST and in-memory implementations
//!
//! # Usage
//!
//! ```no_run
//! let run = elevation::submit_to_cloud_if_needed("train.py", &[])?;
//! println!("writing to {}", run.output_dir.display());
//! # Ok::<(), elevation::ElevationError>(())
//! ```

pub mod config;
pub mod context;
pub mod credentials;
pub mod environment;
pub mod error;
pub mod guard;
pub mod packager;
pub mod platform;
pub mod submitter;
pub mod workspace;

use tracing::info;

pub use config::ElevationConfig;
pub use context::{detect_context, detect_context_from, ExecutionContext, RunMarkers};
pub use environment::{
    DependencyManifest, EnvironmentDeletion, EnvironmentRequest, EnvironmentResolver,
    EnvironmentSpec,
};
pub use error::{ElevationError, ElevationResult};
pub use guard::{ElevationGuard, ElevationOutcome, RunInfo};
pub use packager::{PackagingOptions, SourcePackage, SourcePackager};
pub use platform::{AzureMlPlatform, InMemoryPlatform, PlatformError, RemotePlatform};
pub use submitter::{JobHandle, JobRequest, JobSubmitter};
pub use workspace::WorkspaceHandle;

/// Elevate the current process if it is running locally.
///
/// Remote: returns run info without network access. Local: submits the job
/// built from the current directory and exits the process with status 0.
/// Every failure is returned to the caller.
pub fn submit_to_cloud_if_needed(entry_point: &str, args: &[String]) -> ElevationResult<RunInfo> {
    let context = detect_context();
    if let ExecutionContext::Remote(markers) = &context {
        return Ok(RunInfo::from(markers));
    }

    let project_root = std::env::current_dir().map_err(|e| {
        ElevationError::configuration(format!("cannot determine working directory: {e}"))
    })?;
    let token = credentials::resolve_access_token()?;
    let platform = AzureMlPlatform::new(token)
        .map_err(|e| ElevationError::configuration(e.to_string()))?;

    match ElevationGuard::new(context, &platform).submit_project_if_needed(
        &project_root,
        entry_point,
        args,
    )? {
        ElevationOutcome::Remote(run) => Ok(run),
        ElevationOutcome::Submitted(handle) => {
            info!(job = %handle.name, status = %handle.status, "Submitted; stopping local run");
            if let Some(url) = &handle.studio_url {
                println!("Job {} submitted: {url}", handle.name);
            } else {
                println!("Job {} submitted", handle.name);
            }
            std::process::exit(0)
        }
    }
}
