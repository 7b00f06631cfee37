//! Elevation guard
//!
//! Single decision point at the top of a script. In a remote job it returns
//! run info without touching the platform. On a developer machine it
//! validates the workspace, packages the source together with the entry
//! point, resolves the environment and submits the job, in that order,
//! stopping at the first failure.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::config::ElevationConfig;
use crate::context::{ExecutionContext, RunMarkers};
use crate::environment::EnvironmentResolver;
use crate::error::{ElevationError, ElevationResult};
use crate::packager::SourcePackager;
use crate::platform::RemotePlatform;
use crate::submitter::{JobHandle, JobSubmitter};
use crate::workspace::WorkspaceHandle;

/// Platform-collected output directory inside a job
pub const OUTPUT_DIR: &str = "outputs";

/// Platform-collected log directory inside a job
pub const LOGS_DIR: &str = "logs";

/// What a remote run needs to know about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment: Option<String>,
    pub output_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl From<&RunMarkers> for RunInfo {
    fn from(markers: &RunMarkers) -> Self {
        Self {
            run_id: markers.run_id.clone(),
            experiment: markers.experiment.clone(),
            output_dir: PathBuf::from(OUTPUT_DIR),
            logs_dir: PathBuf::from(LOGS_DIR),
        }
    }
}

/// Result of [`ElevationGuard::submit_if_needed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevationOutcome {
    /// Already remote; continue with the script
    Remote(RunInfo),
    /// Job submitted; the local process should stop
    Submitted(JobHandle),
}

pub struct ElevationGuard<'a, P: RemotePlatform + ?Sized> {
    context: ExecutionContext,
    platform: &'a P,
}

impl<'a, P: RemotePlatform + ?Sized> ElevationGuard<'a, P> {
    /// `context` is detected once by the caller and never re-read.
    pub fn new(context: ExecutionContext, platform: &'a P) -> Self {
        Self { context, platform }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Run info when remote, `None` when local. Never touches the platform.
    pub fn remote_run(&self) -> Option<RunInfo> {
        match &self.context {
            ExecutionContext::Remote(markers) => Some(RunInfo::from(markers)),
            ExecutionContext::Local => None,
        }
    }

    /// Like [`Self::submit_if_needed`], loading the config only on the local branch.
    pub fn submit_project_if_needed(
        &self,
        project_root: &Path,
        entry_point: &str,
        args: &[String],
    ) -> ElevationResult<ElevationOutcome> {
        if let Some(run) = self.remote_run() {
            return Ok(ElevationOutcome::Remote(run));
        }
        let config = ElevationConfig::load(project_root)?;
        self.submit_if_needed(&config, entry_point, args)
    }

    #[instrument(skip(self, config, args), fields(context = %self.context))]
    pub fn submit_if_needed(
        &self,
        config: &ElevationConfig,
        entry_point: &str,
        args: &[String],
    ) -> ElevationResult<ElevationOutcome> {
        if let Some(run) = self.remote_run() {
            info!(run_id = %run.run_id, "Running remotely, continuing");
            return Ok(ElevationOutcome::Remote(run));
        }

        let workspace = WorkspaceHandle::load(&config.project_root)?;
        self.platform
            .validate_workspace(&workspace)
            .map_err(|e| {
                ElevationError::configuration(format!("workspace {workspace} unusable: {e}"))
            })?;
        info!(workspace = %workspace, "Workspace validated");

        let mut package =
            SourcePackager::new(config.packaging.clone()).package(&config.project_root)?;
        package.include_entry_point(&config.project_root, entry_point)?;
        info!(
            source = %package.describe(),
            bytes = package.total_bytes(),
            "Source packaged"
        );

        let environment =
            EnvironmentResolver::new(self.platform, &workspace).resolve(&config.environment)?;

        let request = config.job_request(entry_point, args);
        let handle = JobSubmitter::new(self.platform).submit(
            &request,
            &environment,
            &package,
            &config.compute_target,
            &workspace,
        )?;
        Ok(ElevationOutcome::Submitted(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockRemotePlatform;

    #[test]
    fn test_remote_run_info_defaults() {
        let markers = RunMarkers {
            run_id: "run-42".to_string(),
            experiment: Some("exp".to_string()),
        };
        let info = RunInfo::from(&markers);
        assert_eq!(info.output_dir, PathBuf::from("outputs"));
        assert_eq!(info.logs_dir, PathBuf::from("logs"));
        assert_eq!(info.experiment.as_deref(), Some("exp"));
    }

    #[test]
    fn test_remote_context_makes_no_platform_calls() {
        // A mock with no expectations panics on any call
        let platform = MockRemotePlatform::new();
        let guard = ElevationGuard::new(
            ExecutionContext::Remote(RunMarkers {
                run_id: "run-1".to_string(),
                experiment: None,
            }),
            &platform,
        );
        let outcome = guard
            .submit_project_if_needed(Path::new("/nonexistent"), "train.py", &[])
            .unwrap();
        assert!(matches!(outcome, ElevationOutcome::Remote(run) if run.run_id == "run-1"));
    }

    #[test]
    fn test_local_without_descriptor_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let platform = MockRemotePlatform::new();
        let config =
            ElevationConfig::from_toml(dir.path(), "compute_target = \"gpu\"\n", |_| None).unwrap();
        let err = ElevationGuard::new(ExecutionContext::Local, &platform)
            .submit_if_needed(&config, "train.py", &[])
            .unwrap_err();
        assert!(matches!(err, ElevationError::Configuration { .. }));
    }
}
