//! Job submission
//!
//! Builds a [`JobSpec`] from the resolved pieces and hands it to the platform.
//! Job creation is not idempotent, so nothing here retries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::context::ELEVATION_MARKER_VAR;
use crate::environment::EnvironmentSpec;
use crate::error::{ElevationError, ElevationResult};
use crate::packager::SourcePackage;
use crate::platform::RemotePlatform;
use crate::workspace::WorkspaceHandle;

/// Interpreter used for `.py` entry points
const PYTHON: &str = "python";

/// Job name prefix when the experiment name has nothing usable
const DEFAULT_JOB_PREFIX: &str = "job";

/// What the caller wants to run remotely
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub entry_point: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub experiment: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Fully assembled job, as sent to the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub display_name: String,
    pub experiment: String,
    pub command: String,
    pub environment_name: String,
    pub environment_version: String,
    /// Platform id of the uploaded source package
    pub code_id: String,
    pub compute_target: String,
    pub environment_variables: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub workspace: WorkspaceHandle,
}

/// Returned once the platform accepted a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub studio_url: Option<String>,
}

/// Submits jobs through a [`RemotePlatform`]
pub struct JobSubmitter<'a, P: RemotePlatform + ?Sized> {
    platform: &'a P,
}

impl<'a, P: RemotePlatform + ?Sized> JobSubmitter<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        Self { platform }
    }

    /// Upload the source, assemble the job and create it.
    pub fn submit(
        &self,
        request: &JobRequest,
        environment: &EnvironmentSpec,
        package: &SourcePackage,
        compute_target: &str,
        workspace: &WorkspaceHandle,
    ) -> ElevationResult<JobHandle> {
        match self.platform.compute_target_exists(workspace, compute_target) {
            Ok(true) => {}
            Ok(false) => {
                return Err(ElevationError::submission(format!(
                    "compute target '{compute_target}' does not exist in workspace {workspace}"
                )))
            }
            Err(e) => {
                return Err(ElevationError::from_submission(
                    "checking compute target",
                    e,
                ))
            }
        }

        let code_id = self
            .platform
            .upload_source(workspace, package)
            .map_err(|e| ElevationError::from_submission("uploading source", e))?;

        let spec = build_job_spec(
            request,
            environment,
            package,
            &code_id,
            compute_target,
            workspace,
        )?;
        info!(
            job = %spec.name,
            compute = %spec.compute_target,
            env = %environment.reference(),
            source = %package.describe(),
            "Creating job"
        );

        let handle = self
            .platform
            .create_job(&spec)
            .map_err(|e| ElevationError::from_submission("creating job", e))?;
        info!(job = %handle.name, status = %handle.status, "Job accepted");
        Ok(handle)
    }
}

/// Assemble the job spec. The elevation marker is always injected.
pub fn build_job_spec(
    request: &JobRequest,
    environment: &EnvironmentSpec,
    package: &SourcePackage,
    code_id: &str,
    compute_target: &str,
    workspace: &WorkspaceHandle,
) -> ElevationResult<JobSpec> {
    let name = job_name(&request.experiment);
    let mut command = command_line(&request.entry_point, &request.args)?;
    if let SourcePackage::Artifact(artifact) = package {
        let file = artifact
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let install = shlex::try_join(["pip", "install", &format!("./{file}")])
            .map_err(|e| ElevationError::submission(format!("cannot quote artifact name: {e}")))?;
        command = format!("{install} && {command}");
    }

    let mut environment_variables = request.env_vars.clone();
    environment_variables.insert(ELEVATION_MARKER_VAR.to_string(), name.clone());

    let mut tags = request.tags.clone();
    tags.insert("entry_point".to_string(), request.entry_point.clone());
    tags.insert("source".to_string(), package.describe());

    Ok(JobSpec {
        display_name: request
            .display_name
            .clone()
            .unwrap_or_else(|| request.entry_point.clone()),
        name,
        experiment: request.experiment.clone(),
        command,
        environment_name: environment.name.clone(),
        environment_version: environment.version.clone(),
        code_id: code_id.to_string(),
        compute_target: compute_target.to_string(),
        environment_variables,
        tags,
        workspace: workspace.clone(),
    })
}

/// Shell command that runs the entry point with its arguments.
pub fn command_line(entry_point: &str, args: &[String]) -> ElevationResult<String> {
    if entry_point.trim().is_empty() {
        return Err(ElevationError::submission("entry point is empty"));
    }
    let mut parts: Vec<&str> = Vec::with_capacity(args.len() + 2);
    if entry_point.ends_with(".py") {
        parts.push(PYTHON);
    }
    parts.push(entry_point);
    parts.extend(args.iter().map(String::as_str));
    shlex::try_join(parts)
        .map_err(|e| ElevationError::submission(format!("cannot quote command line: {e}")))
}

/// Unique job name: experiment, UTC timestamp, random suffix.
fn job_name(experiment: &str) -> String {
    let prefix: String = experiment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let prefix = match prefix.trim_matches('_') {
        "" => DEFAULT_JOB_PREFIX,
        trimmed => trimmed,
    };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{prefix}_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}
