//! In-memory platform
//!
//! Records every call and keeps registered environments and jobs in memory.
//! Backs `elevate run --dry-run` and the test suites.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use super::{PlatformError, RemotePlatform};
use crate::environment::EnvironmentSpec;
use crate::packager::SourcePackage;
use crate::submitter::{JobHandle, JobSpec};
use crate::workspace::WorkspaceHandle;

/// Kinds of platform calls, in the order they were made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformCall {
    ValidateWorkspace,
    ComputeTargetExists,
    FindEnvironment,
    GetEnvironment,
    RegisterEnvironment,
    DeleteEnvironment,
    UploadSource,
    CreateJob,
    JobStatus,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<PlatformCall>,
    environments: BTreeMap<(String, String), EnvironmentSpec>,
    uploads: Vec<Vec<String>>,
    jobs: Vec<JobSpec>,
}

/// Recording, single-threaded platform implementation
#[derive(Debug)]
pub struct InMemoryPlatform {
    reachable: bool,
    compute_targets: BTreeSet<String>,
    job_rejection: Option<String>,
    state: RefCell<State>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    /// Reachable platform that accepts any compute target.
    pub fn new() -> Self {
        Self {
            reachable: true,
            compute_targets: BTreeSet::new(),
            job_rejection: None,
            state: RefCell::new(State::default()),
        }
    }

    /// Restrict compute targets to the given names.
    pub fn with_compute_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compute_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Every call fails as if the network were down.
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Job creation fails with this body.
    pub fn rejecting_jobs(mut self, body: impl Into<String>) -> Self {
        self.job_rejection = Some(body.into());
        self
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state.borrow().calls.clone()
    }

    /// Number of calls of one kind.
    pub fn count(&self, call: PlatformCall) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    pub fn environments(&self) -> Vec<EnvironmentSpec> {
        self.state.borrow().environments.values().cloned().collect()
    }

    pub fn jobs(&self) -> Vec<JobSpec> {
        self.state.borrow().jobs.clone()
    }

    /// Upload names of every uploaded package.
    pub fn uploads(&self) -> Vec<Vec<String>> {
        self.state.borrow().uploads.clone()
    }

    fn record(&self, call: PlatformCall) -> Result<(), PlatformError> {
        self.state.borrow_mut().calls.push(call);
        if self.reachable {
            Ok(())
        } else {
            Err(PlatformError::Unreachable("in-memory platform is offline".to_string()))
        }
    }
}

impl RemotePlatform for InMemoryPlatform {
    fn validate_workspace(&self, workspace: &WorkspaceHandle) -> Result<(), PlatformError> {
        self.record(PlatformCall::ValidateWorkspace)?;
        workspace
            .validate()
            .map_err(|e| PlatformError::NotFound(e.to_string()))
    }

    fn compute_target_exists(
        &self,
        _workspace: &WorkspaceHandle,
        compute_target: &str,
    ) -> Result<bool, PlatformError> {
        self.record(PlatformCall::ComputeTargetExists)?;
        Ok(self.compute_targets.is_empty() || self.compute_targets.contains(compute_target))
    }

    fn find_environment_by_hash(
        &self,
        _workspace: &WorkspaceHandle,
        name: &str,
        content_hash: &str,
    ) -> Result<Option<EnvironmentSpec>, PlatformError> {
        self.record(PlatformCall::FindEnvironment)?;
        Ok(self
            .state
            .borrow()
            .environments
            .values()
            .find(|e| e.name == name && e.content_hash == content_hash && e.base_image.is_none())
            .cloned())
    }

    fn get_environment(
        &self,
        _workspace: &WorkspaceHandle,
        name: &str,
        version: &str,
    ) -> Result<Option<EnvironmentSpec>, PlatformError> {
        self.record(PlatformCall::GetEnvironment)?;
        Ok(self
            .state
            .borrow()
            .environments
            .get(&(name.to_string(), version.to_string()))
            .cloned())
    }

    fn register_environment(
        &self,
        _workspace: &WorkspaceHandle,
        spec: &EnvironmentSpec,
    ) -> Result<(), PlatformError> {
        self.record(PlatformCall::RegisterEnvironment)?;
        self.state
            .borrow_mut()
            .environments
            .insert((spec.name.clone(), spec.version.clone()), spec.clone());
        Ok(())
    }

    fn delete_environment(
        &self,
        _workspace: &WorkspaceHandle,
        name: &str,
        version: &str,
    ) -> Result<(), PlatformError> {
        self.record(PlatformCall::DeleteEnvironment)?;
        self.state
            .borrow_mut()
            .environments
            .remove(&(name.to_string(), version.to_string()))
            .map(|_| ())
            .ok_or_else(|| PlatformError::NotFound(format!("{name}:{version}")))
    }

    fn upload_source(
        &self,
        _workspace: &WorkspaceHandle,
        package: &SourcePackage,
    ) -> Result<String, PlatformError> {
        self.record(PlatformCall::UploadSource)?;
        let names: Vec<String> = package
            .upload_files()
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        let mut state = self.state.borrow_mut();
        state.uploads.push(names);
        Ok(format!("memory://codes/{}", state.uploads.len()))
    }

    fn create_job(&self, spec: &JobSpec) -> Result<JobHandle, PlatformError> {
        self.record(PlatformCall::CreateJob)?;
        if let Some(body) = &self.job_rejection {
            return Err(PlatformError::Rejected {
                status: 400,
                body: body.clone(),
            });
        }
        self.state.borrow_mut().jobs.push(spec.clone());
        Ok(JobHandle {
            name: spec.name.clone(),
            status: "NotStarted".to_string(),
            studio_url: None,
        })
    }

    fn job_status(
        &self,
        _workspace: &WorkspaceHandle,
        job_name: &str,
    ) -> Result<String, PlatformError> {
        self.record(PlatformCall::JobStatus)?;
        self.state
            .borrow()
            .jobs
            .iter()
            .any(|j| j.name == job_name)
            .then(|| "NotStarted".to_string())
            .ok_or_else(|| PlatformError::NotFound(job_name.to_string()))
    }
}
