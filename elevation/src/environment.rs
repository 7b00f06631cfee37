//! Environment resolution
//!
//! Turns a user's dependency declaration into a registered environment,
//! reusing an existing registration whenever the dependencies are unchanged.
//!
//! Policy:
//! - explicit base image: always register a fresh version
//! - no base image: hash the normalized manifest, reuse on hit, register on miss
//! - deletion: every identifying field must be given and must match

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{ElevationError, ElevationResult};
use crate::platform::RemotePlatform;
use crate::workspace::WorkspaceHandle;

/// Image used when the request does not name one
pub const DEFAULT_BASE_IMAGE: &str = "mcr.microsoft.com/azureml/openmpi4.1.0-ubuntu20.04:latest";

/// Number of hex characters of the content hash used in version strings
const HASH_VERSION_LEN: usize = 16;

/// Tag under which the content hash is stored on the platform
pub const CONTENT_HASH_TAG: &str = "elevation_content_hash";

/// Declared runtime dependencies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyManifest {
    /// Pinned pip packages, e.g. `torch==2.1.0`
    Packages(Vec<String>),
    /// Path to a conda environment file
    File(PathBuf),
}

/// What the caller asks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRequest {
    pub name: String,
    #[serde(default)]
    pub base_image: Option<String>,
    pub manifest: DependencyManifest,
    #[serde(default)]
    pub pip_extra_index_url: Option<String>,
}

/// A registered (or about to be registered) environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub name: String,
    pub version: String,
    pub base_image: Option<String>,
    /// Conda file content sent to the platform
    pub conda_file: String,
    /// blake3 hex over the normalized manifest and base image
    pub content_hash: String,
}

impl EnvironmentSpec {
    /// Image the platform should build on.
    pub fn image(&self) -> &str {
        self.base_image.as_deref().unwrap_or(DEFAULT_BASE_IMAGE)
    }

    /// `name:version`, the form most platform UIs show.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

/// Parameters for deleting a registered environment.
///
/// All three are required; a partial match never deletes anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentDeletion {
    pub name: Option<String>,
    pub version: Option<String>,
    pub content_hash: Option<String>,
}

/// Resolves environment requests against one workspace
pub struct EnvironmentResolver<'a, P: RemotePlatform + ?Sized> {
    platform: &'a P,
    workspace: &'a WorkspaceHandle,
}

impl<'a, P: RemotePlatform + ?Sized> EnvironmentResolver<'a, P> {
    pub fn new(platform: &'a P, workspace: &'a WorkspaceHandle) -> Self {
        Self {
            platform,
            workspace,
        }
    }

    /// Resolve a request to a registered environment.
    pub fn resolve(&self, request: &EnvironmentRequest) -> ElevationResult<EnvironmentSpec> {
        let conda_file = render_conda_file(request)?;
        let content_hash = content_hash(&conda_file, request.base_image.as_deref());
        let short_hash = &content_hash[..HASH_VERSION_LEN];

        if request.base_image.is_some() {
            let version = format!("{short_hash}-{}", Utc::now().format("%Y%m%d%H%M%S%3f"));
            let spec = EnvironmentSpec {
                name: request.name.clone(),
                version,
                base_image: request.base_image.clone(),
                conda_file,
                content_hash,
            };
            info!(
                env = %spec.reference(),
                image = %spec.image(),
                "Base image given, registering new environment version"
            );
            self.register(&spec)?;
            return Ok(spec);
        }

        let existing = self
            .platform
            .find_environment_by_hash(self.workspace, &request.name, &content_hash)
            .map_err(|e| {
                ElevationError::environment(format!(
                    "lookup of environment '{}' failed: {e}",
                    request.name
                ))
            })?;

        if let Some(spec) = existing {
            debug!(env = %spec.reference(), hash = %content_hash, "Environment cache hit");
            return Ok(spec);
        }

        let spec = EnvironmentSpec {
            name: request.name.clone(),
            version: short_hash.to_string(),
            base_image: None,
            conda_file,
            content_hash,
        };
        debug!(env = %spec.reference(), "Environment cache miss");
        info!(env = %spec.reference(), "Registering environment");
        self.register(&spec)?;
        Ok(spec)
    }

    /// Delete one registered environment after checking every identifying field.
    pub fn delete_environment(&self, deletion: &EnvironmentDeletion) -> ElevationResult<()> {
        fn present(v: &Option<String>) -> Option<&str> {
            v.as_deref().map(str::trim).filter(|s| !s.is_empty())
        }

        let mut missing = Vec::new();
        let name = present(&deletion.name);
        let version = present(&deletion.version);
        let hash = present(&deletion.content_hash);
        if name.is_none() {
            missing.push("name");
        }
        if version.is_none() {
            missing.push("version");
        }
        if hash.is_none() {
            missing.push("content_hash");
        }
        let (Some(name), Some(version), Some(hash)) = (name, version, hash) else {
            return Err(ElevationError::validation(format!(
                "environment deletion requires every identifying parameter; missing: {}",
                missing.join(", ")
            )));
        };

        let existing = self
            .platform
            .get_environment(self.workspace, name, version)
            .map_err(|e| ElevationError::environment(format!("lookup of {name}:{version} failed: {e}")))?
            .ok_or_else(|| {
                ElevationError::validation(format!("no registered environment {name}:{version}"))
            })?;

        if existing.content_hash != hash {
            return Err(ElevationError::validation(format!(
                "content hash mismatch for {name}:{version}: registered {}, given {hash}",
                existing.content_hash
            )));
        }

        self.platform
            .delete_environment(self.workspace, name, version)
            .map_err(|e| ElevationError::environment(format!("deletion of {name}:{version} failed: {e}")))?;
        info!(env = %existing.reference(), "Deleted environment");
        Ok(())
    }

    fn register(&self, spec: &EnvironmentSpec) -> ElevationResult<()> {
        self.platform
            .register_environment(self.workspace, spec)
            .map_err(|e| {
                ElevationError::environment(format!(
                    "registration of {} failed: {e}",
                    spec.reference()
                ))
            })
    }
}

/// Produce the conda file content for a request.
pub fn render_conda_file(request: &EnvironmentRequest) -> ElevationResult<String> {
    match &request.manifest {
        DependencyManifest::File(path) => std::fs::read_to_string(path).map_err(|e| {
            ElevationError::configuration(format!(
                "cannot read dependency file {}: {e}",
                path.display()
            ))
        }),
        DependencyManifest::Packages(packages) => {
            let mut pinned: Vec<&str> = packages
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .collect();
            pinned.sort_unstable();
            pinned.dedup();

            let mut out = format!("name: {}\nchannels:\n  - conda-forge\ndependencies:\n  - pip\n  - pip:\n", request.name);
            if let Some(url) = &request.pip_extra_index_url {
                out.push_str(&format!("    - --extra-index-url {url}\n"));
            }
            for package in pinned {
                out.push_str(&format!("    - {package}\n"));
            }
            Ok(out)
        }
    }
}

/// Hash a conda file and base image into the environment cache key.
///
/// Trailing whitespace, blank lines and comment lines do not affect the hash.
pub fn content_hash(conda_file: &str, base_image: Option<&str>) -> String {
    let normalized: Vec<&str> = conda_file
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .collect();

    let mut hasher = blake3::Hasher::new();
    hasher.update(normalized.join("\n").as_bytes());
    hasher.update(b"\0image\0");
    hasher.update(base_image.unwrap_or_default().as_bytes());
    hasher.finalize().to_hex().to_string()
}
