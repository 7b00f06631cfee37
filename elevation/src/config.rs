//! Elevation configuration
//!
//! Read from an optional `elevation.toml` at the project root, then overridden
//! by `ELEVATION_*` environment variables. Only loaded on the LOCAL branch.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::environment::{DependencyManifest, EnvironmentRequest};
use crate::error::{ElevationError, ElevationResult};
use crate::packager::{PackagingOptions, DEFAULT_ARTIFACT_DIR, DEFAULT_MAX_SNAPSHOT_BYTES};
use crate::submitter::JobRequest;

/// Config file name, relative to the project root
pub const CONFIG_FILE: &str = "elevation.toml";

/// Conda file picked up automatically when nothing else is declared
pub const DEFAULT_CONDA_FILE: &str = "environment.yml";

const DEFAULT_ENVIRONMENT_NAME: &str = "elevation-env";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    compute_target: Option<String>,
    experiment: Option<String>,
    #[serde(default)]
    environment: EnvironmentSection,
    #[serde(default)]
    packaging: PackagingSection,
    #[serde(default)]
    job: JobSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvironmentSection {
    name: Option<String>,
    base_image: Option<String>,
    conda_file: Option<PathBuf>,
    packages: Option<Vec<String>>,
    pip_extra_index_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackagingSection {
    artifact_dir: Option<PathBuf>,
    #[serde(default)]
    exclude: Vec<String>,
    max_snapshot_mb: Option<u64>,
    build_command: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobSection {
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

/// Everything the LOCAL branch needs besides the workspace descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElevationConfig {
    pub project_root: PathBuf,
    pub compute_target: String,
    pub experiment: String,
    pub environment: EnvironmentRequest,
    pub packaging: PackagingOptions,
    /// Command that builds an artifact into the artifact directory
    pub build_command: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

impl ElevationConfig {
    /// Load `<project_root>/elevation.toml` (if present) plus environment overrides.
    pub fn load(project_root: &Path) -> ElevationResult<Self> {
        let path = project_root.join(CONFIG_FILE);
        let text = if path.is_file() {
            std::fs::read_to_string(&path).map_err(|e| {
                ElevationError::configuration(format!("cannot read {}: {e}", path.display()))
            })?
        } else {
            String::new()
        };
        Self::from_toml(project_root, &text, |key| std::env::var(key).ok())
    }

    /// Build a config from TOML text and an environment lookup.
    pub fn from_toml<F>(project_root: &Path, text: &str, lookup: F) -> ElevationResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file: FileConfig = toml::from_str(text)
            .map_err(|e| ElevationError::configuration(format!("invalid {CONFIG_FILE}: {e}")))?;
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let compute_target = env("ELEVATION_COMPUTE_TARGET")
            .or(file.compute_target)
            .ok_or_else(|| {
                ElevationError::configuration(format!(
                    "no compute target; set compute_target in {CONFIG_FILE} or ELEVATION_COMPUTE_TARGET"
                ))
            })?;

        let experiment = env("ELEVATION_EXPERIMENT")
            .or(file.experiment)
            .unwrap_or_else(|| {
                project_root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "default".to_string())
            });

        let section = file.environment;
        let manifest = match (section.conda_file, section.packages) {
            (Some(_), Some(_)) => {
                return Err(ElevationError::configuration(
                    "environment declares both conda_file and packages; pick one",
                ))
            }
            (Some(file), None) => DependencyManifest::File(project_root.join(file)),
            (None, Some(packages)) => DependencyManifest::Packages(packages),
            (None, None) if project_root.join(DEFAULT_CONDA_FILE).is_file() => {
                DependencyManifest::File(project_root.join(DEFAULT_CONDA_FILE))
            }
            (None, None) => DependencyManifest::Packages(Vec::new()),
        };
        let environment = EnvironmentRequest {
            name: section
                .name
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT_NAME.to_string()),
            base_image: env("ELEVATION_BASE_IMAGE").or(section.base_image),
            manifest,
            pip_extra_index_url: section.pip_extra_index_url,
        };

        let artifact_dir = env("ELEVATION_ARTIFACT_DIR")
            .map(PathBuf::from)
            .or(file.packaging.artifact_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_DIR));
        let max_snapshot_bytes = match file.packaging.max_snapshot_mb {
            Some(mb) => mb.checked_mul(1024 * 1024).ok_or_else(|| {
                ElevationError::configuration(format!("max_snapshot_mb {mb} is too large"))
            })?,
            None => DEFAULT_MAX_SNAPSHOT_BYTES,
        };
        let packaging = PackagingOptions {
            artifact_dir: artifact_dir.clone(),
            exclude: file.packaging.exclude,
            max_snapshot_bytes,
        };

        let build_command = file.packaging.build_command.unwrap_or_else(|| {
            vec![
                "python".to_string(),
                "-m".to_string(),
                "build".to_string(),
                "--outdir".to_string(),
                artifact_dir.to_string_lossy().to_string(),
            ]
        });

        Ok(Self {
            project_root: project_root.to_path_buf(),
            compute_target,
            experiment,
            environment,
            packaging,
            build_command,
            env_vars: file.job.env,
            tags: file.job.tags,
        })
    }

    /// Absolute artifact directory.
    pub fn artifact_dir(&self) -> PathBuf {
        self.project_root.join(&self.packaging.artifact_dir)
    }

    /// Job request for an entry point, carrying the configured env vars and tags.
    pub fn job_request(&self, entry_point: &str, args: &[String]) -> JobRequest {
        JobRequest {
            entry_point: entry_point.to_string(),
            args: args.to_vec(),
            experiment: self.experiment.clone(),
            display_name: None,
            env_vars: self.env_vars.clone(),
            tags: self.tags.clone(),
        }
    }
}
