//! Source packaging: prebuilt artifact or directory snapshot
//!
//! A prebuilt artifact in the artifact directory always wins; the source tree
//! is only walked when no artifact is present. Removing stale artifacts before
//! a snapshot run is the caller's job (`elevate clean`).

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::{ElevationError, ElevationResult};

/// Artifact directory relative to the source root
pub const DEFAULT_ARTIFACT_DIR: &str = "dist";

/// Largest snapshot the platform accepts without a datastore upload
pub const DEFAULT_MAX_SNAPSHOT_BYTES: u64 = 300 * 1024 * 1024;

/// Per-directory ignore file honoured in addition to `.gitignore`
pub const IGNORE_FILE_NAME: &str = ".amlignore";

/// Directories never included in a snapshot
const ALWAYS_EXCLUDED: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".azureml",
    ".elevation",
    "__pycache__",
    ".ipynb_checkpoints",
];

const ARTIFACT_EXTENSIONS: &[&str] = &[".whl", ".tar.gz", ".zip"];

/// A prebuilt distributable found in the artifact directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPackage {
    pub path: PathBuf,
    pub name: String,
    pub version: Option<String>,
    pub size_bytes: u64,
    /// Entry script uploaded next to the artifact
    pub entry_script: Option<ShippedFile>,
}

/// A single source file uploaded alongside an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShippedFile {
    pub path: PathBuf,
    /// `/`-separated path relative to the upload root
    pub upload_name: String,
    pub size_bytes: u64,
}

/// A copy of the source tree, staged in a temporary directory
#[derive(Debug)]
pub struct DirectorySnapshot {
    pub source_root: PathBuf,
    /// Paths relative to the staging directory, sorted
    pub files: Vec<PathBuf>,
    pub total_bytes: u64,
    staging: TempDir,
}

impl DirectorySnapshot {
    /// Root of the staged copy. Removed when the snapshot is dropped.
    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }
}

/// What gets uploaded with a job. Exactly one form per submission.
#[derive(Debug)]
pub enum SourcePackage {
    Artifact(ArtifactPackage),
    Snapshot(DirectorySnapshot),
}

impl SourcePackage {
    /// Files to upload as `(absolute path, upload-relative name)` pairs.
    pub fn upload_files(&self) -> Vec<(PathBuf, String)> {
        match self {
            Self::Artifact(artifact) => {
                let name = artifact
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| artifact.name.clone());
                let mut files = vec![(artifact.path.clone(), name)];
                if let Some(script) = &artifact.entry_script {
                    files.push((script.path.clone(), script.upload_name.clone()));
                }
                files
            }
            Self::Snapshot(snapshot) => snapshot
                .files
                .iter()
                .map(|rel| (snapshot.staging_dir().join(rel), upload_name(rel)))
                .collect(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        match self {
            Self::Artifact(a) => {
                a.size_bytes + a.entry_script.as_ref().map_or(0, |s| s.size_bytes)
            }
            Self::Snapshot(s) => s.total_bytes,
        }
    }

    /// Make sure the entry point travels with the package.
    ///
    /// A snapshot must already contain it. An artifact gets the script
    /// uploaded next to it, so the job command can still reference it.
    /// Bare names that are not files under the source root are taken to be
    /// console scripts installed by the artifact and left alone.
    pub fn include_entry_point(
        &mut self,
        source_root: &Path,
        entry_point: &str,
    ) -> ElevationResult<()> {
        let rel = entry_relative_path(source_root, entry_point)?;
        let local = source_root.join(&rel);
        let looks_like_path = entry_point.ends_with(".py")
            || entry_point.starts_with("./")
            || rel.components().count() > 1;

        let meta = match fs::metadata(&local) {
            Ok(meta) if meta.is_file() => meta,
            _ if looks_like_path => {
                return Err(ElevationError::packaging(
                    &local,
                    format!("entry point '{entry_point}' not found under the source root"),
                ))
            }
            _ => {
                debug!(entry_point, "Entry point is not a local file, assuming installed command");
                return Ok(());
            }
        };

        match self {
            Self::Snapshot(snapshot) => {
                if !snapshot.files.contains(&rel) {
                    return Err(ElevationError::packaging(
                        &local,
                        format!("entry point '{entry_point}' is excluded from the snapshot"),
                    ));
                }
            }
            Self::Artifact(artifact) => {
                artifact.entry_script = Some(ShippedFile {
                    path: local,
                    upload_name: upload_name(&rel),
                    size_bytes: meta.len(),
                });
            }
        }
        Ok(())
    }

    /// One-line description for logs and tags.
    pub fn describe(&self) -> String {
        match self {
            Self::Artifact(a) => match &a.version {
                Some(v) => format!("artifact {} {v}", a.name),
                None => format!("artifact {}", a.name),
            },
            Self::Snapshot(s) => format!(
                "snapshot of {} ({} files)",
                s.source_root.display(),
                s.files.len()
            ),
        }
    }
}

/// Packaging knobs, usually filled from `elevation.toml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagingOptions {
    /// Where prebuilt artifacts live; relative paths are taken from the source root
    pub artifact_dir: PathBuf,
    /// Extra gitignore-style globs to leave out of a snapshot
    pub exclude: Vec<String>,
    pub max_snapshot_bytes: u64,
}

impl Default for PackagingOptions {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            exclude: Vec::new(),
            max_snapshot_bytes: DEFAULT_MAX_SNAPSHOT_BYTES,
        }
    }
}

/// Builds a [`SourcePackage`] for a source root.
pub struct SourcePackager {
    options: PackagingOptions,
}

impl SourcePackager {
    pub fn new(options: PackagingOptions) -> Self {
        Self { options }
    }

    /// Package `source_root`, preferring a prebuilt artifact.
    pub fn package(&self, source_root: &Path) -> ElevationResult<SourcePackage> {
        if !source_root.is_dir() {
            return Err(ElevationError::packaging(
                source_root,
                "source root is not a readable directory",
            ));
        }

        if let Some(artifact) = self.find_artifact(source_root)? {
            info!(
                path = %artifact.path.display(),
                bytes = artifact.size_bytes,
                "Using prebuilt artifact"
            );
            return Ok(SourcePackage::Artifact(artifact));
        }

        let snapshot = self.snapshot(source_root)?;
        info!(
            root = %source_root.display(),
            files = snapshot.files.len(),
            bytes = snapshot.total_bytes,
            "Snapshotted source tree"
        );
        Ok(SourcePackage::Snapshot(snapshot))
    }

    fn artifact_dir(&self, source_root: &Path) -> PathBuf {
        source_root.join(&self.options.artifact_dir)
    }

    /// Newest artifact in the artifact directory, if any.
    fn find_artifact(&self, source_root: &Path) -> ElevationResult<Option<ArtifactPackage>> {
        let dir = self.artifact_dir(source_root);
        if !dir.is_dir() {
            return Ok(None);
        }

        let entries = fs::read_dir(&dir)
            .map_err(|e| ElevationError::packaging(&dir, format!("cannot list artifacts: {e}")))?;

        let mut newest: Option<(SystemTime, PathBuf, u64)> = None;
        for entry in entries {
            let entry = entry
                .map_err(|e| ElevationError::packaging(&dir, format!("cannot list artifacts: {e}")))?;
            let path = entry.path();
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if !ARTIFACT_EXTENSIONS.iter().any(|ext| file_name.ends_with(ext)) {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| ElevationError::packaging(&path, format!("cannot stat artifact: {e}")))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let newer = match &newest {
                Some((t, p, _)) => (modified, &path) > (*t, p),
                None => true,
            };
            if newer {
                newest = Some((modified, path, meta.len()));
            }
        }

        let Some((_, path, size_bytes)) = newest else {
            debug!(dir = %dir.display(), "Artifact directory has no artifacts");
            return Ok(None);
        };

        if size_bytes == 0 {
            return Err(ElevationError::packaging(&path, "artifact is empty"));
        }

        let (name, version) = parse_artifact_name(&path)
            .ok_or_else(|| ElevationError::packaging(&path, "artifact file name is not name-version"))?;

        Ok(Some(ArtifactPackage {
            path,
            name,
            version,
            size_bytes,
            entry_script: None,
        }))
    }

    /// Copy the source tree into a staging directory, honouring ignore rules.
    fn snapshot(&self, source_root: &Path) -> ElevationResult<DirectorySnapshot> {
        let mut overrides = OverrideBuilder::new(source_root);
        for pattern in &self.options.exclude {
            overrides.add(&format!("!{pattern}")).map_err(|e| {
                ElevationError::packaging(source_root, format!("invalid exclude pattern '{pattern}': {e}"))
            })?;
        }
        let overrides = overrides.build().map_err(|e| {
            ElevationError::packaging(source_root, format!("invalid exclude patterns: {e}"))
        })?;

        let artifact_dir = self.artifact_dir(source_root);
        let walker = WalkBuilder::new(source_root)
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .follow_links(true)
            .add_custom_ignore_filename(IGNORE_FILE_NAME)
            .overrides(overrides)
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let excluded = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| ALWAYS_EXCLUDED.contains(&name));
                !excluded && entry.path() != artifact_dir
            })
            .build();

        let staging = tempfile::Builder::new()
            .prefix("elevation-snapshot-")
            .tempdir()
            .map_err(|e| ElevationError::packaging(source_root, format!("cannot create staging dir: {e}")))?;

        let mut files = Vec::new();
        let mut total_bytes = 0u64;
        for entry in walker {
            let entry = entry
                .map_err(|e| ElevationError::packaging(source_root, format!("cannot read source tree: {e}")))?;
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            let rel = path
                .strip_prefix(source_root)
                .map_err(|e| ElevationError::packaging(path, e.to_string()))?
                .to_path_buf();

            let target = staging.path().join(&rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| ElevationError::packaging(parent, e.to_string()))?;
            }
            total_bytes += fs::copy(path, &target)
                .map_err(|e| ElevationError::packaging(path, format!("cannot copy: {e}")))?;
            if total_bytes > self.options.max_snapshot_bytes {
                return Err(ElevationError::packaging(
                    source_root,
                    format!(
                        "snapshot exceeds {} bytes; exclude data with {IGNORE_FILE_NAME} or build an artifact",
                        self.options.max_snapshot_bytes
                    ),
                ));
            }
            files.push(rel);
        }
        files.sort();

        Ok(DirectorySnapshot {
            source_root: source_root.to_path_buf(),
            files,
            total_bytes,
            staging,
        })
    }
}

fn upload_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Entry point as a normalized path below the source root.
fn entry_relative_path(source_root: &Path, entry_point: &str) -> ElevationResult<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(entry_point).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => rel.push(part),
            _ => {
                return Err(ElevationError::packaging(
                    source_root,
                    format!("entry point '{entry_point}' must be a path inside the source root"),
                ))
            }
        }
    }
    if rel.as_os_str().is_empty() {
        return Err(ElevationError::packaging(source_root, "entry point is empty"));
    }
    Ok(rel)
}

/// Split `name-version[-tags].ext` into name and version.
fn parse_artifact_name(path: &Path) -> Option<(String, Option<String>)> {
    let file_name = path.file_name()?.to_str()?;
    let stem = ARTIFACT_EXTENSIONS
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))?;
    let mut parts = stem.splitn(3, '-');
    let name = parts.next().filter(|n| !n.is_empty())?.to_string();
    let version = parts.next().filter(|v| !v.is_empty()).map(str::to_string);
    Some((name, version))
}
