//! Artifact build and cleanup for `elevate package` / `elevate clean`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

use elevation::{ElevationConfig, SourcePackage, SourcePackager};

/// Run the configured build command, then confirm an artifact was produced.
pub fn build(config: &ElevationConfig) -> Result<PathBuf> {
    let (program, args) = config
        .build_command
        .split_first()
        .context("build_command is empty")?;

    info!(command = ?config.build_command, "Building artifact");
    let status = Command::new(program)
        .args(args)
        .current_dir(&config.project_root)
        .status()
        .with_context(|| format!("Failed to run `{program}`"))?;

    if !status.success() {
        anyhow::bail!("build command exited with {status}");
    }

    match SourcePackager::new(config.packaging.clone()).package(&config.project_root)? {
        SourcePackage::Artifact(artifact) => {
            info!(path = %artifact.path.display(), bytes = artifact.size_bytes, "Artifact ready");
            Ok(artifact.path)
        }
        SourcePackage::Snapshot(_) => anyhow::bail!(
            "build finished but no artifact appeared in {}",
            config.artifact_dir().display()
        ),
    }
}

/// Remove the artifact directory. Returns whether anything was removed.
pub fn clean(config: &ElevationConfig) -> Result<bool> {
    let dir = config.artifact_dir();
    ensure_inside(&config.project_root, &dir)?;
    if !dir.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(&dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
    info!(dir = %dir.display(), "Removed artifact directory");
    Ok(true)
}

/// Refuse to touch anything that is not strictly below the project root.
fn ensure_inside(root: &Path, dir: &Path) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", root.display()))?;
    let target = match dir.canonicalize() {
        Ok(path) => path,
        // Not created yet; nothing to delete either way
        Err(_) => return Ok(()),
    };
    if target == root || !target.starts_with(&root) {
        anyhow::bail!(
            "artifact directory {} is not inside project {}",
            target.display(),
            root.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path, extra: &str) -> ElevationConfig {
        let text = format!("compute_target = \"gpu\"\n{extra}");
        ElevationConfig::from_toml(root, &text, |_| None).unwrap()
    }

    #[test]
    fn test_clean_removes_artifact_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        std::fs::write(dir.path().join("dist").join("a-1.0.tar.gz"), b"x").unwrap();

        let config = config(dir.path(), "");
        assert!(clean(&config).unwrap());
        assert!(!dir.path().join("dist").exists());
        assert!(!clean(&config).unwrap());
    }

    #[test]
    fn test_clean_refuses_project_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.py"), "").unwrap();
        let config = config(dir.path(), "[packaging]\nartifact_dir = \".\"\n");
        assert!(clean(&config).is_err());
        assert!(dir.path().join("train.py").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_build_runs_command_and_finds_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            dir.path(),
            "[packaging]\nbuild_command = [\"sh\", \"-c\", \"mkdir -p dist && printf wheel > dist/demo-1.0-py3-none-any.whl\"]\n",
        );
        let path = build(&config).unwrap();
        assert!(path.ends_with("demo-1.0-py3-none-any.whl"));
    }

    #[cfg(unix)]
    #[test]
    fn test_build_without_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            dir.path(),
            "[packaging]\nbuild_command = [\"true\"]\n",
        );
        assert!(build(&config).is_err());
    }
}
