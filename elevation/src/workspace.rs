//! Workspace descriptor
//!
//! The workspace (subscription, resource group, workspace name) is supplied by
//! the caller in a `config.json` at the root of their project. This crate only
//! ever reads it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ElevationError, ElevationResult};

/// File name of the workspace descriptor, relative to the project root
pub const WORKSPACE_CONFIG_FILE: &str = "config.json";

/// Read-only handle to a platform workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub subscription_id: String,
    pub resource_group: String,
    pub workspace_name: String,
}

impl WorkspaceHandle {
    /// Path to the workspace descriptor for a given project root.
    pub fn descriptor_path(project_root: &Path) -> PathBuf {
        project_root.join(WORKSPACE_CONFIG_FILE)
    }

    /// Load the descriptor from `<project_root>/config.json`.
    ///
    /// A missing file is a hard error: nothing can be submitted without it.
    pub fn load(project_root: &Path) -> ElevationResult<Self> {
        Self::load_from_file(&Self::descriptor_path(project_root))
    }

    /// Load and validate a descriptor from an explicit path.
    pub fn load_from_file(path: &Path) -> ElevationResult<Self> {
        let buf = std::fs::read(path).map_err(|e| {
            ElevationError::configuration(format!(
                "cannot read workspace descriptor {}: {e}",
                path.display()
            ))
        })?;
        let handle: WorkspaceHandle = serde_json::from_slice(&buf).map_err(|e| {
            ElevationError::configuration(format!(
                "invalid workspace descriptor {}: {e}",
                path.display()
            ))
        })?;
        handle.validate()?;
        Ok(handle)
    }

    /// Every field must be non-empty.
    pub fn validate(&self) -> ElevationResult<()> {
        let fields = [
            ("subscription_id", &self.subscription_id),
            ("resource_group", &self.resource_group),
            ("workspace_name", &self.workspace_name),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ElevationError::configuration(format!(
                    "workspace descriptor field '{name}' is empty"
                )));
            }
        }
        Ok(())
    }

    /// ARM resource path of the workspace (no host, no query string).
    pub fn resource_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.MachineLearningServices/workspaces/{}",
            self.subscription_id, self.resource_group, self.workspace_name
        )
    }
}

impl std::fmt::Display for WorkspaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_group, self.workspace_name)
    }
}
