//! Control-plane credentials
//!
//! A bearer token for the ARM endpoint, taken from `ELEVATION_ACCESS_TOKEN`
//! or from a cache written by `elevate login`. The cache is filled by
//! shelling out to the Azure CLI.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ElevationError, ElevationResult};

/// Token override, takes precedence over the cache
pub const ACCESS_TOKEN_VAR: &str = "ELEVATION_ACCESS_TOKEN";

/// Resource the token is requested for
pub const ARM_RESOURCE: &str = "https://management.azure.com";

/// Tokens this close to expiry are treated as expired
const EXPIRY_SKEW_SECS: i64 = 300;

/// A cached access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCredential {
    pub access_token: String,
    pub expires_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
}

impl CachedCredential {
    /// Default cache location: `~/.elevation/credentials.json`.
    pub fn default_path() -> ElevationResult<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".elevation").join("credentials.json"))
            .ok_or_else(|| ElevationError::configuration("cannot determine home directory"))
    }

    /// Read a cached credential. `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> ElevationResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            ElevationError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let credential = serde_json::from_str(&text).map_err(|e| {
            ElevationError::configuration(format!("corrupt credential cache {}: {e}", path.display()))
        })?;
        Ok(Some(credential))
    }

    /// Write the cache readable by the owner only (0600 file, 0700 directory on unix).
    pub fn save(&self, path: &Path) -> ElevationResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dir(parent).map_err(|e| {
                ElevationError::configuration(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| ElevationError::configuration(format!("cannot encode credential: {e}")))?;
        write_private_file(path, text.as_bytes()).map_err(|e| {
            ElevationError::configuration(format!("cannot write {}: {e}", path.display()))
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_on - Duration::seconds(EXPIRY_SKEW_SECS) <= now
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies when the file is created
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Token for the current process: env override, then the default cache.
pub fn resolve_access_token() -> ElevationResult<String> {
    resolve_access_token_from(
        std::env::var(ACCESS_TOKEN_VAR).ok(),
        &CachedCredential::default_path()?,
        Utc::now(),
    )
}

/// Token resolution with every input explicit.
pub fn resolve_access_token_from(
    env_token: Option<String>,
    cache_path: &Path,
    now: DateTime<Utc>,
) -> ElevationResult<String> {
    if let Some(token) = env_token.filter(|t| !t.trim().is_empty()) {
        debug!("Using access token from {ACCESS_TOKEN_VAR}");
        return Ok(token);
    }

    match CachedCredential::load(cache_path)? {
        Some(credential) if !credential.is_expired(now) => Ok(credential.access_token),
        Some(credential) => {
            warn!(expired = %credential.expires_on, "Cached access token has expired");
            Err(ElevationError::configuration(
                "cached access token has expired; run `elevate login`",
            ))
        }
        None => Err(ElevationError::configuration(format!(
            "no credentials; run `elevate login` or set {ACCESS_TOKEN_VAR}"
        ))),
    }
}

/// Raw `az account get-access-token` output
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzTokenOutput {
    access_token: String,
    /// Local time, `%Y-%m-%d %H:%M:%S%.f`
    expires_on: Option<String>,
    /// Unix seconds (newer CLI versions)
    #[serde(rename = "expires_on")]
    expires_on_unix: Option<i64>,
    subscription: Option<String>,
}

/// Bridge to the `az` CLI.
pub struct AzureCli {
    bin: String,
}

impl Default for AzureCli {
    fn default() -> Self {
        Self::new()
    }
}

impl AzureCli {
    pub fn new() -> Self {
        Self {
            bin: "az".to_string(),
        }
    }

    /// Fetch a fresh ARM token and write it to `cache_path`.
    pub fn login(&self, cache_path: &Path) -> ElevationResult<CachedCredential> {
        let output = Command::new(&self.bin)
            .args([
                "account",
                "get-access-token",
                "--resource",
                ARM_RESOURCE,
                "--output",
                "json",
            ])
            .output()
            .map_err(|e| {
                ElevationError::configuration(format!(
                    "failed to run `az account get-access-token` ({e}); is the Azure CLI installed?"
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ElevationError::configuration(format!(
                "az account get-access-token failed: {}",
                stderr.trim()
            )));
        }

        let credential = parse_az_token(&output.stdout)?;
        credential.save(cache_path)?;
        info!(
            path = %cache_path.display(),
            expires = %credential.expires_on,
            "Cached access token"
        );
        Ok(credential)
    }
}

/// Parse `az account get-access-token --output json`.
pub fn parse_az_token(stdout: &[u8]) -> ElevationResult<CachedCredential> {
    let raw: AzTokenOutput = serde_json::from_slice(stdout)
        .map_err(|e| ElevationError::configuration(format!("unexpected az output: {e}")))?;

    let expires_on = match (raw.expires_on_unix, raw.expires_on.as_deref()) {
        (Some(secs), _) => Utc.timestamp_opt(secs, 0).single(),
        (None, Some(local)) => NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|dt| dt.with_timezone(&Utc)),
        (None, None) => None,
    }
    .ok_or_else(|| ElevationError::configuration("az output has no usable token expiry"))?;

    Ok(CachedCredential {
        access_token: raw.access_token,
        expires_on,
        subscription: raw.subscription,
    })
}
