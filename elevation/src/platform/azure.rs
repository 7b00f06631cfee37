//! Azure ML control-plane client
//!
//! Blocking REST calls against the ARM endpoint of a workspace. Bearer token
//! auth; the token comes from [`crate::credentials`].

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{PlatformError, RemotePlatform};
use crate::environment::{EnvironmentSpec, CONTENT_HASH_TAG};
use crate::packager::SourcePackage;
use crate::submitter::{JobHandle, JobSpec};
use crate::workspace::WorkspaceHandle;

/// Public-cloud ARM endpoint
pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";

const API_VERSION: &str = "2023-04-01";

/// Code assets uploaded by this crate are versions of this asset
const CODE_ASSET_NAME: &str = "elevation-source";

/// Configuration for the REST client
#[derive(Debug, Clone)]
struct AzureMlConfig {
    endpoint: String,
    request_timeout: Duration,
    upload_timeout: Duration,
}

impl Default for AzureMlConfig {
    fn default() -> Self {
        Self {
            // ELEVATION_ARM_ENDPOINT: sovereign clouds or a local test server
            endpoint: std::env::var("ELEVATION_ARM_ENDPOINT")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_ARM_ENDPOINT.to_string()),
            request_timeout: std::env::var("ELEVATION_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(60)),
            upload_timeout: Duration::from_secs(600),
        }
    }
}

/// Blocking Azure ML REST client
pub struct AzureMlPlatform {
    config: AzureMlConfig,
    token: String,
    http: Client,
}

impl AzureMlPlatform {
    /// Create a client that authenticates with `token`.
    pub fn new(token: impl Into<String>) -> Result<Self, PlatformError> {
        let config = AzureMlConfig::default();
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PlatformError::Unreachable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            config,
            token: token.into(),
            http,
        })
    }

    /// Override the ARM endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// `<endpoint><workspace path>/<segments..>?api-version=`. Every segment is checked.
    fn url(&self, workspace: &WorkspaceHandle, segments: &[&str]) -> Result<String, PlatformError> {
        let mut url = format!(
            "{}{}",
            self.config.endpoint.trim_end_matches('/'),
            workspace_path(workspace)?
        );
        for segment in segments {
            url.push('/');
            url.push_str(path_segment(segment)?);
        }
        url.push_str("?api-version=");
        url.push_str(API_VERSION);
        Ok(url)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, PlatformError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .map_err(|e| PlatformError::Unreachable(e.to_string()))?;
        check_status(response)
    }

    /// GET returning `None` on 404.
    fn get_optional(&self, url: &str) -> Result<Option<Value>, PlatformError> {
        debug!(%url, "GET");
        match self.send(self.http.get(url)) {
            Ok(response) => response
                .json::<Value>()
                .map(Some)
                .map_err(|e| PlatformError::InvalidResponse(e.to_string())),
            Err(PlatformError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put_json(&self, url: &str, body: &Value) -> Result<Value, PlatformError> {
        debug!(%url, "PUT");
        let response = self.send(self.http.put(url).json(body))?;
        let text = response
            .text()
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| PlatformError::InvalidResponse(e.to_string()))
    }

    /// Ask for a temporary SAS container to upload a code asset version into.
    fn start_pending_upload(
        &self,
        workspace: &WorkspaceHandle,
        version: &str,
    ) -> Result<(String, Url), PlatformError> {
        let url = self.url(
            workspace,
            &["codes", CODE_ASSET_NAME, "versions", version, "startPendingUpload"],
        )?;
        debug!(%url, "POST");
        let response = self.send(
            self.http
                .post(&url)
                .json(&json!({ "pendingUploadType": "TemporaryBlobReference" })),
        )?;
        let body: Value = response
            .json()
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))?;
        parse_pending_upload(&body)
    }

    fn upload_blob(&self, sas: &Url, name: &str, path: &std::path::Path) -> Result<(), PlatformError> {
        let mut url = sas.clone();
        url.path_segments_mut()
            .map_err(|_| PlatformError::InvalidResponse("SAS uri cannot be a base".into()))?
            .pop_if_empty()
            .extend(name.split('/'));

        let bytes = std::fs::read(path).map_err(|e| {
            PlatformError::InvalidResponse(format!("cannot read {}: {e}", path.display()))
        })?;
        let response = self
            .http
            .put(url)
            .timeout(self.config.upload_timeout)
            .header("x-ms-blob-type", "BlockBlob")
            .body(bytes)
            .send()
            .map_err(|e| PlatformError::Unreachable(e.to_string()))?;
        check_status(response).map(|_| ())
    }
}

impl RemotePlatform for AzureMlPlatform {
    fn validate_workspace(&self, workspace: &WorkspaceHandle) -> Result<(), PlatformError> {
        let url = self.url(workspace, &[])?;
        self.get_optional(&url)?
            .map(|_| ())
            .ok_or_else(|| PlatformError::NotFound(format!("workspace {workspace}")))
    }

    fn compute_target_exists(
        &self,
        workspace: &WorkspaceHandle,
        compute_target: &str,
    ) -> Result<bool, PlatformError> {
        let url = self.url(workspace, &["computes", compute_target])?;
        Ok(self.get_optional(&url)?.is_some())
    }

    fn find_environment_by_hash(
        &self,
        workspace: &WorkspaceHandle,
        name: &str,
        content_hash: &str,
    ) -> Result<Option<EnvironmentSpec>, PlatformError> {
        Ok(self
            .get_environment(workspace, name, cached_version(content_hash))?
            .filter(|spec| spec.content_hash == content_hash))
    }

    fn get_environment(
        &self,
        workspace: &WorkspaceHandle,
        name: &str,
        version: &str,
    ) -> Result<Option<EnvironmentSpec>, PlatformError> {
        let url = self.url(workspace, &["environments", name, "versions", version])?;
        Ok(self
            .get_optional(&url)?
            .map(|body| parse_environment(name, version, &body)))
    }

    fn register_environment(
        &self,
        workspace: &WorkspaceHandle,
        spec: &EnvironmentSpec,
    ) -> Result<(), PlatformError> {
        let url = self.url(
            workspace,
            &["environments", &spec.name, "versions", &spec.version],
        )?;
        let mut tags = BTreeMap::new();
        tags.insert(CONTENT_HASH_TAG, spec.content_hash.as_str());
        if let Some(image) = &spec.base_image {
            tags.insert("elevation_base_image", image.as_str());
        }
        let body = json!({
            "properties": {
                "image": spec.image(),
                "condaFile": spec.conda_file,
                "osType": "Linux",
                "tags": tags,
            }
        });
        self.put_json(&url, &body).map(|_| ())
    }

    fn delete_environment(
        &self,
        workspace: &WorkspaceHandle,
        name: &str,
        version: &str,
    ) -> Result<(), PlatformError> {
        let url = self.url(workspace, &["environments", name, "versions", version])?;
        debug!(%url, "DELETE");
        self.send(self.http.delete(&url)).map(|_| ())
    }

    fn upload_source(
        &self,
        workspace: &WorkspaceHandle,
        package: &SourcePackage,
    ) -> Result<String, PlatformError> {
        let version = uuid::Uuid::new_v4().simple().to_string();
        let (blob_uri, sas) = self.start_pending_upload(workspace, &version)?;

        let files = package.upload_files();
        for (path, name) in &files {
            self.upload_blob(&sas, name, path)?;
        }
        debug!(files = files.len(), bytes = package.total_bytes(), "Uploaded source");

        let url = self.url(workspace, &["codes", CODE_ASSET_NAME, "versions", &version])?;
        self.put_json(
            &url,
            &json!({ "properties": { "codeUri": blob_uri, "description": package.describe() } }),
        )?;
        Ok(format!(
            "{}/codes/{CODE_ASSET_NAME}/versions/{version}",
            workspace_path(workspace)?
        ))
    }

    fn create_job(&self, spec: &JobSpec) -> Result<JobHandle, PlatformError> {
        let ws = &spec.workspace;
        let url = self.url(ws, &["jobs", &spec.name])?;
        let ws_path = workspace_path(ws)?;
        let body = json!({
            "properties": {
                "jobType": "Command",
                "displayName": spec.display_name,
                "experimentName": spec.experiment,
                "command": spec.command,
                "codeId": spec.code_id,
                "environmentId": format!(
                    "{ws_path}/environments/{}/versions/{}",
                    path_segment(&spec.environment_name)?,
                    path_segment(&spec.environment_version)?
                ),
                "computeId": format!("{ws_path}/computes/{}", path_segment(&spec.compute_target)?),
                "environmentVariables": spec.environment_variables,
                "tags": spec.tags,
            }
        });
        let response = self.put_json(&url, &body)?;
        Ok(parse_job_handle(&spec.name, &response))
    }

    fn job_status(
        &self,
        workspace: &WorkspaceHandle,
        job_name: &str,
    ) -> Result<String, PlatformError> {
        let url = self.url(workspace, &["jobs", job_name])?;
        let body = self
            .get_optional(&url)?
            .ok_or_else(|| PlatformError::NotFound(format!("job {job_name}")))?;
        body["properties"]["status"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PlatformError::InvalidResponse("job has no status".into()))
    }
}

fn check_status(response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(status_error(status, response.text().unwrap_or_default()))
}

fn status_error(status: StatusCode, body: String) -> PlatformError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Unauthorized(body),
        StatusCode::NOT_FOUND => PlatformError::NotFound(body),
        _ => PlatformError::Rejected {
            status: status.as_u16(),
            body,
        },
    }
}

/// A single ARM path segment, passed through unchanged when it is safe to splice.
fn path_segment(value: &str) -> Result<&str, PlatformError> {
    let unsafe_char = |c: char| {
        matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_whitespace() || c.is_control()
    };
    if value.is_empty() || value == "." || value == ".." || value.contains(unsafe_char) {
        return Err(PlatformError::InvalidName(format!("{value:?}")));
    }
    Ok(value)
}

fn workspace_path(workspace: &WorkspaceHandle) -> Result<String, PlatformError> {
    path_segment(&workspace.subscription_id)?;
    path_segment(&workspace.resource_group)?;
    path_segment(&workspace.workspace_name)?;
    Ok(workspace.resource_path())
}

/// Cached registrations are versioned by the leading 16 characters of their hash.
fn cached_version(content_hash: &str) -> &str {
    content_hash.get(..16).unwrap_or(content_hash)
}

fn parse_environment(name: &str, version: &str, body: &Value) -> EnvironmentSpec {
    let props = &body["properties"];
    EnvironmentSpec {
        name: name.to_string(),
        version: version.to_string(),
        base_image: props["tags"]["elevation_base_image"]
            .as_str()
            .map(str::to_string),
        conda_file: props["condaFile"].as_str().unwrap_or_default().to_string(),
        content_hash: props["tags"][CONTENT_HASH_TAG]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    }
}

/// `(blob uri, SAS container url)` from a `startPendingUpload` response.
fn parse_pending_upload(body: &Value) -> Result<(String, Url), PlatformError> {
    let reference = &body["blobReferenceForConsumption"];
    let blob_uri = reference["blobUri"]
        .as_str()
        .ok_or_else(|| PlatformError::InvalidResponse("pending upload has no blobUri".into()))?;
    let sas = reference["credential"]["sasUri"]
        .as_str()
        .ok_or_else(|| PlatformError::InvalidResponse("pending upload has no sasUri".into()))?;
    let sas = Url::parse(sas).map_err(|e| PlatformError::InvalidResponse(e.to_string()))?;
    Ok((blob_uri.to_string(), sas))
}

fn parse_job_handle(requested_name: &str, body: &Value) -> JobHandle {
    let props = &body["properties"];
    JobHandle {
        name: body["name"].as_str().unwrap_or(requested_name).to_string(),
        status: props["status"].as_str().unwrap_or("Unknown").to_string(),
        studio_url: props["services"]["Studio"]["endpoint"]
            .as_str()
            .map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    fn workspace() -> WorkspaceHandle {
        WorkspaceHandle {
            subscription_id: "sub".to_string(),
            resource_group: "rg".to_string(),
            workspace_name: "ws".to_string(),
        }
    }

    fn platform(endpoint: &str) -> AzureMlPlatform {
        AzureMlPlatform {
            config: AzureMlConfig {
                endpoint: endpoint.to_string(),
                request_timeout: Duration::from_secs(5),
                upload_timeout: Duration::from_secs(5),
            },
            token: "token".to_string(),
            http: Client::builder().no_proxy().build().unwrap(),
        }
    }

    /// Answer one connection per canned `(status, body)`; yields the request lines seen.
    fn serve(responses: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let mut content_length = 0;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    if header.trim().is_empty() {
                        break;
                    }
                    if let Some(value) = header.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
                let mut request_body = vec![0; content_length];
                reader.read_exact(&mut request_body).unwrap();
                seen.push(request_line.trim_end().to_string());

                write!(
                    stream,
                    "HTTP/1.1 {status} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
                .unwrap();
            }
            seen
        });
        (endpoint, handle)
    }

    #[test]
    fn test_url_layout() {
        let platform = platform("https://arm.example.com/");
        assert_eq!(
            platform.url(&workspace(), &["computes", "gpu"]).unwrap(),
            "https://arm.example.com/subscriptions/sub/resourceGroups/rg/providers/Microsoft.MachineLearningServices/workspaces/ws/computes/gpu?api-version=2023-04-01"
        );
    }

    #[test]
    fn test_path_segments_are_checked() {
        for bad in ["", ".", "..", "a/b", "../x", "gpu?api-version=1", "a#b", "a%2Fb", "a b", "a\\b"] {
            assert!(
                matches!(path_segment(bad), Err(PlatformError::InvalidName(_))),
                "{bad:?} accepted"
            );
        }
        assert_eq!(path_segment("gpu-cluster_01.v2").unwrap(), "gpu-cluster_01.v2");

        let platform = platform("https://arm.example.com");
        let mut ws = workspace();
        ws.resource_group = "rg/../other".to_string();
        assert!(matches!(
            platform.url(&ws, &["computes", "gpu"]),
            Err(PlatformError::InvalidName(_))
        ));
    }

    #[test]
    fn test_unsafe_names_fail_before_any_request() {
        // Nothing listens here; a request would surface as Unreachable
        let platform = platform("http://127.0.0.1:9");
        let ws = workspace();
        assert!(matches!(
            platform.job_status(&ws, "../.."),
            Err(PlatformError::InvalidName(_))
        ));
        assert!(matches!(
            platform.compute_target_exists(&ws, "gpu/../../other"),
            Err(PlatformError::InvalidName(_))
        ));
        assert!(matches!(
            platform.delete_environment(&ws, "env", "1?x=y"),
            Err(PlatformError::InvalidName(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, String::new()),
            PlatformError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, String::new()),
            PlatformError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, String::new()),
            PlatformError::NotFound(_)
        ));
        let rejected = status_error(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"code":"UserError"}}"#.to_string(),
        );
        assert!(matches!(rejected, PlatformError::Rejected { status: 400, .. }));
        assert_eq!(rejected.diagnostics().unwrap()["error"]["code"], "UserError");
    }

    #[test]
    fn test_parse_environment() {
        let body = json!({
            "properties": {
                "condaFile": "dependencies: []",
                "tags": {
                    "elevation_content_hash": "abc",
                    "elevation_base_image": "myacr.azurecr.io/base:1"
                }
            }
        });
        let spec = parse_environment("env", "3", &body);
        assert_eq!(spec.name, "env");
        assert_eq!(spec.version, "3");
        assert_eq!(spec.content_hash, "abc");
        assert_eq!(spec.conda_file, "dependencies: []");
        assert_eq!(spec.base_image.as_deref(), Some("myacr.azurecr.io/base:1"));

        let bare = parse_environment("env", "1", &json!({}));
        assert_eq!(bare.content_hash, "");
        assert!(bare.base_image.is_none());
    }

    #[test]
    fn test_parse_pending_upload() {
        let body = json!({
            "blobReferenceForConsumption": {
                "blobUri": "https://acct.blob.core.windows.net/container",
                "credential": { "sasUri": "https://acct.blob.core.windows.net/container?sig=x" }
            }
        });
        let (blob, sas) = parse_pending_upload(&body).unwrap();
        assert_eq!(blob, "https://acct.blob.core.windows.net/container");
        assert_eq!(sas.query(), Some("sig=x"));

        let missing = json!({ "blobReferenceForConsumption": { "blobUri": "x" } });
        assert!(matches!(
            parse_pending_upload(&missing),
            Err(PlatformError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_job_handle() {
        let body = json!({
            "name": "flow_20240101_000000_abcd1234",
            "properties": {
                "status": "Queued",
                "services": { "Studio": { "endpoint": "https://ml.azure.com/runs/x" } }
            }
        });
        let handle = parse_job_handle("requested", &body);
        assert_eq!(handle.name, "flow_20240101_000000_abcd1234");
        assert_eq!(handle.status, "Queued");
        assert_eq!(handle.studio_url.as_deref(), Some("https://ml.azure.com/runs/x"));

        let empty = parse_job_handle("requested", &Value::Null);
        assert_eq!(empty.name, "requested");
        assert_eq!(empty.status, "Unknown");
        assert!(empty.studio_url.is_none());
    }

    #[test]
    fn test_cached_version() {
        assert_eq!(cached_version("0123456789abcdef0123"), "0123456789abcdef");
        assert_eq!(cached_version("short"), "short");
    }

    #[test]
    fn test_compute_lookup_over_http() {
        let (endpoint, server) = serve(vec![(200, r#"{"name":"gpu"}"#), (404, "")]);
        let platform = platform(&endpoint);

        assert!(platform.compute_target_exists(&workspace(), "gpu").unwrap());
        assert!(!platform.compute_target_exists(&workspace(), "cpu").unwrap());

        let seen = server.join().unwrap();
        assert_eq!(
            seen[0],
            "GET /subscriptions/sub/resourceGroups/rg/providers/Microsoft.MachineLearningServices/workspaces/ws/computes/gpu?api-version=2023-04-01 HTTP/1.1"
        );
        assert!(seen[1].contains("/computes/cpu?"));
    }

    #[test]
    fn test_unauthorized_workspace_over_http() {
        let (endpoint, server) = serve(vec![(403, r#"{"error":{"code":"AuthorizationFailed"}}"#)]);
        let err = platform(&endpoint)
            .validate_workspace(&workspace())
            .unwrap_err();
        assert!(matches!(err, PlatformError::Unauthorized(body) if body.contains("AuthorizationFailed")));
        server.join().unwrap();
    }

    #[test]
    fn test_environment_hash_mismatch_is_not_reused() {
        let hash = "0123456789abcdef0123456789abcdef";
        let stale = r#"{"properties":{"condaFile":"","tags":{"elevation_content_hash":"ffffffffffffffff"}}}"#;
        let (endpoint, server) = serve(vec![(200, stale)]);

        let found = platform(&endpoint)
            .find_environment_by_hash(&workspace(), "env", hash)
            .unwrap();
        assert!(found.is_none());

        let seen = server.join().unwrap();
        assert!(seen[0].contains("/environments/env/versions/0123456789abcdef?"));
    }

    #[test]
    fn test_job_status_over_http() {
        let (endpoint, server) = serve(vec![
            (200, r#"{"properties":{"status":"Running"}}"#),
            (200, r#"{"properties":{}}"#),
            (500, "boom"),
        ]);
        let platform = platform(&endpoint);
        let ws = workspace();

        assert_eq!(platform.job_status(&ws, "job_1").unwrap(), "Running");
        assert!(matches!(
            platform.job_status(&ws, "job_1"),
            Err(PlatformError::InvalidResponse(_))
        ));
        assert!(matches!(
            platform.job_status(&ws, "job_1"),
            Err(PlatformError::Rejected { status: 500, .. })
        ));
        server.join().unwrap();
    }
}
