// ABOUTME: HTTP client for the remote microVM sandbox service
// ABOUTME: Typed JSON requests, raw-byte file endpoints, line-streamed checkpoint ops

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::providers::{
    Checkpoint, ExecOptions, ExecResult, FileInfo, InstanceStatus, ProviderError, Result,
    UrlVisibility, WriteFileOptions,
};

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateSandboxRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub env_vars: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxDetail {
    pub name: String,
    pub status: String,
    pub url: Option<String>,
    #[serde(default)]
    pub terminal_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SandboxDetail {
    /// Map the service's raw status string onto the shared status set.
    /// Unknown states are surfaced as `Error` so they stay visible.
    pub fn instance_status(&self) -> InstanceStatus {
        match self.status.as_str() {
            "creating" | "starting" | "provisioning" => InstanceStatus::Creating,
            "running" => InstanceStatus::Running,
            "sleeping" | "suspended" => InstanceStatus::Sleeping,
            "stopped" | "terminated" => InstanceStatus::Stopped,
            other => {
                warn!(sandbox = %self.name, status = %other, "unknown sandbox status");
                InstanceStatus::Error
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SandboxListResponse {
    sandboxes: Vec<SandboxDetail>,
}

#[derive(Debug, Clone, Serialize)]
struct ExecRequest<'a> {
    argv: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<&'a HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExecResponse {
    exit_code: i64,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

impl From<ExecResponse> for ExecResult {
    fn from(resp: ExecResponse) -> Self {
        ExecResult {
            exit_code: resp.exit_code,
            stdout: resp.stdout,
            stderr: resp.stderr,
        }
    }
}

/// Error body the exec endpoint returns for non-zero exits. It still
/// carries the captured output, which must not be lost to a transport
/// error.
#[derive(Debug, Clone, Deserialize)]
struct ExecErrorBody {
    exit_code: Option<i64>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileListResponse {
    entries: Vec<FileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileEntry {
    name: String,
    path: String,
    is_dir: bool,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    modified_at: Option<DateTime<Utc>>,
}

impl From<FileEntry> for FileInfo {
    fn from(entry: FileEntry) -> Self {
        FileInfo {
            name: entry.name,
            path: entry.path,
            is_dir: entry.is_dir,
            size: entry.size,
            mode: entry.mode,
            modified_at: entry.modified_at,
        }
    }
}

/// Final line of the checkpoint create/restore streams.
#[derive(Debug, Clone, Deserialize)]
struct CheckpointStreamTail {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    size_bytes: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CheckpointListResponse {
    checkpoints: Vec<CheckpointEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct CheckpointEntry {
    id: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct UrlAuthRequest {
    visibility: UrlVisibility,
}

// ── Client ──────────────────────────────────────────────────────────

/// Typed client for the sandbox service REST API. Bearer auth on every
/// request; one client per configured service.
#[derive(Debug, Clone)]
pub struct MicrovmClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl MicrovmClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(ProviderError::Config(
                "microvm API URL must not be empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn create_sandbox(&self, req: &CreateSandboxRequest) -> Result<SandboxDetail> {
        info!(sandbox = %req.name, template = ?req.template, "creating sandbox");
        let resp = self
            .client
            .post(self.url("/sandboxes"))
            .bearer_auth(&self.api_key)
            .json(req)
            .send()
            .await?;
        let detail: SandboxDetail = check_status(resp).await?.json().await?;
        info!(sandbox = %detail.name, status = %detail.status, "sandbox created");
        Ok(detail)
    }

    /// Fetch one sandbox. Absence is `Ok(None)`.
    pub async fn get_sandbox(&self, name: &str) -> Result<Option<SandboxDetail>> {
        let resp = self
            .client
            .get(self.url(&format!("/sandboxes/{}", name)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check_status(resp).await?.json().await?))
    }

    pub async fn list_sandboxes(&self) -> Result<Vec<SandboxDetail>> {
        let resp = self
            .client
            .get(self.url("/sandboxes"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let list: SandboxListResponse = check_status(resp).await?.json().await?;
        Ok(list.sandboxes)
    }

    /// Delete a sandbox. Already gone (404) is success.
    pub async fn delete_sandbox(&self, name: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/sandboxes/{}", name)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            warn!(sandbox = %name, "sandbox already removed");
            return Ok(());
        }
        check_status(resp).await?;
        info!(sandbox = %name, "sandbox deleted");
        Ok(())
    }

    /// Run a bare argv inside the sandbox. The service reports non-zero
    /// exits as an error status whose body still carries the exec outcome;
    /// that shape is unwrapped back into a normal `ExecResult`.
    pub async fn exec(&self, name: &str, argv: &[String], opts: &ExecOptions) -> Result<ExecResult> {
        if argv.is_empty() {
            return Err(ProviderError::Exec("empty command".to_string()));
        }

        let req = ExecRequest {
            argv,
            working_dir: opts.working_dir.as_deref(),
            env: opts.env.as_ref(),
            timeout_secs: opts.timeout.map(|t| t.as_secs()),
        };

        let resp = self
            .client
            .post(self.url(&format!("/sandboxes/{}/exec", name)))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            let body: ExecResponse = resp.json().await?;
            return Ok(body.into());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(name.to_string()));
        }

        let text = resp.text().await.unwrap_or_default();
        if let Ok(body) = serde_json::from_str::<ExecErrorBody>(&text) {
            if let Some(exit_code) = body.exit_code {
                debug!(
                    sandbox = %name,
                    exit_code,
                    "exec reported non-zero exit via error response"
                );
                return Ok(ExecResult {
                    exit_code,
                    stdout: body.stdout,
                    stderr: body.stderr,
                });
            }
            if let Some(error) = body.error {
                return Err(ProviderError::Api {
                    status: status.as_u16(),
                    message: error,
                });
            }
        }
        Err(ProviderError::Api {
            status: status.as_u16(),
            message: text,
        })
    }

    pub async fn read_file(
        &self,
        name: &str,
        path: &str,
        working_dir: Option<&str>,
    ) -> Result<Vec<u8>> {
        let mut req = self
            .client
            .get(self.url(&format!("/sandboxes/{}/files", name)))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)]);
        if let Some(dir) = working_dir {
            req = req.query(&[("working_dir", dir)]);
        }

        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(format!("{}:{}", name, path)));
        }
        Ok(check_status(resp).await?.bytes().await?.to_vec())
    }

    pub async fn write_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        opts: &WriteFileOptions,
    ) -> Result<()> {
        let mut req = self
            .client
            .put(self.url(&format!("/sandboxes/{}/files", name)))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)])
            .query(&[("mkdir", opts.mkdir)]);
        if let Some(dir) = opts.working_dir.as_deref() {
            req = req.query(&[("working_dir", dir)]);
        }
        if let Some(mode) = opts.mode {
            req = req.query(&[("mode", format!("{:o}", mode))]);
        }

        let resp = req.body(content.to_vec()).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        check_status(resp).await?;
        debug!(sandbox = %name, path = %path, bytes = content.len(), "wrote file");
        Ok(())
    }

    /// Remove one file. Used for best-effort temp-script cleanup.
    pub async fn delete_file(&self, name: &str, path: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/sandboxes/{}/files", name)))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)])
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    pub async fn list_dir(&self, name: &str, path: &str) -> Result<Vec<FileInfo>> {
        let resp = self
            .client
            .get(self.url(&format!("/sandboxes/{}/files/list", name)))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(format!("{}:{}", name, path)));
        }
        let list: FileListResponse = check_status(resp).await?.json().await?;
        Ok(list.entries.into_iter().map(FileInfo::from).collect())
    }

    /// Create a checkpoint. The service streams line-delimited progress and
    /// only the final line carries the outcome, so the whole stream is
    /// drained before reporting success.
    pub async fn create_checkpoint(&self, name: &str) -> Result<Checkpoint> {
        info!(sandbox = %name, "creating checkpoint");
        let resp = self
            .client
            .post(self.url(&format!("/sandboxes/{}/checkpoints", name)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        let resp = check_status(resp).await?;

        let tail = drain_stream_tail(resp).await?;
        if let Some(error) = tail.error {
            return Err(ProviderError::Api {
                status: 500,
                message: error,
            });
        }
        let id = tail.id.ok_or_else(|| {
            ProviderError::Api {
                status: 500,
                message: "checkpoint stream ended without an id".to_string(),
            }
        })?;

        info!(sandbox = %name, checkpoint = %id, "checkpoint created");
        Ok(Checkpoint {
            id,
            instance_name: name.to_string(),
            created_at: tail.created_at,
            size_bytes: tail.size_bytes,
        })
    }

    pub async fn list_checkpoints(&self, name: &str) -> Result<Vec<Checkpoint>> {
        let resp = self
            .client
            .get(self.url(&format!("/sandboxes/{}/checkpoints", name)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        let list: CheckpointListResponse = check_status(resp).await?.json().await?;
        Ok(list
            .checkpoints
            .into_iter()
            .map(|c| Checkpoint {
                id: c.id,
                instance_name: name.to_string(),
                created_at: c.created_at,
                size_bytes: c.size_bytes,
            })
            .collect())
    }

    /// Restore a checkpoint. Streams like creation; drained the same way.
    pub async fn restore_checkpoint(&self, name: &str, checkpoint_id: &str) -> Result<()> {
        info!(sandbox = %name, checkpoint = %checkpoint_id, "restoring checkpoint");
        let resp = self
            .client
            .post(self.url(&format!(
                "/sandboxes/{}/checkpoints/{}/restore",
                name, checkpoint_id
            )))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(format!(
                "{}:{}",
                name, checkpoint_id
            )));
        }
        let resp = check_status(resp).await?;

        let tail = drain_stream_tail(resp).await?;
        if let Some(error) = tail.error {
            return Err(ProviderError::Api {
                status: 500,
                message: error,
            });
        }
        info!(sandbox = %name, checkpoint = %checkpoint_id, "checkpoint restored");
        Ok(())
    }

    pub async fn set_url_auth(&self, name: &str, visibility: UrlVisibility) -> Result<()> {
        let resp = self
            .client
            .post(self.url(&format!("/sandboxes/{}/auth", name)))
            .bearer_auth(&self.api_key)
            .json(&UrlAuthRequest { visibility })
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        check_status(resp).await?;
        info!(sandbox = %name, visibility = %visibility, "url auth updated");
        Ok(())
    }
}

/// Turn a non-success response into an `Api` error carrying the body text.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Drain a line-delimited progress stream and parse its last non-empty
/// line. Returning before the stream ends would report an outcome the
/// service has not committed yet.
async fn drain_stream_tail(resp: reqwest::Response) -> Result<CheckpointStreamTail> {
    let mut stream = resp.bytes_stream();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk?);
    }

    let text = String::from_utf8_lossy(&body);
    let last = text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| ProviderError::Api {
            status: 500,
            message: "empty checkpoint stream".to_string(),
        })?;

    Ok(serde_json::from_str(last)?)
}
