// ABOUTME: Compute provider contract shared by all sandbox backends
// ABOUTME: Defines the trait, shared wire types, capability records, and error taxonomy

pub mod docker;
pub mod microvm;

pub use docker::DockerProvider;
pub use microvm::MicrovmProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::setup::SetupStepConfig;

/// Errors surfaced by providers and backend clients.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Instance (or file within it) does not exist.
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// A setup step exited non-zero. Carries everything needed to diagnose
    /// the failure without re-running the step.
    #[error("Setup step '{step}' failed with exit code {exit_code} (stdout: {stdout}; stderr: {stderr})")]
    SetupStep {
        step: String,
        exit_code: i64,
        stdout: String,
        stderr: String,
    },

    /// Container engine transport or API error.
    #[error("Container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    /// Remote sandbox service answered with an error status.
    #[error("Sandbox API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// HTTP transport failure talking to the remote sandbox service.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Command execution failed for a reason other than a non-zero exit.
    #[error("Execution error: {0}")]
    Exec(String),

    /// Missing or invalid configuration. Raised at construction time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Results that return ProviderError
pub type Result<T> = std::result::Result<T, ProviderError>;

/// The closed set of sandbox backends. Dispatch over this enum is sealed:
/// adding a backend is a code change, never a runtime registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local container engine driven over its socket API.
    Docker,
    /// Remote microVM sandbox service driven over HTTP/JSON.
    Microvm,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Docker => "docker",
            ProviderKind::Microvm => "microvm",
        }
    }

    /// Capability record for this backend type. Fixed at compile time;
    /// callers branch on these flags instead of probing providers.
    pub fn capabilities(&self) -> ProviderCapabilities {
        match self {
            ProviderKind::Docker => ProviderCapabilities::DOCKER,
            ProviderKind::Microvm => ProviderCapabilities::MICROVM,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(ProviderKind::Docker),
            "microvm" => Ok(ProviderKind::Microvm),
            other => Err(ProviderError::Config(format!(
                "unknown provider kind '{}'",
                other
            ))),
        }
    }
}

/// What a backend type can do beyond the required contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Checkpoint create/list/restore.
    pub checkpoints: bool,
    /// Instances auto-sleep when idle and wake on traffic.
    pub sleep_wake: bool,
    /// Proxied terminal access (WebSocket) with a service token.
    pub ws_proxy: bool,
    /// Public/private toggling of the instance URL.
    pub url_auth: bool,
    /// Env-var updates take effect without re-provisioning.
    pub env_hot_reload: bool,
}

impl ProviderCapabilities {
    pub const DOCKER: Self = Self {
        checkpoints: false,
        sleep_wake: false,
        ws_proxy: false,
        url_auth: false,
        env_hot_reload: true,
    };

    pub const MICROVM: Self = Self {
        checkpoints: true,
        sleep_wake: true,
        ws_proxy: true,
        url_auth: true,
        env_hot_reload: true,
    };
}

/// Lifecycle state of an instance, normalized across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Running,
    Sleeping,
    Stopped,
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Sleeping => "sleeping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of one instance as the backend reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub status: InstanceStatus,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Inputs for creating an instance. The instance name is derived from
/// `user_id` and `subdomain`, never supplied directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceConfig {
    pub user_id: String,
    pub subdomain: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    /// Image / template override; providers fall back to their configured
    /// default.
    pub image: Option<String>,
    pub vcpus: Option<u32>,
    pub memory_mb: Option<u64>,
}

/// What creation hands back to the caller for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedInstance {
    pub instance_name: String,
    pub url: String,
}

/// Outcome of one executed command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Knobs for a single exec call.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub working_dir: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub timeout: Option<Duration>,
}

/// Knobs for writing a file into an instance.
#[derive(Debug, Clone, Default)]
pub struct WriteFileOptions {
    pub working_dir: Option<String>,
    /// Octal file mode, e.g. 0o755 for the temp scripts exec writes.
    pub mode: Option<u32>,
    /// Create missing parent directories first.
    pub mkdir: bool,
}

/// One directory entry from `list_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    /// Mode string as the backend reported it, e.g. "drwxr-xr-x".
    pub mode: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// A point-in-time snapshot of an instance (backends with the
/// `checkpoints` capability only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub instance_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
}

/// Who may reach the instance URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlVisibility {
    Public,
    Private,
}

impl fmt::Display for UrlVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlVisibility::Public => f.write_str("public"),
            UrlVisibility::Private => f.write_str("private"),
        }
    }
}

/// Common contract every sandbox backend implements.
///
/// Operations are keyed by the derived instance name; providers hold no
/// per-instance state beyond caches, so one provider instance serves every
/// box on its backend.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// The fixed capability record for this backend type.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Create (or return the already-existing) instance for this config.
    /// Idempotent: the derived name makes re-creation a lookup.
    async fn create_instance(&self, config: &CreateInstanceConfig) -> Result<CreatedInstance>;

    /// Remove an instance. An instance that is already gone is success,
    /// not an error: deletion is cleanup and cleanup must be rerunnable.
    async fn delete_instance(&self, name: &str) -> Result<()>;

    /// Look up one instance. Absence is `Ok(None)`, never an error.
    async fn get_instance(&self, name: &str) -> Result<Option<InstanceInfo>>;

    /// All instances this system manages on the backend.
    async fn list_instances(&self) -> Result<Vec<InstanceInfo>>;

    /// Run a bare argv inside the instance. No shell interpretation.
    async fn exec_command(
        &self,
        name: &str,
        argv: &[String],
        opts: &ExecOptions,
    ) -> Result<ExecResult>;

    /// Run a command string with full shell semantics (pipes, redirects,
    /// heredocs, `&&` chains).
    async fn exec_shell(&self, name: &str, command: &str) -> Result<ExecResult>;

    async fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>>;

    async fn write_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        opts: &WriteFileOptions,
    ) -> Result<()>;

    /// List a directory. Empty directory is `Ok(vec![])`; a missing one is
    /// an error. Entries never include `.` or `..`.
    async fn list_dir(&self, name: &str, path: &str) -> Result<Vec<FileInfo>>;

    /// Render and run a single setup step. Non-zero exit becomes
    /// `ProviderError::SetupStep` with the step key and captured output.
    async fn run_setup_step(&self, config: &SetupStepConfig) -> Result<ExecResult>;

    /// Composite liveness probe: the agent health endpoint and the
    /// companion app root, each under a short timeout. Expected failures
    /// (bad status, timeout, connection refused) are `false`, never an
    /// error.
    async fn check_health(&self, name: &str, instance_url: &str) -> bool;

    /// Read-merge-write the instance env file (updates win, nothing is
    /// dropped), then restart the agent service only.
    async fn update_env_vars(&self, name: &str, updates: &HashMap<String, String>) -> Result<()>;

    /// Public URL for the instance, if this provider tracks one. The
    /// container backend answers from its creation-time cache; the remote
    /// backend returns `None` because the caller's record is authoritative.
    async fn get_public_url(&self, name: &str) -> Option<String>;

    /// Checkpoint operations, present iff `capabilities().checkpoints`.
    fn checkpoint_ops(&self) -> Option<&dyn CheckpointOps> {
        None
    }

    /// URL visibility toggling, present iff `capabilities().url_auth`.
    fn url_auth_ops(&self) -> Option<&dyn UrlAuthOps> {
        None
    }

    /// Proxied terminal access, present iff `capabilities().ws_proxy`.
    fn proxy_ops(&self) -> Option<&dyn ProxyOps> {
        None
    }
}

impl fmt::Debug for dyn ComputeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeProvider")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Checkpoint create/list/restore for backends that snapshot instances.
#[async_trait]
pub trait CheckpointOps: Send + Sync {
    async fn create_checkpoint(&self, name: &str) -> Result<Checkpoint>;
    async fn list_checkpoints(&self, name: &str) -> Result<Vec<Checkpoint>>;
    async fn restore_checkpoint(&self, name: &str, checkpoint_id: &str) -> Result<()>;
}

/// Toggle whether an instance URL requires authentication.
#[async_trait]
pub trait UrlAuthOps: Send + Sync {
    async fn set_url_auth(&self, name: &str, visibility: UrlVisibility) -> Result<()>;
}

/// Proxied terminal access (WebSocket) for capable backends.
#[async_trait]
pub trait ProxyOps: Send + Sync {
    async fn proxy_url(&self, name: &str) -> Result<String>;
    fn proxy_token(&self) -> Result<String>;
}
