// ABOUTME: Remote microVM provider implementing the ComputeProvider contract
// ABOUTME: Shell semantics via the render-as-script strategy; checkpoint/url-auth/proxy ops

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::{step_command, CommandFlavor, AGENT_ENV_PATH, AGENT_SERVICE};
use crate::config::MicrovmConfig;
use crate::envfile::{self, InstanceLocks};
use crate::health::HealthChecker;
use crate::microvm::{CreateSandboxRequest, MicrovmClient};
use crate::names::instance_name;
use crate::providers::{
    Checkpoint, CheckpointOps, ComputeProvider, CreateInstanceConfig, CreatedInstance,
    ExecOptions, ExecResult, FileInfo, InstanceInfo, ProviderCapabilities, ProviderError,
    ProviderKind, ProxyOps, Result, UrlAuthOps, UrlVisibility, WriteFileOptions,
};
use crate::setup::SetupStepConfig;

/// Characters that demand shell interpretation. Anything else is split
/// into a plain argv and handed to the exec primitive directly.
const SHELL_METACHARS: &[char] = &[
    '|', '&', ';', '<', '>', '(', ')', '$', '`', '\\', '"', '\'', '*', '?', '[', ']', '{', '}',
    '~', '#', '\n',
];

/// Provider over the remote sandbox service's HTTP API.
pub struct MicrovmProvider {
    client: MicrovmClient,
    config: MicrovmConfig,
    locks: InstanceLocks,
    health: HealthChecker,
}

impl MicrovmProvider {
    pub fn new(config: MicrovmConfig) -> Result<Self> {
        let client = MicrovmClient::new(&config.api_url, &config.api_key, config.request_timeout)?;
        Ok(Self {
            client,
            config,
            locks: InstanceLocks::new(),
            health: HealthChecker::default(),
        })
    }

    /// Run a command with shell semantics on a backend whose exec primitive
    /// only takes a bare argv: write the command to a temp script, exec the
    /// script path, then best-effort delete it.
    async fn exec_via_script(&self, name: &str, command: &str) -> Result<ExecResult> {
        let (body, path) = render_as_script(command);
        self.client
            .write_file(
                name,
                &path,
                body.as_bytes(),
                &WriteFileOptions {
                    mode: Some(0o755),
                    mkdir: true,
                    ..Default::default()
                },
            )
            .await?;

        let result = self
            .client
            .exec(name, &[path.clone()], &ExecOptions::default())
            .await;

        // Cleanup must never mask the command's own outcome.
        if let Err(e) = self.client.delete_file(name, &path).await {
            debug!(sandbox = %name, script = %path, error = %e, "temp script cleanup failed");
        }

        result
    }
}

/// Wrap a shell command into an executable script body and a unique temp
/// path inside the sandbox.
pub fn render_as_script(command: &str) -> (String, String) {
    let body = format!("#!/bin/bash\nset -euo pipefail\n{}\n", command);
    let path = format!("/tmp/.cubby-exec-{}.sh", Uuid::new_v4());
    (body, path)
}

/// Does this command need a shell, or can it run as a bare argv?
/// `export` and inline `VAR=value` prefixes are shell builtins/syntax even
/// though they contain no other metacharacters.
pub fn needs_shell(command: &str) -> bool {
    if command.contains(SHELL_METACHARS) {
        return true;
    }
    match command.trim_start().split_whitespace().next() {
        Some(first) => first == "export" || first.contains('='),
        None => false,
    }
}

#[async_trait]
impl ComputeProvider for MicrovmProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Microvm
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::MICROVM
    }

    async fn create_instance(&self, config: &CreateInstanceConfig) -> Result<CreatedInstance> {
        let name = instance_name(&config.user_id, &config.subdomain);

        if let Some(existing) = self.client.get_sandbox(&name).await? {
            info!(instance = %name, "sandbox already exists, returning it");
            let url = existing.url.ok_or_else(|| {
                ProviderError::Api {
                    status: 500,
                    message: format!("existing sandbox '{}' has no URL", name),
                }
            })?;
            return Ok(CreatedInstance {
                instance_name: name,
                url,
            });
        }

        let detail = self
            .client
            .create_sandbox(&CreateSandboxRequest {
                name: name.clone(),
                template: config.image.clone().or_else(|| self.config.template.clone()),
                env_vars: config.env_vars.clone(),
                vcpus: config.vcpus,
                memory_mb: config.memory_mb,
            })
            .await?;

        let url = detail.url.ok_or_else(|| ProviderError::Api {
            status: 500,
            message: format!("created sandbox '{}' has no URL", name),
        })?;
        info!(instance = %name, url = %url, "instance created");

        Ok(CreatedInstance {
            instance_name: name,
            url,
        })
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.client.delete_sandbox(name).await
    }

    async fn get_instance(&self, name: &str) -> Result<Option<InstanceInfo>> {
        Ok(self.client.get_sandbox(name).await?.map(|detail| {
            let status = detail.instance_status();
            InstanceInfo {
                name: detail.name,
                status,
                url: detail.url,
                created_at: detail.created_at,
                updated_at: detail.updated_at,
            }
        }))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        Ok(self
            .client
            .list_sandboxes()
            .await?
            .into_iter()
            .map(|detail| {
                let status = detail.instance_status();
                InstanceInfo {
                    name: detail.name,
                    status,
                    url: detail.url,
                    created_at: detail.created_at,
                    updated_at: detail.updated_at,
                }
            })
            .collect())
    }

    async fn exec_command(
        &self,
        name: &str,
        argv: &[String],
        opts: &ExecOptions,
    ) -> Result<ExecResult> {
        self.client.exec(name, argv, opts).await
    }

    async fn exec_shell(&self, name: &str, command: &str) -> Result<ExecResult> {
        if !needs_shell(command) {
            let argv: Vec<String> = command.split_whitespace().map(String::from).collect();
            return self.client.exec(name, &argv, &ExecOptions::default()).await;
        }
        self.exec_via_script(name, command).await
    }

    async fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        self.client.read_file(name, path, None).await
    }

    async fn write_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        opts: &WriteFileOptions,
    ) -> Result<()> {
        self.client.write_file(name, path, content, opts).await
    }

    async fn list_dir(&self, name: &str, path: &str) -> Result<Vec<FileInfo>> {
        self.client.list_dir(name, path).await
    }

    async fn run_setup_step(&self, config: &SetupStepConfig) -> Result<ExecResult> {
        let command = step_command(CommandFlavor::Microvm, config);
        debug!(
            instance = %config.instance_name,
            step = %config.step,
            "running setup step"
        );

        let result = self.exec_shell(&config.instance_name, &command).await?;
        if !result.success() {
            return Err(ProviderError::SetupStep {
                step: config.step.key().to_string(),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    async fn check_health(&self, name: &str, instance_url: &str) -> bool {
        self.health.check(name, instance_url).await
    }

    async fn update_env_vars(&self, name: &str, updates: &HashMap<String, String>) -> Result<()> {
        let _guard = self.locks.acquire(name).await;

        let existing = match self.client.read_file(name, AGENT_ENV_PATH, None).await {
            Ok(bytes) => envfile::parse_env_file(&String::from_utf8_lossy(&bytes)),
            Err(ProviderError::NotFound(_)) => Default::default(),
            Err(e) => return Err(e),
        };

        let merged = envfile::merge_env(&existing, updates);
        let body = envfile::serialize_env_file(&merged);
        self.client
            .write_file(
                name,
                AGENT_ENV_PATH,
                body.as_bytes(),
                &WriteFileOptions {
                    mode: Some(0o600),
                    mkdir: true,
                    ..Default::default()
                },
            )
            .await?;

        let argv = vec![
            "systemctl".to_string(),
            "restart".to_string(),
            AGENT_SERVICE.to_string(),
        ];
        let restart = self.client.exec(name, &argv, &ExecOptions::default()).await?;
        if !restart.success() {
            return Err(ProviderError::Exec(format!(
                "agent service restart failed with exit code {}: {}",
                restart.exit_code, restart.stderr
            )));
        }

        info!(instance = %name, keys = updates.len(), "env vars updated, agent restarted");
        Ok(())
    }

    /// The caller's box record holds the authoritative URL for remote
    /// sandboxes; nothing is cached here.
    async fn get_public_url(&self, _name: &str) -> Option<String> {
        None
    }

    fn checkpoint_ops(&self) -> Option<&dyn CheckpointOps> {
        Some(self)
    }

    fn url_auth_ops(&self) -> Option<&dyn UrlAuthOps> {
        Some(self)
    }

    fn proxy_ops(&self) -> Option<&dyn ProxyOps> {
        Some(self)
    }
}

#[async_trait]
impl CheckpointOps for MicrovmProvider {
    async fn create_checkpoint(&self, name: &str) -> Result<Checkpoint> {
        self.client.create_checkpoint(name).await
    }

    async fn list_checkpoints(&self, name: &str) -> Result<Vec<Checkpoint>> {
        self.client.list_checkpoints(name).await
    }

    async fn restore_checkpoint(&self, name: &str, checkpoint_id: &str) -> Result<()> {
        self.client.restore_checkpoint(name, checkpoint_id).await
    }
}

#[async_trait]
impl UrlAuthOps for MicrovmProvider {
    async fn set_url_auth(&self, name: &str, visibility: UrlVisibility) -> Result<()> {
        self.client.set_url_auth(name, visibility).await
    }
}

#[async_trait]
impl ProxyOps for MicrovmProvider {
    async fn proxy_url(&self, name: &str) -> Result<String> {
        let detail = self
            .client
            .get_sandbox(name)
            .await?
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;
        detail.terminal_url.ok_or_else(|| {
            warn!(sandbox = %name, "sandbox detail carries no terminal URL");
            ProviderError::Api {
                status: 500,
                message: format!("sandbox '{}' has no terminal URL", name),
            }
        })
    }

    fn proxy_token(&self) -> Result<String> {
        self.config.terminal_token.clone().ok_or_else(|| {
            ProviderError::Config(format!(
                "terminal token not configured (set {})",
                crate::config::ENV_MICROVM_TERMINAL_TOKEN
            ))
        })
    }
}
