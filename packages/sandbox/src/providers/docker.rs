// ABOUTME: Container-engine provider implementing the ComputeProvider contract
// ABOUTME: Routing labels at creation, provider-owned URL cache, container-flavored setup steps

use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, ContainerSummary};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::commands::{step_command, CommandFlavor, AGENT_ENV_PATH, AGENT_SERVICE, INSTANCE_HTTP_PORT};
use crate::config::DockerConfig;
use crate::container::{ContainerClient, ContainerSpec};
use crate::envfile::{self, InstanceLocks};
use crate::health::HealthChecker;
use crate::names::{instance_name, subdomain_label};
use crate::providers::{
    ComputeProvider, CreateInstanceConfig, CreatedInstance, ExecOptions, ExecResult, FileInfo,
    InstanceInfo, InstanceStatus, ProviderCapabilities, ProviderError, ProviderKind, Result,
    WriteFileOptions,
};
use crate::routing::{proxy_labels, RouteSpec};
use crate::setup::SetupStepConfig;

/// Label marking containers this system owns. `list_instances` filters on
/// it so foreign containers never leak into results.
pub const MANAGED_LABEL: &str = "cubby.managed";
pub const INSTANCE_LABEL: &str = "cubby.instance";
pub const USER_LABEL: &str = "cubby.user";
pub const SUBDOMAIN_LABEL: &str = "cubby.subdomain";

/// Provider over a local (or named remote) container engine daemon.
pub struct DockerProvider {
    client: ContainerClient,
    config: DockerConfig,
    /// Instance name → public URL, recorded at creation. The engine cannot
    /// recover the URL later, so this cache is the only source for
    /// `get_public_url`.
    url_cache: RwLock<HashMap<String, String>>,
    locks: InstanceLocks,
    health: HealthChecker,
}

impl DockerProvider {
    pub fn new(client: ContainerClient, config: DockerConfig) -> Self {
        Self {
            client,
            config,
            url_cache: RwLock::new(HashMap::new()),
            locks: InstanceLocks::new(),
            health: HealthChecker::default(),
        }
    }

    fn route_for(&self, name: &str, subdomain: &str) -> RouteSpec {
        RouteSpec {
            service_name: name.to_string(),
            subdomain: subdomain_label(subdomain),
            base_domain: self.config.base_domain.clone(),
            port: INSTANCE_HTTP_PORT,
            network: self.config.network.clone(),
            use_tls: self.config.use_tls,
        }
    }

    fn url_from_labels(&self, labels: Option<&HashMap<String, String>>) -> Option<String> {
        let subdomain = labels?.get(SUBDOMAIN_LABEL)?;
        let scheme = if self.config.use_tls { "https" } else { "http" };
        Some(format!(
            "{}://{}.{}",
            scheme, subdomain, self.config.base_domain
        ))
    }

    async fn instance_url(
        &self,
        name: &str,
        labels: Option<&HashMap<String, String>>,
    ) -> Option<String> {
        if let Some(url) = self.url_cache.read().await.get(name) {
            return Some(url.clone());
        }
        self.url_from_labels(labels)
    }

    async fn info_from_inspect(
        &self,
        name: &str,
        inspect: &ContainerInspectResponse,
    ) -> InstanceInfo {
        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| map_inspect_status(name, s))
            .unwrap_or(InstanceStatus::Error);

        let labels = inspect.config.as_ref().and_then(|c| c.labels.as_ref());
        let created_at = inspect
            .created
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        InstanceInfo {
            name: name.to_string(),
            status,
            url: self.instance_url(name, labels).await,
            created_at,
            updated_at: None,
        }
    }
}

#[async_trait]
impl ComputeProvider for DockerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::DOCKER
    }

    async fn create_instance(&self, config: &CreateInstanceConfig) -> Result<CreatedInstance> {
        let name = instance_name(&config.user_id, &config.subdomain);
        let route = self.route_for(&name, &config.subdomain);
        let url = route.public_url();

        if self.client.inspect_container(&name).await?.is_some() {
            info!(instance = %name, "instance already exists, returning it");
            self.url_cache.write().await.insert(name.clone(), url.clone());
            return Ok(CreatedInstance {
                instance_name: name,
                url,
            });
        }

        let mut labels: HashMap<String, String> = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (INSTANCE_LABEL.to_string(), name.clone()),
            (USER_LABEL.to_string(), config.user_id.clone()),
            (SUBDOMAIN_LABEL.to_string(), route.subdomain.clone()),
        ]);
        labels.extend(proxy_labels(&route));

        let spec = ContainerSpec {
            image: config
                .image
                .clone()
                .unwrap_or_else(|| self.config.default_image.clone()),
            cmd: None,
            env_vars: config.env_vars.clone(),
            labels,
            network: self.config.network.clone(),
            vcpus: config.vcpus,
            memory_mb: config.memory_mb,
        };

        self.client.create_container(&name, &spec).await?;
        self.url_cache.write().await.insert(name.clone(), url.clone());
        info!(instance = %name, url = %url, "instance created");

        Ok(CreatedInstance {
            instance_name: name,
            url,
        })
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.client.remove_container(name).await?;
        self.url_cache.write().await.remove(name);
        Ok(())
    }

    async fn get_instance(&self, name: &str) -> Result<Option<InstanceInfo>> {
        match self.client.inspect_container(name).await? {
            Some(inspect) => Ok(Some(self.info_from_inspect(name, &inspect).await)),
            None => Ok(None),
        }
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        let containers = self.client.list_containers(&[(MANAGED_LABEL, "true")]).await?;

        let mut instances = Vec::with_capacity(containers.len());
        for summary in containers {
            if let Some(info) = self.info_from_summary(&summary).await {
                instances.push(info);
            }
        }
        Ok(instances)
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
        self.client.exec_shell(name, command).await
    }

    async fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        self.client.read_file(name, path).await
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
        let command = step_command(CommandFlavor::Container, config);
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

        let existing = match self.read_file(name, AGENT_ENV_PATH).await {
            Ok(bytes) => envfile::parse_env_file(&String::from_utf8_lossy(&bytes)),
            Err(ProviderError::NotFound(_)) => Default::default(),
            Err(e) => return Err(e),
        };

        let merged = envfile::merge_env(&existing, updates);
        let body = envfile::serialize_env_file(&merged);
        self.write_file(
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

        let restart = self
            .exec_shell(name, &format!("systemctl restart {}", AGENT_SERVICE))
            .await?;
        if !restart.success() {
            return Err(ProviderError::Exec(format!(
                "agent service restart failed with exit code {}: {}",
                restart.exit_code, restart.stderr
            )));
        }

        info!(instance = %name, keys = updates.len(), "env vars updated, agent restarted");
        Ok(())
    }

    async fn get_public_url(&self, name: &str) -> Option<String> {
        self.url_cache.read().await.get(name).cloned()
    }
}

impl DockerProvider {
    async fn info_from_summary(&self, summary: &ContainerSummary) -> Option<InstanceInfo> {
        let name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())?;

        let status = summary
            .state
            .as_deref()
            .map(|s| map_summary_status(&name, s))
            .unwrap_or(InstanceStatus::Error);

        let url = self.instance_url(&name, summary.labels.as_ref()).await;
        let created_at = summary
            .created
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        Some(InstanceInfo {
            name,
            status,
            url,
            created_at,
            updated_at: None,
        })
    }
}

fn map_inspect_status(name: &str, status: ContainerStateStatusEnum) -> InstanceStatus {
    match status {
        ContainerStateStatusEnum::CREATED | ContainerStateStatusEnum::RESTARTING => {
            InstanceStatus::Creating
        }
        ContainerStateStatusEnum::RUNNING => InstanceStatus::Running,
        ContainerStateStatusEnum::PAUSED => InstanceStatus::Sleeping,
        ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::REMOVING => {
            InstanceStatus::Stopped
        }
        ContainerStateStatusEnum::DEAD => InstanceStatus::Error,
        other => {
            warn!(instance = %name, status = %other, "unknown container status");
            InstanceStatus::Error
        }
    }
}

fn map_summary_status(name: &str, state: &str) -> InstanceStatus {
    match state.to_ascii_lowercase().as_str() {
        "created" | "restarting" => InstanceStatus::Creating,
        "running" => InstanceStatus::Running,
        "paused" => InstanceStatus::Sleeping,
        "exited" | "removing" => InstanceStatus::Stopped,
        "dead" => InstanceStatus::Error,
        other => {
            warn!(instance = %name, status = %other, "unknown container state");
            InstanceStatus::Error
        }
    }
}
