// ABOUTME: Provider factory with a (kind, host id) keyed cache
// ABOUTME: Lazy construction, fail-fast Config errors, box-record dispatch

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::FactoryConfig;
use crate::container::ContainerClient;
use crate::providers::{
    ComputeProvider, DockerProvider, MicrovmProvider, ProviderError, ProviderKind, Result,
};

/// The slice of the caller's persisted row the factory dispatches on.
#[derive(Debug, Clone)]
pub struct BoxRecord {
    pub instance_name: String,
    /// Backend the box was created on; `None` means the configured default.
    pub provider: Option<ProviderKind>,
    /// Named daemon for container boxes pinned to a specific host.
    pub host_id: Option<String>,
}

type CacheKey = (ProviderKind, Option<String>);

/// Resolves and caches one provider per `(kind, host id)`.
///
/// Providers are constructed lazily on first request and kept for the life
/// of the factory. Construction happens under the write lock, so two
/// concurrent first requests for the same key build exactly one provider.
pub struct ProviderFactory {
    config: FactoryConfig,
    cache: RwLock<HashMap<CacheKey, Arc<dyn ComputeProvider>>>,
}

impl ProviderFactory {
    pub fn new(config: FactoryConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Factory configured straight from `CUBBY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(FactoryConfig::from_env()?))
    }

    /// Get (or construct) the provider for a backend. An unconfigured
    /// backend is a `Config` error: the caller asked for something ops
    /// never wired up.
    pub async fn get_provider(
        &self,
        kind: ProviderKind,
        host_id: Option<&str>,
    ) -> Result<Arc<dyn ComputeProvider>> {
        let key: CacheKey = (kind, host_id.map(String::from));

        if let Some(provider) = self.cache.read().await.get(&key) {
            return Ok(provider.clone());
        }

        let mut cache = self.cache.write().await;
        // Double-check: another caller may have built it while we waited.
        if let Some(provider) = cache.get(&key) {
            return Ok(provider.clone());
        }

        let provider = self.build_provider(kind, host_id).await?;
        cache.insert(key, provider.clone());
        info!(provider = %kind, host = host_id.unwrap_or("default"), "provider initialized");
        Ok(provider)
    }

    /// Provider for a persisted box record, defaulting to the configured
    /// backend when the record does not name one.
    pub async fn provider_for_box(&self, record: &BoxRecord) -> Result<Arc<dyn ComputeProvider>> {
        let kind = record.provider.unwrap_or(self.config.default_provider);
        debug!(
            instance = %record.instance_name,
            provider = %kind,
            "resolving provider for box"
        );
        self.get_provider(kind, record.host_id.as_deref()).await
    }

    /// Whether a backend is configured. Reflects configuration only; no
    /// network calls.
    pub fn is_provider_available(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::Docker => self.config.docker.is_some(),
            ProviderKind::Microvm => self.config.microvm.is_some(),
        }
    }

    pub fn available_providers(&self) -> Vec<ProviderKind> {
        [ProviderKind::Docker, ProviderKind::Microvm]
            .into_iter()
            .filter(|kind| self.is_provider_available(*kind))
            .collect()
    }

    pub fn default_provider(&self) -> ProviderKind {
        self.config.default_provider
    }

    async fn build_provider(
        &self,
        kind: ProviderKind,
        host_id: Option<&str>,
    ) -> Result<Arc<dyn ComputeProvider>> {
        match kind {
            ProviderKind::Docker => {
                let config = self.config.docker.as_ref().ok_or_else(|| {
                    ProviderError::Config(
                        "docker backend is not configured (set CUBBY_BASE_DOMAIN)".to_string(),
                    )
                })?;

                let endpoint = match host_id {
                    Some(id) => Some(config.hosts.get(id).map(String::as_str).ok_or_else(
                        || {
                            ProviderError::Config(format!(
                                "unknown docker host id '{}' (configure it in CUBBY_DOCKER_HOSTS)",
                                id
                            ))
                        },
                    )?),
                    None => config.endpoint.as_deref(),
                };

                let client = ContainerClient::connect(endpoint).await?;
                Ok(Arc::new(DockerProvider::new(client, config.clone())))
            }
            ProviderKind::Microvm => {
                let config = self.config.microvm.as_ref().ok_or_else(|| {
                    ProviderError::Config(
                        "microvm backend is not configured (set CUBBY_MICROVM_API_URL and \
                         CUBBY_MICROVM_API_KEY)"
                            .to_string(),
                    )
                })?;
                Ok(Arc::new(MicrovmProvider::new(config.clone())?))
            }
        }
    }
}
