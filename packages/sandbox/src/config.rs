// ABOUTME: Environment-driven configuration for providers and the factory
// ABOUTME: CUBBY_* variable names as constants; constructors validate and fail fast

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::providers::{ProviderError, ProviderKind, Result};

/// Base routing domain instances get subdomains of.
pub const ENV_BASE_DOMAIN: &str = "CUBBY_BASE_DOMAIN";
/// Docker network shared with the host reverse proxy.
pub const ENV_DOCKER_NETWORK: &str = "CUBBY_DOCKER_NETWORK";
/// Default image for container instances.
pub const ENV_AGENT_IMAGE: &str = "CUBBY_AGENT_IMAGE";
/// Extra named daemon endpoints: `id=endpoint` pairs, comma separated.
pub const ENV_DOCKER_HOSTS: &str = "CUBBY_DOCKER_HOSTS";
/// Whether the host proxy terminates TLS for container instances.
pub const ENV_USE_TLS: &str = "CUBBY_USE_TLS";
pub const ENV_MICROVM_API_URL: &str = "CUBBY_MICROVM_API_URL";
pub const ENV_MICROVM_API_KEY: &str = "CUBBY_MICROVM_API_KEY";
pub const ENV_MICROVM_TERMINAL_TOKEN: &str = "CUBBY_MICROVM_TERMINAL_TOKEN";
/// Sandbox template the remote service boots instances from.
pub const ENV_MICROVM_TEMPLATE: &str = "CUBBY_MICROVM_TEMPLATE";
pub const ENV_MICROVM_TIMEOUT_SECS: &str = "CUBBY_MICROVM_TIMEOUT_SECS";
/// Backend used when a box record does not name one.
pub const ENV_DEFAULT_PROVIDER: &str = "CUBBY_DEFAULT_PROVIDER";

pub const DEFAULT_DOCKER_NETWORK: &str = "cubby-edge";
pub const DEFAULT_AGENT_IMAGE: &str = "cubbyhq/instance-base:latest";
pub const DEFAULT_MICROVM_TIMEOUT_SECS: u64 = 120;

/// Container-backend settings. Present iff the backend is configured.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Default daemon endpoint; `None` means the platform socket.
    pub endpoint: Option<String>,
    /// Named alternate daemons, keyed by host id.
    pub hosts: HashMap<String, String>,
    pub network: String,
    pub default_image: String,
    pub base_domain: String,
    pub use_tls: bool,
}

/// Remote-sandbox-service settings. Present iff the backend is configured.
#[derive(Debug, Clone)]
pub struct MicrovmConfig {
    pub api_url: String,
    pub api_key: String,
    /// Service-wide token for the proxied terminal.
    pub terminal_token: Option<String>,
    pub template: Option<String>,
    pub request_timeout: Duration,
}

/// Everything the factory needs to construct providers on demand.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub default_provider: ProviderKind,
    pub docker: Option<DockerConfig>,
    pub microvm: Option<MicrovmConfig>,
}

impl FactoryConfig {
    /// Assemble configuration from `CUBBY_*` environment variables.
    ///
    /// A backend is configured only when its required variables are set:
    /// the container backend needs `CUBBY_BASE_DOMAIN`, the remote one
    /// needs both the API URL and key. Invalid values fail here, not on
    /// first use.
    pub fn from_env() -> Result<Self> {
        let docker = match env::var(ENV_BASE_DOMAIN) {
            Ok(base_domain) if !base_domain.trim().is_empty() => Some(DockerConfig {
                endpoint: non_empty(env::var("DOCKER_HOST").ok()),
                hosts: parse_docker_hosts(env::var(ENV_DOCKER_HOSTS).ok().as_deref())?,
                network: env::var(ENV_DOCKER_NETWORK)
                    .unwrap_or_else(|_| DEFAULT_DOCKER_NETWORK.to_string()),
                default_image: env::var(ENV_AGENT_IMAGE)
                    .unwrap_or_else(|_| DEFAULT_AGENT_IMAGE.to_string()),
                base_domain: base_domain.trim().to_string(),
                use_tls: parse_bool(env::var(ENV_USE_TLS).ok().as_deref(), true),
            }),
            _ => None,
        };

        let microvm = match (env::var(ENV_MICROVM_API_URL), env::var(ENV_MICROVM_API_KEY)) {
            (Ok(api_url), Ok(api_key))
                if !api_url.trim().is_empty() && !api_key.trim().is_empty() =>
            {
                Some(MicrovmConfig {
                    api_url: api_url.trim().to_string(),
                    api_key: api_key.trim().to_string(),
                    terminal_token: non_empty(env::var(ENV_MICROVM_TERMINAL_TOKEN).ok()),
                    template: non_empty(env::var(ENV_MICROVM_TEMPLATE).ok()),
                    request_timeout: Duration::from_secs(parse_timeout(
                        env::var(ENV_MICROVM_TIMEOUT_SECS).ok().as_deref(),
                    )?),
                })
            }
            _ => None,
        };

        let default_provider = match env::var(ENV_DEFAULT_PROVIDER) {
            Ok(raw) => ProviderKind::from_str(&raw)?,
            Err(_) => ProviderKind::Docker,
        };

        Ok(Self {
            default_provider,
            docker,
            microvm,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw.map(str::trim) {
        None | Some("") => default,
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        Some(other) => {
            warn!(value = %other, "unrecognized boolean config value, using default");
            default
        }
    }
}

fn parse_timeout(raw: Option<&str>) -> Result<u64> {
    match raw.map(str::trim) {
        None | Some("") => Ok(DEFAULT_MICROVM_TIMEOUT_SECS),
        Some(value) => value.parse().map_err(|_| {
            ProviderError::Config(format!(
                "{} must be a number of seconds, got '{}'",
                ENV_MICROVM_TIMEOUT_SECS, value
            ))
        }),
    }
}

/// Parse `id=endpoint,id=endpoint` into a host map. Malformed pairs are a
/// configuration error, not a warning: silently dropping a host would send
/// instances to the wrong daemon.
fn parse_docker_hosts(raw: Option<&str>) -> Result<HashMap<String, String>> {
    let mut hosts = HashMap::new();
    let Some(raw) = raw else {
        return Ok(hosts);
    };

    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((id, endpoint)) = pair.split_once('=') else {
            return Err(ProviderError::Config(format!(
                "{} entry '{}' is not id=endpoint",
                ENV_DOCKER_HOSTS, pair
            )));
        };
        let (id, endpoint) = (id.trim(), endpoint.trim());
        if id.is_empty() || endpoint.is_empty() {
            return Err(ProviderError::Config(format!(
                "{} entry '{}' has an empty id or endpoint",
                ENV_DOCKER_HOSTS, pair
            )));
        }
        hosts.insert(id.to_string(), endpoint.to_string());
    }

    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_hosts() {
        let hosts = parse_docker_hosts(Some(
            "gpu-1=tcp://10.0.0.5:2376, gpu-2 = tcp://10.0.0.6:2376",
        ))
        .unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts.get("gpu-1").unwrap(), "tcp://10.0.0.5:2376");
        assert_eq!(hosts.get("gpu-2").unwrap(), "tcp://10.0.0.6:2376");
    }

    #[test]
    fn test_parse_docker_hosts_empty_and_none() {
        assert!(parse_docker_hosts(None).unwrap().is_empty());
        assert!(parse_docker_hosts(Some("")).unwrap().is_empty());
        assert!(parse_docker_hosts(Some(" , ")).unwrap().is_empty());
    }

    #[test]
    fn test_parse_docker_hosts_rejects_malformed() {
        assert!(parse_docker_hosts(Some("no-equals-sign")).is_err());
        assert!(parse_docker_hosts(Some("=tcp://x")).is_err());
        assert!(parse_docker_hosts(Some("id=")).is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool(Some("true"), false));
        assert!(parse_bool(Some("1"), false));
        assert!(!parse_bool(Some("no"), true));
        assert!(parse_bool(None, true));
        assert!(parse_bool(Some("maybe"), true));
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout(None).unwrap(), DEFAULT_MICROVM_TIMEOUT_SECS);
        assert_eq!(parse_timeout(Some("45")).unwrap(), 45);
        assert!(parse_timeout(Some("soon")).is_err());
    }
}
