// ABOUTME: Composite HTTP health probes for a running instance
// ABOUTME: Agent endpoint and companion root, each under a short timeout; verdict is a bool

use std::time::Duration;
use tracing::{debug, info, warn};

/// Path the agent answers health checks on.
pub const AGENT_HEALTH_PATH: &str = "/healthz";
/// Per-probe timeout. Probes double as wake traffic for sleeping
/// instances, so this stays short.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Probes one instance's internal services over its public URL.
///
/// Expected failure modes (bad status, timeout, refused connection) are a
/// `false` verdict, never an error: periodic pollers treat "unhealthy" as
/// a normal outcome.
pub struct HealthChecker {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(PROBE_TIMEOUT)
    }
}

impl HealthChecker {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            // Builder only fails on TLS backend misconfiguration; fall back
            // to the default client rather than making construction fallible.
            client: reqwest::Client::builder()
                .timeout(probe_timeout)
                .build()
                .unwrap_or_default(),
            probe_timeout,
        }
    }

    /// Composite check: the agent health endpoint AND the companion app
    /// root must both look alive.
    pub async fn check(&self, instance: &str, instance_url: &str) -> bool {
        let base = instance_url.trim_end_matches('/');

        let agent_ok = self.probe_agent(instance, base).await;
        let app_ok = self.probe_companion(instance, base).await;
        let healthy = agent_ok && app_ok;

        if healthy {
            debug!(instance = %instance, "health check passed");
        } else {
            info!(
                instance = %instance,
                agent_ok,
                app_ok,
                "health check failed"
            );
        }
        healthy
    }

    /// Agent probe: only a 2xx from its health endpoint counts.
    async fn probe_agent(&self, instance: &str, base: &str) -> bool {
        let url = format!("{}{}", base, AGENT_HEALTH_PATH);
        match self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => {
                let ok = resp.status().is_success();
                if !ok {
                    warn!(
                        instance = %instance,
                        status = %resp.status(),
                        "agent health endpoint returned non-success"
                    );
                }
                ok
            }
            Err(e) => {
                warn!(instance = %instance, error = %e, "agent health probe failed");
                false
            }
        }
    }

    /// Companion probe: the app is alive unless it answers 5xx or the
    /// request fails outright. Redirects and auth walls (3xx/4xx) mean the
    /// process is up, which is all this probe asks.
    async fn probe_companion(&self, instance: &str, base: &str) -> bool {
        let url = format!("{}/", base);
        match self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => {
                let ok = !resp.status().is_server_error();
                if !ok {
                    warn!(
                        instance = %instance,
                        status = %resp.status(),
                        "companion app returned server error"
                    );
                }
                ok
            }
            Err(e) => {
                warn!(instance = %instance, error = %e, "companion app probe failed");
                false
            }
        }
    }
}
