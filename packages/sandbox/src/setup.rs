// ABOUTME: Ordered setup-step vocabulary and the fail-fast pipeline driver
// ABOUTME: Steps map config to commands elsewhere; the driver only sequences and reports

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};

use crate::providers::{ComputeProvider, Result};

/// The ordered vocabulary of instance setup. Order is part of the contract:
/// later steps assume the effects of earlier ones (services reference the
/// binary, the proxy config references registered services, and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetupStep {
    DownloadAgentBinary,
    CreateDataDirectories,
    WriteSkillFile,
    PersistEnvVars,
    WriteEnvFile,
    RegisterAgentService,
    InstallReverseProxyPackage,
    ConfigureReverseProxyService,
    CloneCompanionApp,
    InstallCompanionAppDependencies,
    RegisterCompanionAppService,
    RegisterToolRegistrations,
    JoinPrivateOverlayNetwork,
}

impl SetupStep {
    /// Every step in pipeline order.
    pub const ALL: [SetupStep; 13] = [
        SetupStep::DownloadAgentBinary,
        SetupStep::CreateDataDirectories,
        SetupStep::WriteSkillFile,
        SetupStep::PersistEnvVars,
        SetupStep::WriteEnvFile,
        SetupStep::RegisterAgentService,
        SetupStep::InstallReverseProxyPackage,
        SetupStep::ConfigureReverseProxyService,
        SetupStep::CloneCompanionApp,
        SetupStep::InstallCompanionAppDependencies,
        SetupStep::RegisterCompanionAppService,
        SetupStep::RegisterToolRegistrations,
        SetupStep::JoinPrivateOverlayNetwork,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            SetupStep::DownloadAgentBinary => "download-agent-binary",
            SetupStep::CreateDataDirectories => "create-data-directories",
            SetupStep::WriteSkillFile => "write-skill-file",
            SetupStep::PersistEnvVars => "persist-env-vars",
            SetupStep::WriteEnvFile => "write-env-file",
            SetupStep::RegisterAgentService => "register-agent-service",
            SetupStep::InstallReverseProxyPackage => "install-reverse-proxy-package",
            SetupStep::ConfigureReverseProxyService => "configure-reverse-proxy-service",
            SetupStep::CloneCompanionApp => "clone-companion-app",
            SetupStep::InstallCompanionAppDependencies => "install-companion-app-dependencies",
            SetupStep::RegisterCompanionAppService => "register-companion-app-service",
            SetupStep::RegisterToolRegistrations => "register-tool-registrations",
            SetupStep::JoinPrivateOverlayNetwork => "join-private-overlay-network",
        }
    }

    pub fn from_key(key: &str) -> Option<SetupStep> {
        SetupStep::ALL.iter().copied().find(|s| s.key() == key)
    }

    /// 1-based position in the pipeline. Resume bookkeeping persists these.
    pub fn ordinal(&self) -> usize {
        match self {
            SetupStep::DownloadAgentBinary => 1,
            SetupStep::CreateDataDirectories => 2,
            SetupStep::WriteSkillFile => 3,
            SetupStep::PersistEnvVars => 4,
            SetupStep::WriteEnvFile => 5,
            SetupStep::RegisterAgentService => 6,
            SetupStep::InstallReverseProxyPackage => 7,
            SetupStep::ConfigureReverseProxyService => 8,
            SetupStep::CloneCompanionApp => 9,
            SetupStep::InstallCompanionAppDependencies => 10,
            SetupStep::RegisterCompanionAppService => 11,
            SetupStep::RegisterToolRegistrations => 12,
            SetupStep::JoinPrivateOverlayNetwork => 13,
        }
    }

    pub fn from_ordinal(ordinal: usize) -> Option<SetupStep> {
        if ordinal == 0 {
            return None;
        }
        SetupStep::ALL.get(ordinal - 1).copied()
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// An extra companion service the caller wants registered inside the
/// instance (tool servers and similar sidecars).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub command: String,
    pub port: Option<u16>,
}

/// Inputs every step command is rendered from. A step is a pure function of
/// this config; running it is the provider's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupStepConfig {
    pub instance_name: String,
    pub step: SetupStep,
    pub agent_binary_url: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub public_url: String,
    #[serde(default)]
    pub extra_services: Vec<ServiceRegistration>,
}

/// The step-independent part of the setup config, used by the
/// whole-pipeline form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSetupConfig {
    pub instance_name: String,
    pub agent_binary_url: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub public_url: String,
    #[serde(default)]
    pub extra_services: Vec<ServiceRegistration>,
}

impl InstanceSetupConfig {
    pub fn for_step(&self, step: SetupStep) -> SetupStepConfig {
        SetupStepConfig {
            instance_name: self.instance_name.clone(),
            step,
            agent_binary_url: self.agent_binary_url.clone(),
            env_vars: self.env_vars.clone(),
            public_url: self.public_url.clone(),
            extra_services: self.extra_services.clone(),
        }
    }
}

/// Progress events for the whole-pipeline form. Sent from a single
/// sequential task, so a receiver observes them in execution order:
/// `Started(n)` never arrives after `Completed(n)`, and nothing for step
/// n+1 arrives before step n's terminal event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SetupProgress {
    Started { step: SetupStep },
    Completed { step: SetupStep },
    Failed { step: SetupStep, error: String },
}

/// Walks the full step list against one provider, fail-fast, no retries.
///
/// Steps are idempotent commands, so a failed run is recovered by fixing
/// the cause and resuming from the failed ordinal, never by rolling back.
pub struct SetupPipeline<'a> {
    provider: &'a dyn ComputeProvider,
}

impl<'a> SetupPipeline<'a> {
    pub fn new(provider: &'a dyn ComputeProvider) -> Self {
        Self { provider }
    }

    /// Run the pipeline. `resume_from` is a 1-based ordinal; steps with a
    /// strictly lower ordinal are logged as already completed and skipped
    /// without events. The first failing step aborts the run and its error
    /// carries the step key, exit code, and captured output.
    pub async fn run(
        &self,
        config: &InstanceSetupConfig,
        resume_from: Option<usize>,
        progress: Option<&UnboundedSender<SetupProgress>>,
    ) -> Result<()> {
        let first = resume_from.unwrap_or(1);
        info!(
            instance = %config.instance_name,
            resume_from = first,
            "running setup pipeline"
        );

        for step in SetupStep::ALL {
            if step.ordinal() < first {
                info!(
                    instance = %config.instance_name,
                    step = %step,
                    "setup step already completed, skipping"
                );
                continue;
            }

            if let Some(tx) = progress {
                let _ = tx.send(SetupProgress::Started { step });
            }

            match self.provider.run_setup_step(&config.for_step(step)).await {
                Ok(_) => {
                    info!(instance = %config.instance_name, step = %step, "setup step completed");
                    if let Some(tx) = progress {
                        let _ = tx.send(SetupProgress::Completed { step });
                    }
                }
                Err(err) => {
                    error!(
                        instance = %config.instance_name,
                        step = %step,
                        error = %err,
                        "setup step failed, aborting pipeline"
                    );
                    if let Some(tx) = progress {
                        let _ = tx.send(SetupProgress::Failed {
                            step,
                            error: err.to_string(),
                        });
                    }
                    return Err(err);
                }
            }
        }

        info!(instance = %config.instance_name, "setup pipeline completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_is_in_ordinal_order() {
        for (idx, step) in SetupStep::ALL.iter().enumerate() {
            assert_eq!(step.ordinal(), idx + 1);
        }
        assert_eq!(SetupStep::ALL.len(), 13);
    }

    #[test]
    fn test_key_round_trip() {
        for step in SetupStep::ALL {
            assert_eq!(SetupStep::from_key(step.key()), Some(step));
        }
        assert_eq!(SetupStep::from_key("make-coffee"), None);
    }

    #[test]
    fn test_serde_uses_kebab_case_keys() {
        for step in SetupStep::ALL {
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{}\"", step.key()));
            let back: SetupStep = serde_json::from_str(&json).unwrap();
            assert_eq!(back, step);
        }
    }

    #[test]
    fn test_from_ordinal_bounds() {
        assert_eq!(SetupStep::from_ordinal(0), None);
        assert_eq!(SetupStep::from_ordinal(1), Some(SetupStep::DownloadAgentBinary));
        assert_eq!(
            SetupStep::from_ordinal(13),
            Some(SetupStep::JoinPrivateOverlayNetwork)
        );
        assert_eq!(SetupStep::from_ordinal(14), None);
    }

    #[test]
    fn test_first_and_last_keys() {
        assert_eq!(SetupStep::ALL[0].key(), "download-agent-binary");
        assert_eq!(SetupStep::ALL[12].key(), "join-private-overlay-network");
    }

    #[test]
    fn test_for_step_copies_config() {
        let base = InstanceSetupConfig {
            instance_name: "user1-app".to_string(),
            agent_binary_url: "https://dl.example.com/agent".to_string(),
            env_vars: HashMap::new(),
            public_url: "https://app.boxes.example.com".to_string(),
            extra_services: vec![],
        };
        let cfg = base.for_step(SetupStep::WriteEnvFile);
        assert_eq!(cfg.step, SetupStep::WriteEnvFile);
        assert_eq!(cfg.instance_name, "user1-app");
        assert_eq!(cfg.public_url, base.public_url);
    }
}
