// ABOUTME: Compute providers for per-tenant agent sandboxes
// ABOUTME: One contract over a container engine and a remote microVM service

pub mod commands;
pub mod config;
pub mod container;
pub mod envfile;
pub mod factory;
pub mod health;
pub mod microvm;
pub mod names;
pub mod providers;
pub mod routing;
pub mod setup;

pub use config::{DockerConfig, FactoryConfig, MicrovmConfig};
pub use factory::{BoxRecord, ProviderFactory};
pub use health::HealthChecker;
pub use names::instance_name;
pub use providers::{
    Checkpoint, CheckpointOps, ComputeProvider, CreateInstanceConfig, CreatedInstance,
    DockerProvider, ExecOptions, ExecResult, FileInfo, InstanceInfo, InstanceStatus,
    MicrovmProvider, ProviderCapabilities, ProviderError, ProviderKind, ProxyOps, Result,
    UrlAuthOps, UrlVisibility, WriteFileOptions,
};
pub use setup::{
    InstanceSetupConfig, ServiceRegistration, SetupPipeline, SetupProgress, SetupStep,
    SetupStepConfig,
};
