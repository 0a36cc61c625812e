//! Agent configuration

use anyhow::{bail, Context, Result};
use perfscope_lib::admission::DEFAULT_MAX_CONCURRENCY;
use perfscope_lib::runtime::{socket_path, DEFAULT_RUNTIME_ENDPOINT};
use perfscope_lib::{DEFAULT_GRPC_PORT, DEFAULT_METRICS_PORT, MAX_PROFILE_TIMEOUT};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration, read from `PERFSCOPE_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port serving the Profile RPC and gRPC health
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,

    /// Port serving /healthz, /readyz and /metrics
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Container runtime socket
    #[serde(default = "default_runtime_endpoint")]
    pub runtime_endpoint: String,

    /// Directory for temporary raw traces and scripts
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Sampling sessions allowed to run at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Longest sampling window a caller may ask for, in seconds
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    /// perf binary name or path
    #[serde(default = "default_perf_binary")]
    pub perf_binary: String,

    /// Timeout for container runtime queries, in seconds
    #[serde(default = "default_runtime_timeout_secs")]
    pub runtime_timeout_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_grpc_port() -> u16 {
    DEFAULT_GRPC_PORT
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_runtime_endpoint() -> String {
    DEFAULT_RUNTIME_ENDPOINT.to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/perfscope")
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_max_timeout_secs() -> u64 {
    MAX_PROFILE_TIMEOUT.as_secs()
}

fn default_perf_binary() -> String {
    "perf".to_string()
}

fn default_runtime_timeout_secs() -> u64 {
    30
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix("PERFSCOPE").try_parsing(true))
            .build()?;
        Self::from_source(source)
    }

    fn from_source(source: config::Config) -> Result<Self> {
        let config: AgentConfig = source
            .try_deserialize()
            .context("invalid PERFSCOPE_* configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.grpc_port == self.metrics_port {
            bail!(
                "grpc_port and metrics_port must differ (both are {})",
                self.grpc_port
            );
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.max_timeout_secs == 0 {
            bail!("max_timeout_secs must be positive");
        }
        if !self.work_dir.is_absolute() {
            bail!("work_dir must be absolute, got {}", self.work_dir.display());
        }
        socket_path(&self.runtime_endpoint)?;
        Ok(())
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_timeout_secs)
    }
}
