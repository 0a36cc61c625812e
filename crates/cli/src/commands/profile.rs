//! The `profile` command: find the agent next to a pod and fetch a CPU profile

use anyhow::{bail, Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use perfscope_lib::MAX_PROFILE_TIMEOUT;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::client::ProfilingClient;
use crate::discovery::{ClusterApi, Discovery, KubeClusterApi};
use crate::output::{format_bytes, print_info, print_success};

/// Everything the command needs, resolved from flags and the config file
#[derive(Debug, Clone)]
pub struct ProfileArgs {
    pub pod: String,
    pub namespace: String,
    pub container: Option<String>,
    pub agent_namespace: String,
    pub timeout: Duration,
    pub grace: Duration,
    pub output_dir: PathBuf,
}

impl ProfileArgs {
    fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            bail!("--timeout must be positive");
        }
        if self.timeout > MAX_PROFILE_TIMEOUT {
            bail!(
                "--timeout {} exceeds the maximum of {}",
                humantime::format_duration(self.timeout),
                humantime::format_duration(MAX_PROFILE_TIMEOUT)
            );
        }
        Ok(())
    }
}

/// Build a cluster client from an explicit kubeconfig, or the default chain
pub async fn cluster_client(kubeconfig: Option<&str>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path))?;
            let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("invalid kubeconfig")?;
            Client::try_from(config).context("failed to create Kubernetes client")
        }
        None => Client::try_default()
            .await
            .context("failed to create Kubernetes client"),
    }
}

pub async fn run(kubeconfig: Option<&str>, args: ProfileArgs) -> Result<()> {
    args.validate()?;
    let client = cluster_client(kubeconfig).await?;
    let discovery = Discovery::new(KubeClusterApi::new(client), args.agent_namespace.clone());
    profile(&discovery, &args).await
}

async fn profile<C: ClusterApi>(discovery: &Discovery<C>, args: &ProfileArgs) -> Result<()> {
    let target = discovery.target(&args.namespace, &args.pod).await?;
    let container_id = target.container_id(args.container.as_deref())?;
    info!(pod = %args.pod, container_id = %container_id, "Resolved target container");

    let addr = discovery.locate_agent(&target).await?;
    let mut client = ProfilingClient::connect(&addr, args.timeout, args.grace).await?;

    print_info(&format!(
        "Profiling {}/{} for {}",
        args.namespace,
        args.pod,
        humantime::format_duration(args.timeout)
    ));
    let output = client
        .profile(&container_id, &args.pod, &args.output_dir)
        .await?;

    print_success(&format!(
        "Wrote {} ({})",
        output.path.display(),
        format_bytes(output.bytes)
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(timeout: Duration) -> ProfileArgs {
        ProfileArgs {
            pod: "web-0".to_string(),
            namespace: "default".to_string(),
            container: None,
            agent_namespace: "perfscope".to_string(),
            timeout,
            grace: Duration::from_secs(120),
            output_dir: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn test_timeout_bounds() {
        assert!(args(Duration::from_secs(30)).validate().is_ok());
        assert!(args(MAX_PROFILE_TIMEOUT).validate().is_ok());
        assert!(args(Duration::ZERO).validate().is_err());

        let err = args(Duration::from_secs(3600)).validate().unwrap_err();
        assert_eq!(err.to_string(), "--timeout 1h exceeds the maximum of 10m");
    }
}
