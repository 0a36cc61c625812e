//! Locating the agent that shares a node with a target pod
//!
//! Agents run one per node. A pod is profiled by the agent on its own node,
//! found by matching host IPs between the target pod and the agent pods.
//! Nothing is cached: pods move between calls.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use perfscope_lib::{agent_label_selector, DEFAULT_GRPC_PORT, GRPC_PORT_NAME};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Errors from the cluster API, unchanged
    #[error(transparent)]
    Cluster(#[from] kube::Error),

    #[error("pod {0} is not ready")]
    PodNotReady(String),

    #[error("pod {0} has no host IP; is it scheduled?")]
    MissingHostIp(String),

    #[error("container {container:?} not found in pod {pod}")]
    ContainerNotFound { pod: String, container: String },

    #[error("container {container:?} in pod {pod} has no container ID yet")]
    MissingContainerId { pod: String, container: String },

    #[error(
        "no co-resident agent: no pod matching {selector} in namespace {namespace} runs on host {host_ip}; \
         is the agent scheduled on this node?"
    )]
    NoCoResidentAgent {
        host_ip: String,
        namespace: String,
        selector: String,
    },
}

/// Snapshot of the pod being profiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPodRecord {
    pub name: String,
    pub namespace: String,
    pub host_ip: Option<String>,
    pub ready: bool,
    /// Container names in spec order
    pub containers: Vec<String>,
    /// (container name, runtime-prefixed container ID)
    pub container_statuses: Vec<(String, Option<String>)>,
}

impl From<&Pod> for TargetPodRecord {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
            .map(|c| c.status == "True")
            .unwrap_or(false);

        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            host_ip: status.and_then(|s| s.host_ip.clone()).filter(|ip| !ip.is_empty()),
            ready,
            containers: pod
                .spec
                .as_ref()
                .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
            container_statuses: status
                .and_then(|s| s.container_statuses.as_ref())
                .map(|statuses| {
                    statuses
                        .iter()
                        .map(|cs| (cs.name.clone(), cs.container_id.clone()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

impl TargetPodRecord {
    /// Runtime container ID of `container`, or of the first container when unset
    pub fn container_id(&self, container: Option<&str>) -> Result<String, DiscoveryError> {
        let name = match container {
            Some(name) => name,
            None => self.containers.first().map(String::as_str).ok_or_else(|| {
                DiscoveryError::ContainerNotFound {
                    pod: self.name.clone(),
                    container: String::new(),
                }
            })?,
        };

        let (_, id) = self
            .container_statuses
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| DiscoveryError::ContainerNotFound {
                pod: self.name.clone(),
                container: name.to_string(),
            })?;

        id.as_deref()
            .map(strip_runtime_prefix)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| DiscoveryError::MissingContainerId {
                pod: self.name.clone(),
                container: name.to_string(),
            })
    }
}

/// Snapshot of one agent pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub pod_name: String,
    pub host_ip: Option<String>,
    pub pod_ip: Option<String>,
    pub declared_port: Option<u16>,
}

impl From<&Pod> for AgentRecord {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let declared_port = pod
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .flat_map(|c| c.ports.iter().flatten())
            .find(|p| p.name.as_deref() == Some(GRPC_PORT_NAME))
            .and_then(|p| u16::try_from(p.container_port).ok());

        Self {
            pod_name: pod.metadata.name.clone().unwrap_or_default(),
            host_ip: status.and_then(|s| s.host_ip.clone()),
            pod_ip: status.and_then(|s| s.pod_ip.clone()).filter(|ip| !ip.is_empty()),
            declared_port,
        }
    }
}

impl AgentRecord {
    /// `podIP:port`, using the declared port when present
    pub fn address(&self) -> Option<String> {
        let pod_ip = self.pod_ip.as_deref()?;
        let port = self.declared_port.unwrap_or(DEFAULT_GRPC_PORT);
        Some(match pod_ip.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port).to_string(),
            Err(_) => format!("{}:{}", pod_ip, port),
        })
    }
}

/// Read-only cluster queries used by discovery
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, kube::Error>;
}

pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.get(name).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }
}

pub struct Discovery<C> {
    cluster: C,
    agent_namespace: String,
}

impl<C: ClusterApi> Discovery<C> {
    pub fn new(cluster: C, agent_namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            agent_namespace: agent_namespace.into(),
        }
    }

    /// Fetch the target pod; it must be ready to be profiled
    pub async fn target(&self, namespace: &str, name: &str) -> Result<TargetPodRecord, DiscoveryError> {
        let pod = self.cluster.get_pod(namespace, name).await?;
        let record = TargetPodRecord::from(&pod);
        if !record.ready {
            return Err(DiscoveryError::PodNotReady(record.name));
        }
        Ok(record)
    }

    /// Address of the agent on the target's node
    pub async fn locate_agent(&self, target: &TargetPodRecord) -> Result<String, DiscoveryError> {
        let host_ip = target
            .host_ip
            .as_deref()
            .ok_or_else(|| DiscoveryError::MissingHostIp(target.name.clone()))?;

        let selector = agent_label_selector();
        let pods = self.cluster.list_pods(&self.agent_namespace, &selector).await?;
        let agents: Vec<AgentRecord> = pods.iter().map(AgentRecord::from).collect();
        debug!(namespace = %self.agent_namespace, count = agents.len(), "Listed agent pods");

        let addr = select_agent_address(&agents, host_ip).ok_or_else(|| {
            DiscoveryError::NoCoResidentAgent {
                host_ip: host_ip.to_string(),
                namespace: self.agent_namespace.clone(),
                selector,
            }
        })?;
        info!(host_ip = %host_ip, addr = %addr, "Found co-resident agent");
        Ok(addr)
    }
}

/// Address of the agent whose host IP equals `host_ip`
///
/// Agents without a pod IP are skipped. When several match, the first wins.
pub fn select_agent_address(agents: &[AgentRecord], host_ip: &str) -> Option<String> {
    let mut matching = agents
        .iter()
        .filter(|a| a.host_ip.as_deref() == Some(host_ip))
        .filter_map(|a| a.address().map(|addr| (a, addr)));

    let (agent, addr) = matching.next()?;
    if let Some((other, _)) = matching.next() {
        warn!(
            host_ip = %host_ip,
            chosen = %agent.pod_name,
            other = %other.pod_name,
            "More than one agent on the node"
        );
    }
    Some(addr)
}

/// Kubernetes reports container IDs with a runtime prefix:
/// - `containerd://abc123def456...`
/// - `docker://abc123def456...`
/// - `cri-o://abc123def456...`
///
/// The runtime API expects the bare ID.
pub fn strip_runtime_prefix(id: &str) -> &str {
    id.find("://").map(|i| &id[i + 3..]).unwrap_or(id)
}
