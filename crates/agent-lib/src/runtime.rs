//! Container resolution through the container runtime (CRI) API
//!
//! Maps a container ID to the host pid of its main process. The runtime is
//! reached over its unix socket; the query is a single `ContainerStatus` call
//! with verbose info, whose JSON payload carries the pid.

use crate::error::{ProfilerError, Result};
use crate::models::ProcessHandle;
use crate::proto::runtime::v1::{ContainerState, ContainerStatusRequest, ContainerStatusResponse};
use crate::proto::RuntimeServiceClient;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

/// Default containerd socket
pub const DEFAULT_RUNTIME_ENDPOINT: &str = "unix:///run/containerd/containerd.sock";

/// Trait for the container runtime status query
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verbose status of a single container
    async fn container_status(&self, container_id: &str) -> Result<ContainerStatusResponse>;
}

/// CRI client talking to the runtime over its unix socket
#[derive(Clone)]
pub struct CriRuntime {
    client: RuntimeServiceClient<Channel>,
    timeout: Duration,
}

impl CriRuntime {
    /// Create a client for `endpoint` (e.g. `unix:///run/containerd/containerd.sock`)
    ///
    /// The socket is dialled lazily so the agent can start before the runtime.
    pub fn connect_lazy(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let socket_path = socket_path(endpoint)?;
        info!(socket = %socket_path.display(), "Using container runtime endpoint");

        // The URI is ignored by the connector; every connection dials the socket.
        let channel = Endpoint::try_from("http://[::]:50051")?
            .timeout(timeout)
            .connect_with_connector_lazy(service_fn(move |_: Uri| {
                UnixStream::connect(socket_path.clone())
            }));

        Ok(Self {
            client: RuntimeServiceClient::new(channel),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ContainerRuntime for CriRuntime {
    async fn container_status(&self, container_id: &str) -> Result<ContainerStatusResponse> {
        let mut client = self.client.clone();
        let response = client
            .container_status(ContainerStatusRequest {
                container_id: container_id.to_string(),
                verbose: true,
            })
            .await?;
        Ok(response.into_inner())
    }
}

/// Parse a runtime endpoint into the socket path it names
pub fn socket_path(endpoint: &str) -> anyhow::Result<PathBuf> {
    let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
    if !path.starts_with('/') {
        anyhow::bail!("unsupported runtime endpoint {:?}: expected unix://<absolute path>", endpoint);
    }
    Ok(PathBuf::from(path))
}

/// The part of the verbose info payload we care about
#[derive(Debug, Deserialize)]
struct RuntimeInfo {
    #[serde(default)]
    pid: Option<i64>,
}

/// Resolves container IDs to host processes
pub struct ContainerResolver {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Resolve the main process of a running container
    ///
    /// Runtime API errors are returned unchanged; there is no retry.
    pub async fn resolve(&self, container_id: &str) -> Result<ProcessHandle> {
        let response = self.runtime.container_status(container_id).await?;

        let state = response
            .status
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(ContainerState::ContainerUnknown);
        if state != ContainerState::ContainerRunning {
            debug!(container_id = %container_id, state = state.as_str_name(), "Container is not running");
            return Err(ProfilerError::NotRunning {
                container_id: container_id.to_string(),
            });
        }

        let pid = extract_pid(container_id, &response)?;
        let handle = ProcessHandle::new(pid).ok_or_else(|| ProfilerError::InvalidPid {
            container_id: container_id.to_string(),
            pid,
        })?;

        debug!(container_id = %container_id, pid = handle.pid(), "Resolved container process");
        Ok(handle)
    }
}

/// Pull the pid out of the runtime-specific info payload
///
/// containerd and CRI-O both publish a JSON document with a top-level `pid`.
/// A payload that is not JSON is an error; a payload without a pid yields 0.
fn extract_pid(container_id: &str, response: &ContainerStatusResponse) -> Result<i64> {
    let mut keys: Vec<&String> = response.info.keys().collect();
    keys.sort();

    let mut pid = None;
    for key in keys {
        let info: RuntimeInfo =
            serde_json::from_str(&response.info[key]).map_err(|source| ProfilerError::RuntimeInfo {
                container_id: container_id.to_string(),
                source,
            })?;
        pid = pid.or(info.pid);
    }

    Ok(pid.unwrap_or(0))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::proto::runtime::v1::ContainerStatus;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory runtime keyed by container ID
    #[derive(Default)]
    pub struct FakeRuntime {
        containers: Mutex<HashMap<String, ContainerStatusResponse>>,
        calls: AtomicUsize,
        unavailable: AtomicBool,
    }

    impl FakeRuntime {
        pub fn with_container(self, id: &str, state: ContainerState, info: Option<&str>) -> Self {
            let mut response = ContainerStatusResponse {
                status: Some(ContainerStatus {
                    id: id.to_string(),
                    state: state as i32,
                    ..Default::default()
                }),
                info: HashMap::new(),
            };
            if let Some(info) = info {
                response.info.insert("info".to_string(), info.to_string());
            }
            self.containers.lock().unwrap().insert(id.to_string(), response);
            self
        }

        pub fn running(self, id: &str, pid: i64) -> Self {
            let info = format!(r#"{{"sandboxID":"abc","pid":{},"runtimeSpec":{{}}}}"#, pid);
            self.with_container(id, ContainerState::ContainerRunning, Some(&info))
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Make status queries fail as if the socket were down
        pub fn set_unavailable(&self, down: bool) {
            self.unavailable.store(down, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn container_status(&self, container_id: &str) -> Result<ContainerStatusResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(tonic::Status::unavailable("connection refused").into());
            }
            self.containers
                .lock()
                .unwrap()
                .get(container_id)
                .cloned()
                .ok_or_else(|| {
                    tonic::Status::not_found(format!("container {:?} not found", container_id))
                        .into()
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeRuntime;
    use super::*;
    use tonic::Code;

    fn resolver(runtime: FakeRuntime) -> ContainerResolver {
        ContainerResolver::new(Arc::new(runtime))
    }

    #[tokio::test]
    async fn test_resolve_running_container() {
        let resolver = resolver(FakeRuntime::default().running("c1", 4242));
        let handle = resolver.resolve("c1").await.unwrap();
        assert_eq!(handle.pid(), 4242);
    }

    #[tokio::test]
    async fn test_resolve_exited_container_is_not_running() {
        let runtime = FakeRuntime::default().with_container(
            "c1",
            ContainerState::ContainerExited,
            Some(r#"{"pid":4242}"#),
        );
        let err = resolver(runtime).resolve("c1").await.unwrap_err();

        assert!(matches!(err, ProfilerError::NotRunning { .. }));
        assert_eq!(err.to_string(), "\"c1\" container is not running");
    }

    #[tokio::test]
    async fn test_resolve_unknown_container_forwards_runtime_status() {
        let err = resolver(FakeRuntime::default()).resolve("missing").await.unwrap_err();
        let status: tonic::Status = err.into();

        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "container \"missing\" not found");
    }

    #[tokio::test]
    async fn test_resolve_missing_pid_is_internal() {
        let runtime =
            FakeRuntime::default().with_container("c1", ContainerState::ContainerRunning, None);
        let err = resolver(runtime).resolve("c1").await.unwrap_err();

        assert!(matches!(err, ProfilerError::InvalidPid { pid: 0, .. }));
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_resolve_garbage_info_is_internal() {
        let runtime = FakeRuntime::default().with_container(
            "c1",
            ContainerState::ContainerRunning,
            Some("not json"),
        );
        let err = resolver(runtime).resolve("c1").await.unwrap_err();

        assert!(matches!(err, ProfilerError::RuntimeInfo { .. }));
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn test_socket_path() {
        assert_eq!(
            socket_path(DEFAULT_RUNTIME_ENDPOINT).unwrap(),
            PathBuf::from("/run/containerd/containerd.sock")
        );
        assert_eq!(
            socket_path("/var/run/crio/crio.sock").unwrap(),
            PathBuf::from("/var/run/crio/crio.sock")
        );
        assert!(socket_path("tcp://10.0.0.1:1234").is_err());
    }
}
