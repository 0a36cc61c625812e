//! gRPC client for the node agent's Profile RPC

use anyhow::{Context, Result};
use perfscope_lib::proto::{PerfProfileResponse, ProfilerClient};
use perfscope_lib::ProfileRequest;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a finished profile was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileOutput {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Client for one agent
pub struct ProfilingClient {
    client: ProfilerClient<Channel>,
    timeout: Duration,
    grace: Duration,
}

impl ProfilingClient {
    /// Connect over plaintext HTTP/2 to `addr` (`ip:port`)
    ///
    /// The agent sends nothing while sampling, so keepalive pings wait for
    /// three times the sampling duration.
    pub async fn connect(addr: &str, timeout: Duration, grace: Duration) -> Result<Self> {
        let channel = Endpoint::from_shared(format!("http://{}", addr))
            .with_context(|| format!("invalid agent address {}", addr))?
            .connect_timeout(CONNECT_TIMEOUT)
            .http2_keep_alive_interval(timeout * 3)
            .connect()
            .await
            .with_context(|| format!("failed to connect to agent at {}", addr))?;

        info!(addr = %addr, "Connected to agent");
        Ok(Self {
            client: ProfilerClient::new(channel),
            timeout,
            grace,
        })
    }

    /// Profile `container_id` and write the trace to `<output_dir>/<pod_name>.script`
    pub async fn profile(
        &mut self,
        container_id: &str,
        pod_name: &str,
        output_dir: &Path,
    ) -> Result<ProfileOutput> {
        let wire = ProfileRequest {
            container_id: container_id.to_string(),
            timeout: self.timeout,
        }
        .to_proto();
        let mut request = Request::new(wire);
        request.set_timeout(self.timeout + self.grace);

        debug!(container_id = %container_id, timeout = ?self.timeout, "Sending profile request");
        let stream = self
            .client
            .profile(request)
            .await
            .context("agent rejected the profile request")?
            .into_inner();

        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("failed to create {}", output_dir.display()))?;
        let path = output_dir.join(format!("{}.script", pod_name));
        let bytes = write_stream(stream, &path).await?;

        Ok(ProfileOutput { path, bytes })
    }
}

/// Write every chunk of `stream` to `path`; the file is removed if the stream fails
pub async fn write_stream<S>(stream: S, path: &Path) -> Result<u64>
where
    S: Stream<Item = Result<PerfProfileResponse, Status>> + Unpin,
{
    let file = File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;

    match copy_chunks(stream, file).await {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            if let Err(remove_err) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %remove_err, "Failed to remove partial profile");
            }
            Err(e.context(format!("profile stream to {} failed", path.display())))
        }
    }
}

async fn copy_chunks<S>(mut stream: S, mut file: File) -> Result<u64>
where
    S: Stream<Item = Result<PerfProfileResponse, Status>> + Unpin,
{
    let mut written = 0u64;
    while let Some(message) = stream.next().await {
        let message = message?;
        file.write_all(&message.data).await?;
        written += message.data.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(data: &[u8]) -> Result<PerfProfileResponse, Status> {
        Ok(PerfProfileResponse {
            data: data.to_vec(),
        })
    }

    #[tokio::test]
    async fn test_write_stream_concatenates_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("web-0.script");
        let stream = tokio_stream::iter(vec![chunk(b"cycles:\n"), chunk(b"\tmain\n")]);

        let bytes = write_stream(stream, &path).await.unwrap();

        assert_eq!(bytes, 14);
        assert_eq!(std::fs::read(&path).unwrap(), b"cycles:\n\tmain\n");
    }

    #[tokio::test]
    async fn test_failed_stream_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("web-0.script");
        let stream = tokio_stream::iter(vec![
            chunk(b"cycles:\n"),
            Err(Status::failed_precondition(
                "profile data does not contain cpu samples",
            )),
        ]);

        let err = write_stream(stream, &path).await.unwrap_err();

        assert!(!path.exists());
        let status = err.root_cause().downcast_ref::<Status>().unwrap();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }
}
