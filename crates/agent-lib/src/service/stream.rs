//! Chunked transfer of a symbolized trace to the caller
//!
//! A pump task reads the artifact in [`CHUNK_SIZE`] pieces and feeds them to
//! the response stream through a bounded channel. The task owns the artifact,
//! so the file is deleted once the last chunk is sent, a read fails or the
//! caller goes away.

use crate::error::{ProfilerError, Result};
use crate::models::CHUNK_SIZE;
use crate::observability::{AgentMetrics, StructuredLogger, PROFILE_METHOD};
use crate::proto::PerfProfileResponse;
use crate::sampler::Artifact;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Status};
use tracing::debug;

/// Chunks buffered ahead of the transport
const CHANNEL_DEPTH: usize = 16;

pub type ProfileStream = ReceiverStream<std::result::Result<PerfProfileResponse, Status>>;

/// Reads an artifact front to back in fixed-size chunks
///
/// Every chunk but the last is exactly `chunk_size` bytes; end of file yields
/// `None` rather than an error.
pub struct ArtifactChunks {
    file: File,
    chunk_size: usize,
    done: bool,
}

impl ArtifactChunks {
    pub async fn open(artifact: &Artifact, chunk_size: usize) -> Result<Self> {
        let file = File::open(artifact.path())
            .await
            .map_err(|e| ProfilerError::artifact("failed to open", artifact.path(), e))?;
        Ok(Self {
            file,
            chunk_size,
            done: false,
        })
    }

    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.file.read(&mut chunk[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        chunk.truncate(filled);
        Ok(Some(chunk))
    }
}

/// Call bookkeeping finished by the pump task
pub(crate) struct CallRecord {
    pub container_id: String,
    pub started: Instant,
    pub metrics: AgentMetrics,
    pub logger: StructuredLogger,
}

impl CallRecord {
    fn finish(&self, result: std::result::Result<usize, Status>) {
        let elapsed = self.started.elapsed();
        match result {
            Ok(bytes_sent) => {
                self.metrics.rpc_handled(PROFILE_METHOD, Code::Ok, elapsed);
                self.logger
                    .log_profile_finished(&self.container_id, bytes_sent, elapsed);
            }
            Err(status) => {
                self.metrics.rpc_handled(PROFILE_METHOD, status.code(), elapsed);
                self.logger
                    .log_profile_failed(&self.container_id, status.code(), status.message());
            }
        }
    }
}

/// Start streaming `artifact` and hand back the response stream
pub(crate) async fn stream_artifact(artifact: Artifact, call: CallRecord) -> Result<ProfileStream> {
    let mut chunks = ArtifactChunks::open(&artifact, CHUNK_SIZE).await?;
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

    tokio::spawn(async move {
        // Owned here so the file outlives every read and is removed afterwards
        let artifact = artifact;
        let mut sent = 0usize;

        let result = loop {
            match chunks.next_chunk().await {
                Ok(Some(data)) => {
                    let len = data.len();
                    if tx.send(Ok(PerfProfileResponse { data })).await.is_err() {
                        debug!(path = %artifact.path().display(), "Caller went away mid-stream");
                        break Err(Status::cancelled("caller went away mid-stream"));
                    }
                    sent += len;
                    call.metrics.add_bytes_sent(len);
                }
                Ok(None) => break Ok(sent),
                Err(e) => {
                    let status: Status =
                        ProfilerError::artifact("failed to read", artifact.path(), e).into();
                    // The caller may already be gone; the status is still recorded
                    let _ = tx.send(Err(status.clone())).await;
                    break Err(status);
                }
            }
        };

        call.finish(result);
        drop(artifact);
    });

    Ok(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ArtifactKind;
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    fn call(metrics: &AgentMetrics) -> CallRecord {
        CallRecord {
            container_id: "c1".to_string(),
            started: Instant::now(),
            metrics: metrics.clone(),
            logger: StructuredLogger::new("test-node"),
        }
    }

    fn script(dir: &TempDir, len: usize) -> (Artifact, Vec<u8>) {
        let path = dir.path().join("x.data.script");
        let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();
        (Artifact::new(path, ArtifactKind::SymbolizedScript), content)
    }

    #[tokio::test]
    async fn test_chunks_are_fixed_size_and_ordered() {
        let dir = TempDir::new().unwrap();
        let (artifact, content) = script(&dir, 2500);

        let mut chunks = ArtifactChunks::open(&artifact, CHUNK_SIZE).await.unwrap();
        let mut sizes = Vec::new();
        let mut joined = Vec::new();
        while let Some(chunk) = chunks.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
            joined.extend(chunk);
        }

        assert_eq!(sizes, vec![1024, 1024, 452]);
        assert_eq!(joined, content);
        assert!(chunks.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_artifact_yields_no_chunks() {
        let dir = TempDir::new().unwrap();
        let (artifact, _) = script(&dir, 0);

        let mut chunks = ArtifactChunks::open(&artifact, CHUNK_SIZE).await.unwrap();
        assert!(chunks.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_sends_everything_then_deletes() {
        let dir = TempDir::new().unwrap();
        let (artifact, content) = script(&dir, 3 * CHUNK_SIZE);
        let path = artifact.path().to_path_buf();
        let metrics = AgentMetrics::new();

        let stream = stream_artifact(artifact, call(&metrics)).await.unwrap();
        let received: Vec<_> = stream.collect().await;

        let mut joined = Vec::new();
        for item in received {
            joined.extend(item.unwrap().data);
        }
        assert_eq!(joined, content);
        assert_eq!(metrics.bytes_sent(), content.len() as u64);

        // The pump task drops the artifact right after the channel closes
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!path.exists());
        assert_eq!(metrics.handled_count(PROFILE_METHOD, Code::Ok), 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_still_deletes_artifact() {
        let dir = TempDir::new().unwrap();
        let (artifact, _) = script(&dir, 64 * CHUNK_SIZE);
        let path = artifact.path().to_path_buf();
        let metrics = AgentMetrics::new();

        let mut stream = stream_artifact(artifact, call(&metrics)).await.unwrap();
        assert!(stream.next().await.is_some());
        drop(stream);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!path.exists());
        assert_eq!(metrics.handled_count(PROFILE_METHOD, Code::Cancelled), 1);
    }
}
