//! The node-agent Profile RPC
//!
//! A call moves through validation, container resolution, admission, sampling
//! and streaming. Sampling runs on its own task tied to the call through a
//! cancellation token: when the transport drops the call, the token fires and
//! the sampling tool is killed. Admission capacity is handed back as soon as
//! sampling finishes, before any bytes are streamed.

mod stream;

pub use stream::{ArtifactChunks, ProfileStream};

use crate::admission::Admission;
use crate::error::{ProfilerError, Result};
use crate::health::HealthRegistry;
use crate::models::ProfileRequest;
use crate::observability::{AgentMetrics, StructuredLogger, PROFILE_METHOD};
use crate::proto::{PerfProfileRequest, Profiler};
use crate::runtime::ContainerResolver;
use crate::sampler::{Artifact, PerfExecutor};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream::{stream_artifact, CallRecord};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::debug;

pub struct ProfilerService {
    resolver: ContainerResolver,
    admission: Admission,
    executor: Arc<PerfExecutor>,
    max_timeout: Duration,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl ProfilerService {
    pub fn new(
        resolver: ContainerResolver,
        admission: Admission,
        executor: PerfExecutor,
        max_timeout: Duration,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            resolver,
            admission,
            executor: Arc::new(executor),
            max_timeout,
            metrics,
            logger,
            health: None,
        }
    }

    /// Report runtime reachability observed by calls on `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Validate, resolve, admit and sample; returns the symbolized script
    async fn sample(&self, req: &ProfileRequest) -> Result<Artifact> {
        let process = self.resolve(&req.container_id).await?;

        // Fires when this future is dropped, i.e. when the caller goes away
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let ticket = self.admission.acquire(&cancel).await?;
        self.logger
            .log_profile_started(&req.container_id, process.pid(), req.timeout);

        let executor = Arc::clone(&self.executor);
        let timeout = req.timeout;
        let worker = tokio::spawn(async move {
            let _ticket = ticket;
            let raw = executor.record(process, timeout, &cancel).await?;
            executor.symbolize(&raw, &cancel).await
        });

        worker
            .await
            .map_err(|e| ProfilerError::Worker(e.to_string()))?
    }

    async fn resolve(&self, container_id: &str) -> Result<crate::models::ProcessHandle> {
        let result = self.resolver.resolve(container_id).await;
        if let Some(health) = &self.health {
            let failure = match &result {
                Err(ProfilerError::Runtime(status)) => Some(status),
                _ => None,
            };
            health.observe_runtime(failure).await;
        }
        result
    }

    fn failed(&self, container_id: &str, started: Instant, err: ProfilerError) -> Status {
        let status: Status = err.into();
        self.metrics
            .rpc_handled(PROFILE_METHOD, status.code(), started.elapsed());
        self.logger
            .log_profile_failed(container_id, status.code(), status.message());
        status
    }
}

#[async_trait]
impl Profiler for ProfilerService {
    type ProfileStream = ProfileStream;

    async fn profile(
        &self,
        request: Request<PerfProfileRequest>,
    ) -> std::result::Result<Response<Self::ProfileStream>, Status> {
        let started = Instant::now();
        self.metrics.rpc_started(PROFILE_METHOD);

        let wire = request.into_inner();
        let req = match ProfileRequest::from_proto(&wire, self.max_timeout) {
            Ok(req) => req,
            Err(err) => return Err(self.failed(&wire.container_id, started, err)),
        };
        debug!(container_id = %req.container_id, timeout = ?req.timeout, "Profile request accepted");

        let script = match self.sample(&req).await {
            Ok(script) => script,
            Err(err) => return Err(self.failed(&req.container_id, started, err)),
        };

        let call = CallRecord {
            container_id: req.container_id.clone(),
            started,
            metrics: self.metrics.clone(),
            logger: self.logger.clone(),
        };
        match stream_artifact(script, call).await {
            Ok(stream) => Ok(Response::new(stream)),
            Err(err) => Err(self.failed(&req.container_id, started, err)),
        }
    }
}
