//! Observability infrastructure for the profiling agent
//!
//! Provides:
//! - Prometheus metrics (per-method call counts and latency, sampling sessions in flight, bytes streamed)
//! - A tower layer recording those per-method metrics for every gRPC service
//! - Structured JSON logging with tracing

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tonic::codegen::{http, BoxFuture, Service};
use tonic::Code;
use tower::Layer;
use tracing::{info, warn};

/// Histogram buckets for call latency (in seconds); calls span up to the 10 minute sampling cap
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.05, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0,
];

/// Full gRPC method name of the Profile call
pub const PROFILE_METHOD: &str = "/perfscope.v1.Profiler/Profile";

/// Agent metrics for Prometheus exposition
///
/// Clones share the same underlying registry and metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    rpc_started: IntCounterVec,
    rpc_handled: IntCounterVec,
    rpc_handling_seconds: HistogramVec,
    sampling_in_flight: IntGauge,
    profile_bytes_sent: IntCounter,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create the metrics and register them on a fresh registry
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
            .expect("metric definitions are static and registered once per registry")
    }

    /// Register the metrics on an existing registry
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let rpc_started = IntCounterVec::new(
            Opts::new(
                "perfscope_rpc_started_total",
                "Total number of RPCs started on the server",
            ),
            &["method"],
        )?;
        let rpc_handled = IntCounterVec::new(
            Opts::new(
                "perfscope_rpc_handled_total",
                "Total number of RPCs completed on the server, regardless of success or failure",
            ),
            &["method", "code"],
        )?;
        let rpc_handling_seconds = HistogramVec::new(
            HistogramOpts::new(
                "perfscope_rpc_handling_seconds",
                "Time from call start until the last response byte was sent",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["method"],
        )?;
        let sampling_in_flight = IntGauge::new(
            "perfscope_sampling_in_flight",
            "Number of sampling sessions currently holding admission capacity",
        )?;
        let profile_bytes_sent = IntCounter::new(
            "perfscope_profile_bytes_sent_total",
            "Total bytes of symbolized trace streamed to callers",
        )?;

        registry.register(Box::new(rpc_started.clone()))?;
        registry.register(Box::new(rpc_handled.clone()))?;
        registry.register(Box::new(rpc_handling_seconds.clone()))?;
        registry.register(Box::new(sampling_in_flight.clone()))?;
        registry.register(Box::new(profile_bytes_sent.clone()))?;

        Ok(Self {
            registry,
            rpc_started,
            rpc_handled,
            rpc_handling_seconds,
            sampling_in_flight,
            profile_bytes_sent,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn rpc_started(&self, method: &str) {
        self.rpc_started.with_label_values(&[method]).inc();
    }

    /// Record the outcome and duration of a finished call
    pub fn rpc_handled(&self, method: &str, code: Code, elapsed: Duration) {
        self.rpc_handled
            .with_label_values(&[method, code_name(code)])
            .inc();
        self.rpc_handling_seconds
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    }

    pub fn handled_count(&self, method: &str, code: Code) -> u64 {
        self.rpc_handled
            .with_label_values(&[method, code_name(code)])
            .get()
    }

    pub fn sampling_started(&self) {
        self.sampling_in_flight.inc();
    }

    pub fn sampling_finished(&self) {
        self.sampling_in_flight.dec();
    }

    pub fn sampling_in_flight(&self) -> i64 {
        self.sampling_in_flight.get()
    }

    pub fn add_bytes_sent(&self, bytes: usize) {
        self.profile_bytes_sent.inc_by(bytes as u64);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.profile_bytes_sent.get()
    }
}

/// Status code names as used by the gRPC ecosystem's server metrics
fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// Records call counts and latency for every method served behind it
///
/// The Profile call reports itself once its stream ends, so it passes through
/// untouched here.
#[derive(Clone)]
pub struct RpcMetricsLayer {
    metrics: AgentMetrics,
}

impl RpcMetricsLayer {
    pub fn new(metrics: AgentMetrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for RpcMetricsLayer {
    type Service = RpcMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcMetrics {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RpcMetrics<S> {
    inner: S,
    metrics: AgentMetrics,
}

impl<S, B, ResBody> Service<http::Request<B>> for RpcMetrics<S>
where
    S: Service<http::Request<B>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let method = req.uri().path().to_string();
        if method == PROFILE_METHOD {
            return Box::pin(self.inner.call(req));
        }

        let metrics = self.metrics.clone();
        metrics.rpc_started(&method);
        let started = Instant::now();
        let response = self.inner.call(req);
        Box::pin(async move {
            let result = response.await;
            let code = match &result {
                Ok(response) => header_code(response.headers()),
                Err(_) => Code::Unknown,
            };
            metrics.rpc_handled(&method, code, started.elapsed());
            result
        })
    }
}

/// Status of a unary response; failures arrive trailers-only, with the status in the headers
fn header_code(headers: &http::HeaderMap) -> Code {
    headers
        .get("grpc-status")
        .map(|value| Code::from_bytes(value.as_bytes()))
        .unwrap_or(Code::Ok)
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for profile calls
/// and agent lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, grpc_addr: &str, metrics_addr: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            grpc_addr = %grpc_addr,
            metrics_addr = %metrics_addr,
            "Profiling agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Profiling agent shutting down"
        );
    }

    /// Log an admitted sampling session
    pub fn log_profile_started(&self, container_id: &str, pid: u32, timeout: Duration) {
        info!(
            event = "profile_started",
            node = %self.node_name,
            container_id = %container_id,
            pid = pid,
            timeout_secs = timeout.as_secs_f64(),
            "Start profiling"
        );
    }

    /// Log a fully streamed profile
    pub fn log_profile_finished(&self, container_id: &str, bytes_sent: usize, elapsed: Duration) {
        info!(
            event = "profile_finished",
            node = %self.node_name,
            container_id = %container_id,
            bytes_sent = bytes_sent,
            elapsed_secs = elapsed.as_secs_f64(),
            "Profile streamed"
        );
    }

    /// Log a failed call; caller mistakes are logged below warning level
    pub fn log_profile_failed(&self, container_id: &str, code: Code, error: &str) {
        match code {
            Code::InvalidArgument | Code::FailedPrecondition | Code::Cancelled => {
                info!(
                    event = "profile_failed",
                    node = %self.node_name,
                    container_id = %container_id,
                    code = code_name(code),
                    error = %error,
                    "Profile call rejected"
                );
            }
            _ => {
                warn!(
                    event = "profile_failed",
                    node = %self.node_name,
                    container_id = %container_id,
                    code = code_name(code),
                    error = %error,
                    "Profile call failed"
                );
            }
        }
    }
}
