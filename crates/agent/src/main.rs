//! perfscope agent - on-demand container CPU profiler
//!
//! This binary runs as a DaemonSet on each Kubernetes node and serves the
//! Profile RPC for containers scheduled on that node.

use anyhow::{Context, Result};
use perfscope_lib::{
    admission::Admission,
    health::{Component, HealthRegistry},
    observability::{AgentMetrics, RpcMetricsLayer, StructuredLogger},
    proto::ProfilerServer,
    runtime::{ContainerResolver, CriRuntime},
    sampler::{locate_binary, PerfExecutor, TokioProcessRunner},
    service::ProfilerService,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod workdir;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting perfscope-agent");

    let config = config::AgentConfig::load()?;
    info!(node_name = %config.node_name, work_dir = %config.work_dir.display(), "Agent configured");

    let health_registry = HealthRegistry::new();

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    // Metrics and health come up first so probes can see why startup fails
    let shutdown = CancellationToken::new();
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(api::serve(config.metrics_port, app_state, async move {
        api_shutdown.cancelled().await
    }));

    if let Err(e) = workdir::prepare(&config.work_dir) {
        health_registry
            .mark_failed(Component::WorkDir, e.to_string())
            .await;
        return Err(e);
    }

    let Some(perf_binary) = locate_binary(&config.perf_binary) else {
        let message = format!("{} not found", config.perf_binary);
        health_registry
            .mark_failed(Component::Sampler, message.clone())
            .await;
        anyhow::bail!(message);
    };
    info!(perf = %perf_binary.display(), "Found sampling tool");

    let runtime = CriRuntime::connect_lazy(&config.runtime_endpoint, config.runtime_timeout())
        .context("failed to set up container runtime client")?;

    let service = ProfilerService::new(
        ContainerResolver::new(Arc::new(runtime)),
        Admission::new(config.max_concurrency).with_metrics(metrics.clone()),
        PerfExecutor::new(
            Arc::new(TokioProcessRunner),
            perf_binary,
            config.work_dir.clone(),
        ),
        config.max_timeout(),
        metrics.clone(),
        logger.clone(),
    )
    .with_health(health_registry.clone());

    let (mut health_reporter, grpc_health) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<ProfilerServer<ProfilerService>>()
        .await;

    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.grpc_port));
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    logger.log_startup(AGENT_VERSION, &grpc_addr.to_string(), &metrics_addr.to_string());
    health_registry.set_serving(true);

    let signal = shutdown.clone();
    let signal_logger = logger.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(reason) => signal_logger.log_shutdown(reason),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
        }
        signal.cancel();
    });

    let grpc_shutdown = shutdown.clone();
    let served = Server::builder()
        .layer(RpcMetricsLayer::new(metrics.clone()))
        .add_service(grpc_health)
        .add_service(ProfilerServer::new(service))
        .serve_with_shutdown(grpc_addr, async move { grpc_shutdown.cancelled().await })
        .await
        .context("gRPC server failed");

    health_registry.set_serving(false);
    health_reporter
        .set_not_serving::<ProfilerServer<ProfilerService>>()
        .await;
    shutdown.cancel();

    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "Metrics server failed"),
        Err(e) => error!(error = %e, "Metrics server task panicked"),
        Ok(Ok(())) => {}
    }

    info!("Shut down");
    served
}

/// Resolves with the name of the first termination signal received
async fn shutdown_signal() -> Result<&'static str> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}
