//! Agent library for on-demand container CPU profiling
//!
//! This crate provides the core functionality for:
//! - Resolving container IDs to host processes through the container runtime
//! - Sampling and symbolizing cpu stacks with perf
//! - Bounding concurrent sampling sessions per node
//! - Serving and streaming profiles over gRPC
//! - Health checks and observability

pub mod admission;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod proto;
pub mod runtime;
pub mod sampler;
pub mod service;

pub use admission::{Admission, AdmissionTicket};
pub use error::{ProfilerError, Result};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, RpcMetricsLayer, StructuredLogger};
pub use service::ProfilerService;
