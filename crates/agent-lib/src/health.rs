//! Agent health as seen by the kubelet probes
//!
//! The sampling tool and the work directory are checked once at startup; either
//! failing keeps the agent out of service. The container runtime is observed
//! through Profile calls instead: an unreachable socket degrades the agent
//! without making it unready, and the next answered status query restores it.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tonic::{Code, Status};
use tracing::warn;

/// Parts of the agent that report health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Container runtime socket
    Runtime,
    /// Sampling tool binary
    Sampler,
    /// Artifact working directory
    WorkDir,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Runtime, Component::Sampler, Component::WorkDir];

    pub fn name(self) -> &'static str {
        match self {
            Component::Runtime => "runtime",
            Component::Sampler => "sampler",
            Component::WorkDir => "work_dir",
        }
    }

    /// No Profile call can succeed while this component is down
    fn gates_readiness(self) -> bool {
        matches!(self, Component::Sampler | Component::WorkDir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Calls may fail but the agent keeps serving
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared view of component health; clones observe the same state
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<Component, ComponentHealth>>>,
    serving: Arc<AtomicBool>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Every component starts healthy; the agent starts not serving
    pub fn new() -> Self {
        let components = Component::ALL
            .into_iter()
            .map(|c| (c, ComponentHealth::new(ComponentStatus::Healthy, None)))
            .collect();
        Self {
            components: Arc::new(RwLock::new(components)),
            serving: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record a failed startup check
    pub async fn mark_failed(&self, component: Component, message: impl Into<String>) {
        let health = ComponentHealth::new(ComponentStatus::Unhealthy, Some(message.into()));
        self.components.write().await.insert(component, health);
    }

    /// Fold the outcome of a runtime status query into the runtime's health
    ///
    /// `failure` is the status the runtime call failed with, if any. Only
    /// transport-level failures count against the runtime; a runtime that
    /// answers "not found" is reachable.
    pub async fn observe_runtime(&self, failure: Option<&Status>) {
        let health = match failure {
            Some(status) if matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded) => {
                warn!(code = ?status.code(), error = %status.message(), "Container runtime unreachable");
                ComponentHealth::new(ComponentStatus::Degraded, Some(status.message().to_string()))
            }
            _ => ComponentHealth::new(ComponentStatus::Healthy, None),
        };

        self.components
            .write()
            .await
            .insert(Component::Runtime, health);
    }

    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::SeqCst);
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = components
            .values()
            .map(|c| c.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            });
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        if !self.serving.load(Ordering::SeqCst) {
            return ReadinessResponse {
                ready: false,
                reason: Some("agent is not serving".to_string()),
            };
        }

        let components = self.components.read().await;
        let blocking = components.iter().find(|(component, health)| {
            component.gates_readiness() && health.status == ComponentStatus::Unhealthy
        });
        match blocking {
            Some((component, health)) => ReadinessResponse {
                ready: false,
                reason: Some(format!(
                    "{} unhealthy: {}",
                    component.name(),
                    health.message.as_deref().unwrap_or("no detail")
                )),
            },
            None => ReadinessResponse {
                ready: true,
                reason: None,
            },
        }
    }
}
