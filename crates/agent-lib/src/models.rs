//! Core data models shared by the agent and the CLI

use crate::error::{ProfilerError, Result};
use crate::proto::PerfProfileRequest;
use std::time::Duration;

/// Port the agent serves the Profile RPC on unless told otherwise
pub const DEFAULT_GRPC_PORT: u16 = 6543;

/// Port the agent serves health and metrics on
pub const DEFAULT_METRICS_PORT: u16 = 6541;

/// Name of the container port that overrides [`DEFAULT_GRPC_PORT`] in the agent pod spec
pub const GRPC_PORT_NAME: &str = "perfscope-grpc";

/// Label carried by every agent pod
pub const AGENT_LABEL_KEY: &str = "app.kubernetes.io/name";
pub const AGENT_LABEL_VALUE: &str = "perfscope-agent";

/// Upper bound for a single sampling window
pub const MAX_PROFILE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Size of each chunk of the symbolized trace sent back to the caller
pub const CHUNK_SIZE: usize = 1024;

/// Label selector matching agent pods
pub fn agent_label_selector() -> String {
    format!("{}={}", AGENT_LABEL_KEY, AGENT_LABEL_VALUE)
}

/// A validated Profile request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRequest {
    pub container_id: String,
    pub timeout: Duration,
}

impl ProfileRequest {
    /// Validate a wire request against the configured maximum duration
    pub fn from_proto(req: &PerfProfileRequest, max_timeout: Duration) -> Result<Self> {
        if req.container_id.is_empty() {
            return Err(ProfilerError::invalid_argument("container ID is not set"));
        }

        let timeout = match &req.timeout {
            Some(t) if is_well_formed(t) => t,
            _ => return Err(ProfilerError::invalid_argument("timeout is invalid value")),
        };
        if timeout.seconds < 0 || timeout.nanos < 0 || (timeout.seconds == 0 && timeout.nanos == 0) {
            return Err(ProfilerError::invalid_argument("timeout must be positive"));
        }
        // Both fields are non-negative here
        let timeout = Duration::new(timeout.seconds as u64, timeout.nanos as u32);

        if timeout > max_timeout {
            return Err(ProfilerError::invalid_argument(format!(
                "timeout is too long {:?}",
                humanize(timeout)
            )));
        }

        Ok(Self {
            container_id: req.container_id.clone(),
            timeout,
        })
    }

    pub fn to_proto(&self) -> PerfProfileRequest {
        PerfProfileRequest {
            container_id: self.container_id.clone(),
            timeout: prost_types::Duration::try_from(self.timeout).ok(),
        }
    }
}

/// Protobuf duration bounds: about 10,000 years, nanos sharing the sign of seconds
fn is_well_formed(d: &prost_types::Duration) -> bool {
    let seconds_in_range = d.seconds.abs() <= 315_576_000_000;
    let nanos_in_range = d.nanos.abs() < 1_000_000_000;
    let signs_agree = d.seconds == 0 || d.nanos == 0 || (d.seconds < 0) == (d.nanos < 0);
    seconds_in_range && nanos_in_range && signs_agree
}

fn humanize(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}s", d.as_secs_f64())
    }
}

/// Host process of a running container, valid for one call only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    /// Returns None for pids that cannot name a live process
    pub fn new(pid: i64) -> Option<Self> {
        u32::try_from(pid)
            .ok()
            .filter(|pid| *pid > 0)
            .map(|pid| Self { pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}
