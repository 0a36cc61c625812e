//! CPU sampling with an external tool
//!
//! The sampling tool is driven through the [`ProcessRunner`] seam so the
//! sampling protocol can be exercised without spawning real processes.
//! Artifacts produced along the way are owned by [`Artifact`] guards that
//! remove their file when dropped.

mod artifact;
mod perf;
mod runner;

pub use artifact::{Artifact, ArtifactKind};
pub use perf::{locate_binary, PerfExecutor, CPU_CLOCK_EVENT, CYCLES_EVENT, SAMPLE_FREQUENCY_HZ};
pub use runner::{ProcessOutput, ProcessRunner, TokioProcessRunner};

#[cfg(test)]
pub(crate) use runner::testing;
