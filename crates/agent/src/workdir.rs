//! Work directory preparation

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};

/// Subdirectories holding per-call artifacts
const ARTIFACT_DIRS: [&str; 2] = ["profile", "script"];

/// Create the work directory and drop artifacts left by a previous run
///
/// Artifacts never outlive the call that produced them, so anything found
/// here at startup belongs to a process that crashed mid-call.
pub fn prepare(work_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("failed to create work dir {}", work_dir.display()))?;

    for name in ARTIFACT_DIRS {
        let dir = work_dir.join(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => warn!(path = %dir.display(), "Removed stale artifacts"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to remove stale artifacts in {}", dir.display()))
            }
        }
    }

    info!(path = %work_dir.display(), "Work directory ready");
    Ok(())
}
