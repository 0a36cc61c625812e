//! Temporary files produced by the sampling tool

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What an artifact contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Binary sample data written by `record`
    RawTrace,
    /// Symbolized text written by `script`
    SymbolizedScript,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::RawTrace => write!(f, "raw-trace"),
            ArtifactKind::SymbolizedScript => write!(f, "symbolized-script"),
        }
    }
}

/// A file on disk owned by exactly one call
///
/// The file is removed when the guard is dropped, whichever path the call
/// takes. Removal is idempotent: a file that is already gone is not an error.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
    kind: ArtifactKind,
    removed: bool,
}

impl Artifact {
    /// Take ownership of `path`; the file need not exist yet
    pub fn new(path: impl Into<PathBuf>, kind: ArtifactKind) -> Self {
        Self {
            path: path.into(),
            kind,
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// Remove the file now. Safe to call more than once.
    pub fn remove(&mut self) -> std::io::Result<()> {
        if self.removed {
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), kind = %self.kind, "Removed artifact");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.removed = true;
        Ok(())
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(path = %self.path.display(), kind = %self.kind, error = %e, "Failed to remove artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.data");
        std::fs::write(&path, b"samples").unwrap();

        {
            let artifact = Artifact::new(&path, ArtifactKind::RawTrace);
            assert!(artifact.path().exists());
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_artifact_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.script");
        std::fs::write(&path, b"yes 1 [000] cycles:").unwrap();

        let mut artifact = Artifact::new(&path, ArtifactKind::SymbolizedScript);
        artifact.remove().unwrap();
        artifact.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_artifact_for_missing_file_drops_cleanly() {
        let dir = TempDir::new().unwrap();
        let mut artifact = Artifact::new(dir.path().join("never-written"), ArtifactKind::RawTrace);
        artifact.remove().unwrap();
    }
}
