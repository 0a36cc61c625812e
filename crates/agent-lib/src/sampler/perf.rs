//! `perf record` / `perf script` driver

use super::artifact::{Artifact, ArtifactKind};
use super::runner::{ProcessOutput, ProcessRunner};
use crate::error::{ProfilerError, Result};
use crate::models::ProcessHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub const SAMPLE_FREQUENCY_HZ: u32 = 99;

/// Event markers in `perf script -F event` output that prove cpu samples exist
pub const CYCLES_EVENT: &str = "cycles:";
pub const CPU_CLOCK_EVENT: &str = "cpu-clock:";

const RECORD_SUBCOMMAND: &str = "record";
const SCRIPT_SUBCOMMAND: &str = "script";
const PROFILE_DIR: &str = "profile";
const SCRIPT_DIR: &str = "script";

/// Stderr is quoted in errors up to this many bytes
const STDERR_LIMIT: usize = 4096;

/// Find `name` on `PATH`, or accept it as-is when it is already a path
pub fn locate_binary(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

/// Captures and symbolizes cpu stacks with perf
pub struct PerfExecutor {
    runner: Arc<dyn ProcessRunner>,
    binary: PathBuf,
    work_dir: PathBuf,
}

impl PerfExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>, binary: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Sample the process tree rooted at `process` for `duration`
    ///
    /// The run length is set by a companion `sleep`, so perf itself decides
    /// when sampling ends. Each call writes to a freshly named file.
    pub async fn record(
        &self,
        process: ProcessHandle,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let profile_dir = self.work_dir.join(PROFILE_DIR);
        tokio::fs::create_dir_all(&profile_dir)
            .await
            .map_err(|e| ProfilerError::artifact("failed to create", &profile_dir, e))?;

        let artifact = Artifact::new(
            profile_dir.join(format!("perfscope-{}.data", Uuid::new_v4())),
            ArtifactKind::RawTrace,
        );
        let args = record_args(process, duration, artifact.path());

        info!(
            pid = process.pid(),
            duration_secs = duration.as_secs_f64(),
            output = %artifact.path().display(),
            "Executing perf record"
        );
        let output = self.runner.run(&self.binary, &args, cancel).await?;
        check_status(RECORD_SUBCOMMAND, &output)?;

        Ok(artifact)
    }

    /// Turn a raw trace into a symbolized script
    ///
    /// Fails with [`ProfilerError::NoSamples`] when the trace holds no cpu
    /// sampling events instead of producing an empty script.
    pub async fn symbolize(&self, raw: &Artifact, cancel: &CancellationToken) -> Result<Artifact> {
        let events = self.list_events(raw.path(), cancel).await?;
        if !has_cpu_samples(&events) {
            return Err(ProfilerError::NoSamples {
                path: raw.path().to_path_buf(),
            });
        }

        let args = vec![
            SCRIPT_SUBCOMMAND.to_string(),
            "--no-inline".to_string(),
            "-i".to_string(),
            raw.path().display().to_string(),
        ];
        info!(input = %raw.path().display(), "Executing perf script");
        let output = self.runner.run(&self.binary, &args, cancel).await?;
        check_status(SCRIPT_SUBCOMMAND, &output)?;

        let script_dir = self.work_dir.join(SCRIPT_DIR);
        tokio::fs::create_dir_all(&script_dir)
            .await
            .map_err(|e| ProfilerError::artifact("failed to create", &script_dir, e))?;

        let file_name = raw
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("perfscope-{}.data", Uuid::new_v4()));
        let script = Artifact::new(
            script_dir.join(format!("{}.script", file_name)),
            ArtifactKind::SymbolizedScript,
        );
        tokio::fs::write(script.path(), &output.stdout)
            .await
            .map_err(|e| ProfilerError::artifact("failed to write", script.path(), e))?;

        Ok(script)
    }

    async fn list_events(&self, raw: &Path, cancel: &CancellationToken) -> Result<String> {
        let args = vec![
            SCRIPT_SUBCOMMAND.to_string(),
            "-F".to_string(),
            "event".to_string(),
            "-i".to_string(),
            raw.display().to_string(),
        ];
        let output = self.runner.run(&self.binary, &args, cancel).await?;
        check_status(SCRIPT_SUBCOMMAND, &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn record_args(process: ProcessHandle, duration: Duration, output: &Path) -> Vec<String> {
    vec![
        RECORD_SUBCOMMAND.to_string(),
        "-ag".to_string(),
        "-F".to_string(),
        SAMPLE_FREQUENCY_HZ.to_string(),
        "--call-graph".to_string(),
        "dwarf".to_string(),
        "-p".to_string(),
        process.pid().to_string(),
        "-o".to_string(),
        output.display().to_string(),
        "--".to_string(),
        "sleep".to_string(),
        duration.as_secs_f64().to_string(),
    ]
}

fn has_cpu_samples(events: &str) -> bool {
    events.contains(CYCLES_EVENT) || events.contains(CPU_CLOCK_EVENT)
}

fn check_status(subcommand: &'static str, output: &ProcessOutput) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = &output.stderr[..output.stderr.len().min(STDERR_LIMIT)];
    Err(ProfilerError::ToolFailed {
        subcommand,
        status: output.status,
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::testing::FakePerf;
    use tempfile::TempDir;

    fn executor(fake: Arc<FakePerf>, dir: &TempDir) -> PerfExecutor {
        PerfExecutor::new(fake, "/usr/bin/perf", dir.path())
    }

    fn pid() -> ProcessHandle {
        ProcessHandle::new(4242).unwrap()
    }

    #[test]
    fn test_record_args() {
        let args = record_args(pid(), Duration::from_secs(5), Path::new("/w/profile/x.data"));
        assert_eq!(
            args,
            vec![
                "record", "-ag", "-F", "99", "--call-graph", "dwarf", "-p", "4242", "-o",
                "/w/profile/x.data", "--", "sleep", "5",
            ]
        );

        let args = record_args(pid(), Duration::from_millis(1500), Path::new("/x"));
        assert_eq!(args.last().map(String::as_str), Some("1.5"));
    }

    #[test]
    fn test_has_cpu_samples() {
        assert!(has_cpu_samples("cycles:\ncycles:\n"));
        assert!(has_cpu_samples("cpu-clock:\n"));
        assert!(!has_cpu_samples(""));
        assert!(!has_cpu_samples("sched:sched_switch:\n"));
    }

    #[tokio::test]
    async fn test_record_names_are_unique() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakePerf::default());
        let executor = executor(fake.clone(), &dir);
        let cancel = CancellationToken::new();

        let first = executor.record(pid(), Duration::from_secs(1), &cancel).await.unwrap();
        let second = executor.record(pid(), Duration::from_secs(1), &cancel).await.unwrap();

        assert_ne!(first.path(), second.path());
        assert!(first.path().starts_with(dir.path().join("profile")));
        assert_eq!(first.kind(), ArtifactKind::RawTrace);
        assert!(first.path().exists() && second.path().exists());
    }

    #[tokio::test]
    async fn test_symbolize_writes_script() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakePerf::default());
        let executor = executor(fake.clone(), &dir);
        let cancel = CancellationToken::new();

        let raw = executor.record(pid(), Duration::from_secs(1), &cancel).await.unwrap();
        let script = executor.symbolize(&raw, &cancel).await.unwrap();

        assert_eq!(script.kind(), ArtifactKind::SymbolizedScript);
        assert!(script.path().starts_with(dir.path().join("script")));
        assert_eq!(std::fs::read(script.path()).unwrap(), fake.script);

        let invocations = fake.invocations();
        assert_eq!(invocations[1][..3], ["script", "-F", "event"]);
        assert_eq!(invocations[2][..2], ["script", "--no-inline"]);
    }

    #[tokio::test]
    async fn test_symbolize_without_samples_fails_distinctly() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakePerf {
            events: String::new(),
            ..Default::default()
        });
        let executor = executor(fake.clone(), &dir);
        let cancel = CancellationToken::new();

        let raw = executor.record(pid(), Duration::from_secs(1), &cancel).await.unwrap();
        let err = executor.symbolize(&raw, &cancel).await.unwrap_err();

        assert!(matches!(err, ProfilerError::NoSamples { .. }));
        // Full symbolization never ran
        assert_eq!(fake.invocations().len(), 2);
    }

    #[tokio::test]
    async fn test_record_failure_is_surfaced_and_cleaned() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakePerf {
            record_exit_code: 1,
            ..Default::default()
        });
        let executor = executor(fake, &dir);

        let err = executor
            .record(pid(), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ProfilerError::ToolFailed { subcommand, stderr, .. } => {
                assert_eq!(subcommand, "record");
                assert_eq!(stderr, "perf: failed");
            }
            other => panic!("unexpected error {other:?}"),
        }
        let leftovers = std::fs::read_dir(dir.path().join("profile")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_locate_binary() {
        assert!(locate_binary("sh").is_some());
        assert!(locate_binary("/bin/sh").is_some());
        assert!(locate_binary("perfscope-definitely-missing").is_none());
    }
}
