//! Spawning of external processes

use crate::error::{ProfilerError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Captured result of a finished process
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Runs a program to completion or until the call is cancelled
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `program` with `args`. A cancelled call must not leave the process running.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput>;
}

/// Runner backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProfilerError::Spawn {
                program: program.display().to_string(),
                source,
            })?;
        debug!(program = %program.display(), pid = ?child.id(), "Spawned process");

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output.map_err(|source| ProfilerError::Spawn {
                    program: program.display().to_string(),
                    source,
                })?;
                Ok(ProcessOutput {
                    status: output.status,
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            // Dropping the wait future drops the child, which kills it
            _ = cancel.cancelled() => {
                debug!(program = %program.display(), "Process killed on cancellation");
                Err(ProfilerError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted stand-in for the sampling tool
    ///
    /// `record` writes a small raw file at its `-o` path, `script -F event`
    /// prints `events`, and a plain `script` prints `script` or exits with
    /// `script_exit_code`.
    pub struct FakePerf {
        pub events: String,
        pub script: Vec<u8>,
        pub record_exit_code: i32,
        /// How long `record` runs before producing its file
        pub record_delay: Duration,
        pub script_exit_code: i32,
        pub invocations: Mutex<Vec<Vec<String>>>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl Default for FakePerf {
        fn default() -> Self {
            Self {
                events: "cycles:\ncycles:\n".to_string(),
                script: b"yes  4242 [000]  1.000: cycles:\n\t  ffffffff main (/usr/bin/yes)\n".to_vec(),
                record_exit_code: 0,
                record_delay: Duration::ZERO,
                script_exit_code: 0,
                invocations: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    impl FakePerf {
        pub fn invocations(&self) -> Vec<Vec<String>> {
            self.invocations.lock().unwrap().clone()
        }

        pub fn record_calls(&self) -> usize {
            self.invocations()
                .iter()
                .filter(|args| args.first().map(String::as_str) == Some("record"))
                .count()
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn output(code: i32, stdout: Vec<u8>) -> ProcessOutput {
            ProcessOutput {
                status: ExitStatus::from_raw(code << 8),
                stdout,
                stderr: if code == 0 { Vec::new() } else { b"perf: failed".to_vec() },
            }
        }

        async fn record(&self, args: &[String], cancel: &CancellationToken) -> Result<ProcessOutput> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = tokio::select! {
                _ = tokio::time::sleep(self.record_delay) => Ok(()),
                _ = cancel.cancelled() => Err(ProfilerError::Cancelled),
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result?;

            if self.record_exit_code != 0 {
                return Ok(Self::output(self.record_exit_code, Vec::new()));
            }
            let output = args
                .iter()
                .position(|a| a == "-o")
                .and_then(|i| args.get(i + 1))
                .map(PathBuf::from)
                .expect("record invoked without -o");
            tokio::fs::write(&output, b"PERFILE2").await.unwrap();
            Ok(Self::output(0, Vec::new()))
        }
    }

    #[async_trait]
    impl ProcessRunner for FakePerf {
        async fn run(
            &self,
            _program: &Path,
            args: &[String],
            cancel: &CancellationToken,
        ) -> Result<ProcessOutput> {
            self.invocations.lock().unwrap().push(args.to_vec());
            match args.first().map(String::as_str) {
                Some("record") => self.record(args, cancel).await,
                Some("script") if args.iter().any(|a| a == "event") => {
                    Ok(Self::output(0, self.events.clone().into_bytes()))
                }
                Some("script") if self.script_exit_code != 0 => {
                    Ok(Self::output(self.script_exit_code, Vec::new()))
                }
                Some("script") => Ok(Self::output(0, self.script.clone())),
                other => panic!("unexpected perf subcommand {:?}", other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_tokio_runner_captures_stdout() {
        let runner = TokioProcessRunner;
        let output = runner
            .run(
                Path::new("echo"),
                &["cycles:".to_string()],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "cycles:\n");
    }

    #[tokio::test]
    async fn test_tokio_runner_kills_on_cancel() {
        let runner = TokioProcessRunner;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = runner
            .run(Path::new("sleep"), &["30".to_string()], &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProfilerError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_tokio_runner_spawn_failure() {
        let err = TokioProcessRunner
            .run(
                Path::new("/nonexistent/perfscope-tool"),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProfilerError::Spawn { .. }));
    }
}
