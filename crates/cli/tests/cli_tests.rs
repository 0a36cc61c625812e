//! CLI integration tests

use std::process::Command;

fn perfscope(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_perfscope"))
        .args(args)
        .env_remove("KUBECONFIG")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = perfscope(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("CPU profiling"), "Should describe the tool");
    assert!(stdout.contains("profile"), "Should show profile command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = perfscope(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("perfscope"), "Should show binary name");
}

/// Test profile subcommand help
#[test]
fn test_profile_help() {
    let output = perfscope(&["profile", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Profile help should succeed");
    for flag in [
        "--namespace",
        "--container",
        "--agent-namespace",
        "--timeout",
        "--grace",
        "--output-dir",
    ] {
        assert!(stdout.contains(flag), "Should show {} option", flag);
    }
}

/// Test that the pod name is required
#[test]
fn test_profile_requires_pod() {
    let output = perfscope(&["profile"]);
    assert!(!output.status.success(), "Profile without a pod should fail");
}

/// Test that malformed durations are rejected by argument parsing
#[test]
fn test_profile_rejects_bad_timeout() {
    let output = perfscope(&["profile", "web-0", "--timeout", "soon"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("--timeout"), "Should name the bad flag");
}
