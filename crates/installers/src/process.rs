//! Subprocess execution with timeouts and captured output.
//!
//! Every external tool the installers shell out to goes through
//! [`run_command`], so timeouts and error shaping are uniform.

use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace};

use protodist_core::{Error, Result};

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Whether the process exited zero.
    pub success: bool,
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
}

/// Run a command with a deadline, capturing output.
///
/// # Errors
///
/// Returns [`Error::Timeout`] when the deadline passes and
/// [`Error::NotFound`] when the program itself is missing. A non-zero exit
/// is not an error here; callers inspect [`CommandOutput::success`].
pub async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput> {
    debug!(program, ?args, "Running command");
    let mut command = Command::new(program);
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| Error::timeout(format!("{program} {}", args.join(" ")), timeout.as_secs()))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("program '{program}' is not installed"))
            } else {
                Error::internal(format!("failed to spawn {program}: {e}"))
            }
        })?;

    let result = CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };
    trace!(
        program,
        success = result.success,
        stderr = %result.stderr,
        "Command finished"
    );
    Ok(result)
}

/// Whether a program exists and answers `--version`.
pub async fn probe(program: &str) -> bool {
    run_command(program, &["--version"], None, Duration::from_secs(10))
        .await
        .map(|out| out.success)
        .unwrap_or(false)
}

/// Best-effort liveness check for an installed binary.
///
/// The binary must respond to `--version` or `--help` without the shell
/// reporting it missing; a non-zero exit alone is tolerated. Digest equality
/// is the authoritative check elsewhere; this only catches gross breakage.
pub async fn validate_binary(path: &Path) -> bool {
    let Some(path_str) = path.to_str() else {
        return false;
    };
    for flag in ["--version", "--help"] {
        match run_command(path_str, &[flag], None, Duration::from_secs(10)).await {
            Ok(out) => {
                let stderr = out.stderr.to_lowercase();
                if stderr.contains("command not found") || stderr.contains("no such file") {
                    return false;
                }
                return true;
            }
            Err(_) => continue,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let out = run_command("echo", &["hello"], None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_run_command_nonzero_is_not_error() {
        let out = run_command("false", &[], None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        let err = run_command("definitely-not-a-real-tool", &[], None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), protodist_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_probe_missing() {
        assert!(!probe("definitely-not-a-real-tool").await);
    }
}
