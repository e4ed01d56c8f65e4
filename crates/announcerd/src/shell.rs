//! Subprocess execution for probes and route programming.
//!
//! Commands are always run as an argument vector, never through a shell,
//! so targets and prefixes cannot be interpreted as shell syntax. Every
//! execution carries a timeout; a child that outlives it is killed.
//!
//! # Example
//!
//! ```ignore
//! use exabgp_announcerd::shell::{self, IP_CMD};
//!
//! let argv = vec![IP_CMD.to_string(), "-6".into(), "route".into(), "show".into()];
//! let result = shell::exec(&argv, Duration::from_secs(2)).await?;
//! ```

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{AnnouncerError, Result};

/// Path to the `ip` command for routing table access.
pub const IP_CMD: &str = "/sbin/ip";

/// Privilege escalation wrapper for route programming.
pub const SUDO_CMD: &str = "sudo";

/// IPv4 echo utility.
pub const PING_CMD: &str = "ping";

/// IPv6 echo utility.
pub const PING6_CMD: &str = "ping6";

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success, -1 = killed by signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Render an argument vector for logs and error messages.
pub fn render(argv: &[String]) -> String {
    argv.join(" ")
}

/// Executes a command asynchronously.
///
/// # Returns
///
/// * `Ok(ExecResult)` - The command ran to completion (any exit code)
/// * `Err(AnnouncerError::Shell)` - The command could not be spawned or timed out
pub async fn exec(argv: &[String], timeout: Duration) -> Result<ExecResult> {
    let command = render(argv);
    let Some((program, args)) = argv.split_first() else {
        return Err(AnnouncerError::Shell {
            command,
            reason: "empty command".to_string(),
        });
    };
    tracing::debug!(command = %command, "Executing command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(AnnouncerError::Shell {
                command,
                reason: e.to_string(),
            });
        }
        Err(_) => {
            tracing::warn!(command = %command, timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "Command timed out");
            return Err(AnnouncerError::Shell {
                command,
                reason: format!("timed out after {:?}", timeout),
            });
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let result = ExecResult {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %command, "Command succeeded");
    } else {
        tracing::debug!(
            command = %command,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command returned non-zero"
        );
    }

    Ok(result)
}

/// Executes a command and returns an error on non-zero exit.
pub async fn exec_or_throw(argv: &[String], timeout: Duration) -> Result<String> {
    let result = exec(argv, timeout).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(AnnouncerError::Shell {
            command: render(argv),
            reason: format!(
                "exit code {}: {}",
                result.exit_code,
                result.combined_output()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_exec_captures_output() {
        let result = exec(
            &argv(&["/bin/sh", "-c", "echo out; echo err >&2"]),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "out");
        assert_eq!(result.stderr, "err");
        assert_eq!(result.combined_output(), "out\nerr");
    }

    #[tokio::test]
    async fn test_exec_non_zero_exit() {
        let result = exec(&argv(&["/bin/sh", "-c", "exit 3"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 3);

        let err = exec_or_throw(&argv(&["/bin/sh", "-c", "exit 3"]), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let err = exec(&argv(&["/bin/sh", "-c", "sleep 5"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, AnnouncerError::Shell { reason, .. } if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn test_exec_missing_binary() {
        let err = exec(&argv(&["/nonexistent/cooper69"]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AnnouncerError::Shell { .. }));
    }

    #[tokio::test]
    async fn test_exec_empty_argv() {
        assert!(exec(&[], Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&argv(&[IP_CMD, "-6", "route"])), "/sbin/ip -6 route");
    }
}
