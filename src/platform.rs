//! Platform seams: subprocess execution and the local management bus
//!
//! Everything the daemon asks of the router OS (ubus, uci, ping, mwan3)
//! funnels through [`CommandRunner`] so collectors and the controller stay
//! testable with mocks and every external call carries a deadline.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::domain_types::InterfaceName;

/// Platform call errors.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The program could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The call exceeded its deadline.
    #[error("{program} timed out after {deadline:?}")]
    Timeout {
        /// Program name.
        program: String,
        /// Deadline that expired.
        deadline: Duration,
    },

    /// The program exited non-zero.
    #[error("{program} exited with status {status}: {stderr}")]
    Failed {
        /// Program name.
        program: String,
        /// Exit status.
        status: i32,
        /// Captured stderr, trimmed.
        stderr: String,
    },

    /// Output was not in the expected shape.
    #[error("unparseable output from {program}: {reason}")]
    Parse {
        /// Program name.
        program: String,
        /// What went wrong.
        reason: String,
    },
}

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output, UTF-8 lossy.
    pub stdout: String,
    /// Standard error, UTF-8 lossy.
    pub stderr: String,
}

/// Deadline-bounded subprocess execution.
#[async_trait]
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    /// Runs `program` with `args`, enforcing `deadline`.
    ///
    /// # Errors
    ///
    /// `Spawn` when the program cannot start, `Timeout` past the deadline,
    /// `Failed` on a non-zero exit.
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        deadline: Duration,
    ) -> Result<CommandOutput, PlatformError>;
}

/// Real subprocess runner.
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        deadline: Duration,
    ) -> Result<CommandOutput, PlatformError> {
        trace!(program, ?args, "exec");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PlatformError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Dropping the future on timeout kills the child (kill_on_drop).
        let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| PlatformError::Spawn {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(PlatformError::Timeout {
                    program: program.to_string(),
                    deadline,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(PlatformError::Failed {
                program: program.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

/// Thin wrapper for `ubus call` invocations with JSON results.
#[derive(Debug)]
pub struct Ubus<R: CommandRunner + ?Sized> {
    runner: std::sync::Arc<R>,
}

impl<R: CommandRunner + ?Sized> Ubus<R> {
    /// Wraps a command runner.
    pub fn new(runner: std::sync::Arc<R>) -> Self {
        Self { runner }
    }

    /// Calls `ubus call <path> <method> <args>` and parses the JSON reply.
    ///
    /// # Errors
    ///
    /// Propagates runner errors; `Parse` when the reply is not JSON.
    pub async fn call(
        &self,
        path: &str,
        method: &str,
        args: &Value,
        deadline: Duration,
    ) -> Result<Value, PlatformError> {
        let payload = args.to_string();
        let output = self
            .runner
            .run("ubus", &["call", path, method, &payload], deadline)
            .await?;
        if output.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&output.stdout).map_err(|e| PlatformError::Parse {
            program: "ubus".to_string(),
            reason: e.to_string(),
        })
    }

    /// Whether a ubus object exists (`ubus list <path>` non-empty).
    pub async fn object_exists(&self, path: &str, deadline: Duration) -> bool {
        match self.runner.run("ubus", &["list", path], deadline).await {
            Ok(output) => output.stdout.contains(path),
            Err(e) => {
                debug!(path, error = %e, "ubus list failed");
                false
            }
        }
    }
}

/// Reads `/proc/net/dev` rx/tx byte counters for one interface.
///
/// # Errors
///
/// `Parse` when the interface is missing or the line is malformed.
pub async fn interface_counters(interface: &InterfaceName) -> Result<(u64, u64), PlatformError> {
    let text = tokio::fs::read_to_string("/proc/net/dev")
        .await
        .map_err(|source| PlatformError::Spawn {
            program: "/proc/net/dev".to_string(),
            source,
        })?;
    parse_interface_counters(&text, interface)
}

/// Parses one interface's counters out of `/proc/net/dev` text.
///
/// # Errors
///
/// `Parse` when the interface line is absent or malformed.
pub fn parse_interface_counters(
    text: &str,
    interface: &InterfaceName,
) -> Result<(u64, u64), PlatformError> {
    for line in text.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() != interface.as_str() {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // Receive bytes is field 0, transmit bytes field 8.
        let rx = fields
            .first()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| PlatformError::Parse {
                program: "/proc/net/dev".to_string(),
                reason: format!("bad rx field for {interface}"),
            })?;
        let tx = fields
            .get(8)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| PlatformError::Parse {
                program: "/proc/net/dev".to_string(),
                reason: format!("bad tx field for {interface}"),
            })?;
        return Ok((rx, tx));
    }
    Err(PlatformError::Parse {
        program: "/proc/net/dev".to_string(),
        reason: format!("interface {interface} not present"),
    })
}
