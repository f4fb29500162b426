//! Running app-supplied shell commands (install, build, scheduled and one-off
//! commands).

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use deckhand_common::AppRecord;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::{SupervisorError, SupervisorResult};
use crate::supervisor::process::{self, Signal};

/// Where and how to run a command.
#[derive(Debug, Clone, Copy)]
pub struct ShellOptions<'a> {
    pub cwd: &'a Path,
    /// Overlaid on the inherited host environment.
    pub env: &'a BTreeMap<String, String>,
    /// `None` runs without a bound.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    /// stdout and stderr joined, for reporting.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Run `command` through `sh -c` in its own process group.
///
/// A non-zero exit becomes [`SupervisorError::ShellFailure`] carrying stderr.
/// When the timeout expires the whole group is killed and
/// [`SupervisorError::ShellTimeout`] is returned.
pub async fn run_shell(command: &str, opts: ShellOptions<'_>) -> SupervisorResult<ShellOutput> {
    debug!(command, cwd = %opts.cwd.display(), "running shell command");

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(opts.cwd)
        .envs(opts.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SupervisorError::SpawnFailed {
            command: command.to_string(),
            source,
        })?;
    let pid = child.id();

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let result = match opts.timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut wait).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(pid) = pid {
                    warn!(command, pid, "command timed out, killing process group");
                    process::terminate(pid, Some(pid), Signal::Kill);
                }
                return Err(SupervisorError::ShellTimeout {
                    command: command.to_string(),
                    timeout_secs: limit.as_secs(),
                });
            }
        },
        None => wait.await,
    };

    let output = result.map_err(|source| SupervisorError::SpawnFailed {
        command: command.to_string(),
        source,
    })?;

    let out = ShellOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if !output.status.success() {
        return Err(SupervisorError::ShellFailure {
            command: command.to_string(),
            code: output.status.code(),
            stderr: if out.stderr.trim().is_empty() {
                out.stdout.trim().to_string()
            } else {
                out.stderr.trim().to_string()
            },
        });
    }

    Ok(out)
}

/// Run `command` in an app's directory with its env overlay.
pub async fn run_in_app(
    app: &AppRecord,
    command: &str,
    timeout: Duration,
) -> SupervisorResult<ShellOutput> {
    if !tokio::fs::metadata(&app.directory)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return Err(SupervisorError::NotDeployed {
            name: app.name.clone(),
            directory: app.directory.clone(),
        });
    }
    run_shell(
        command,
        ShellOptions {
            cwd: &app.directory,
            env: &app.env,
            timeout: Some(timeout),
        },
    )
    .await
}
