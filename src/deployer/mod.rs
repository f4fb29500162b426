//! Source checkout and build pipeline.
//!
//! A deploy resolves the app directory inside the deployments root, brings
//! the working copy up to date (clone, or checkout + pull), then runs the
//! install and build commands with the app's env overlay.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;
use deckhand_common::AppRecord;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::errors::{SupervisorError, SupervisorResult};
use crate::registry::AppRegistry;
use crate::shell::{run_shell, ShellOptions, ShellOutput};
use crate::util::resolve_within;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeployOptions {
    /// Set for webhook-triggered redeploys. Only changes how the deploy is
    /// logged; the pipeline is the same.
    pub update_only: bool,
}

/// Human-readable result of each deploy step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploySummary {
    pub repository: String,
    pub install: String,
    pub build: String,
}

impl DeploySummary {
    pub fn render(&self) -> String {
        format!(
            "Repository: {}\nInstall: {}\nBuild: {}",
            self.repository, self.install, self.build
        )
    }
}

#[derive(Clone)]
pub struct Deployer {
    registry: AppRegistry,
    deployments_dir: PathBuf,
}

impl Deployer {
    pub fn new(registry: AppRegistry, deployments_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            deployments_dir: deployments_dir.into(),
        }
    }

    pub fn deployments_dir(&self) -> &Path {
        &self.deployments_dir
    }

    /// Resolve `directory` strictly inside the deployments root.
    pub fn resolve_directory(&self, directory: &Path) -> SupervisorResult<PathBuf> {
        resolve_within(&self.deployments_dir, directory).ok_or_else(|| SupervisorError::PathEscape {
            path: directory.to_path_buf(),
            root: self.deployments_dir.clone(),
        })
    }

    #[instrument(skip(self), fields(update_only = opts.update_only))]
    pub async fn deploy(&self, name: &str, opts: DeployOptions) -> SupervisorResult<DeploySummary> {
        let app = self.registry.require(name).await?;
        let directory = self.resolve_directory(&app.directory)?;

        let repository = self.ensure_checkout(&app, &directory).await?;
        debug!(app = %name, %repository, "source ready");

        let install = run_step(&app.install_command, &directory, &app.env).await?;
        let build = run_step(&app.build_command, &directory, &app.env).await?;

        let now = Utc::now();
        self.registry
            .update(name, move |app| {
                app.last_deploy_at = Some(now);
                Ok(())
            })
            .await?;

        info!(app = %name, %repository, "deploy finished");
        Ok(DeploySummary {
            repository,
            install,
            build,
        })
    }

    async fn ensure_checkout(&self, app: &AppRecord, directory: &Path) -> SupervisorResult<String> {
        // Uploaded apps are never touched by git. A missing directory only
        // matters once a step has to run in it.
        if app.is_local() {
            return Ok("local (uploaded)".to_string());
        }

        if app.branch.starts_with('-') || app.repo.starts_with('-') {
            return Err(SupervisorError::InvalidApp(format!(
                "refusing to pass option-like repo or branch to git for \"{}\"",
                app.name
            )));
        }

        let action = if !directory.exists() {
            let target = directory.to_string_lossy();
            run_git(
                &[
                    "clone",
                    "--branch",
                    app.branch.as_str(),
                    "--single-branch",
                    app.repo.as_str(),
                    target.as_ref(),
                ],
                &self.deployments_dir,
            )
            .await?;
            "cloned"
        } else {
            if !directory.join(".git").exists() {
                return Err(SupervisorError::NotAGitCheckout {
                    path: directory.to_path_buf(),
                });
            }
            run_git(&["checkout", app.branch.as_str()], directory).await?;
            run_git(&["pull", "origin", app.branch.as_str()], directory).await?;
            "pulled"
        };

        Ok(match head_short_sha(directory) {
            Some(sha) => format!("Repo {} ({} @ {})", action, app.branch, sha),
            None => format!("Repo {} ({})", action, app.branch),
        })
    }
}

/// Run an install/build command, or report it as skipped.
async fn run_step(
    command: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> SupervisorResult<String> {
    if command.trim().is_empty() {
        return Ok("skipped".to_string());
    }
    let output = run_shell(
        command,
        ShellOptions {
            cwd,
            env,
            timeout: None,
        },
    )
    .await?;
    Ok(output.combined())
}

/// git invoked directly with an argument vector, never through a shell.
async fn run_git(args: &[&str], cwd: &Path) -> SupervisorResult<ShellOutput> {
    let command = format!("git {}", args.join(" "));
    debug!(%command, cwd = %cwd.display(), "running git");

    tokio::fs::create_dir_all(cwd)
        .await
        .map_err(|source| SupervisorError::SpawnFailed {
            command: command.clone(),
            source,
        })?;

    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| SupervisorError::SpawnFailed {
            command: command.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(SupervisorError::ShellFailure {
            command,
            code: output.status.code(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(ShellOutput { stdout, stderr })
}

fn head_short_sha(directory: &Path) -> Option<String> {
    let repo = git2::Repository::open(directory).ok()?;
    let commit = repo.head().ok()?.peel_to_commit().ok()?;
    let id = commit.id().to_string();
    Some(id.chars().take(7).collect())
}
