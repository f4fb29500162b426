//! The explicitly constructed context that ties the registry, lock table,
//! supervisor, deployer, scheduler and notifier together.
//!
//! Every mutating per-app operation runs under the app lock, so a webhook
//! deploy, a scheduled restart and an operator command never interleave on
//! the same app. Read-only operations do not lock.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Weak};

use anyhow::Context;
use chrono::Utc;
use deckhand_common::{AppRecord, LOCAL_REPO, ScheduledCommand, Settings};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::{DeckhandConfig, Paths};
use crate::deployer::{DeployOptions, DeploySummary, Deployer};
use crate::errors::{SupervisorError, SupervisorResult};
use crate::health::HealthReport;
use crate::locks::LockManager;
use crate::notify::NotifyHub;
use crate::registry::{AppPatch, AppRegistry};
use crate::scheduler::{ParsedSchedule, Registration, Scheduler, parse_schedule};
use crate::shell::{self, ShellOutput};
use crate::supervisor::{LiveStatus, LogTail, ProcessSupervisor, StopOutcome};
use crate::util::{
    MAX_APP_NAME_LEN, clip, valid_app_name, valid_branch, valid_env_key, valid_repo_url,
};
use crate::webhook::WebhookListener;

/// Longest deploy report excerpt included in a webhook notification.
const WEBHOOK_DETAIL_CHARS: usize = 800;

/// Input for [`Orchestrator::add_app`]. `None` keeps the stock default.
#[derive(Debug, Clone, Default)]
pub struct NewApp {
    pub name: String,
    pub repo: String,
    pub branch: Option<String>,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Delete the app directory and its log files too.
    pub delete_files: bool,
    /// Stop a running app instead of refusing.
    pub force: bool,
}

/// Result of a deploy or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployOutcome {
    pub summary: DeploySummary,
    /// Set when the app was (re)started afterwards.
    pub pid: Option<u32>,
}

struct Inner {
    paths: Paths,
    config: DeckhandConfig,
    registry: AppRegistry,
    locks: LockManager,
    supervisor: ProcessSupervisor,
    deployer: Deployer,
    scheduler: Scheduler,
    notify: NotifyHub,
    webhook: Mutex<WebhookListener>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Non-owning handle for things the orchestrator itself owns, such as the
/// webhook router.
#[derive(Clone)]
pub struct WeakOrchestrator {
    inner: Weak<Inner>,
}

impl WeakOrchestrator {
    /// `None` once the orchestrator has been dropped.
    pub fn upgrade(&self) -> Option<Orchestrator> {
        self.inner.upgrade().map(|inner| Orchestrator { inner })
    }
}

impl Orchestrator {
    /// Create the directory layout, open the registry and wire up every
    /// component. Nothing is started; the daemon does that explicitly.
    pub async fn open(paths: Paths, config: DeckhandConfig, notify: NotifyHub) -> anyhow::Result<Self> {
        paths.ensure_directories()?;
        let registry = AppRegistry::open(&paths.registry_file)
            .await
            .with_context(|| format!("Failed to open registry {}", paths.registry_file.display()))?;

        let locks = LockManager::in_dir(&paths.locks_dir);
        let supervisor = ProcessSupervisor::new(
            registry.clone(),
            locks.clone(),
            &paths.logs_dir,
            config.supervisor.clone(),
        );
        let deployer = Deployer::new(registry.clone(), &paths.deployments_dir);
        let scheduler = Scheduler::new(
            registry.clone(),
            supervisor.clone(),
            locks.clone(),
            notify.clone(),
            config.scheduler.clone(),
        );
        let webhook = Mutex::new(WebhookListener::new(config.webhook.bind.clone()));

        Ok(Self {
            inner: Arc::new(Inner {
                paths,
                config,
                registry,
                locks,
                supervisor,
                deployer,
                scheduler,
                notify,
                webhook,
            }),
        })
    }

    pub fn downgrade(&self) -> WeakOrchestrator {
        WeakOrchestrator {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.inner.paths
    }

    pub fn config(&self) -> &DeckhandConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.inner.registry
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn notify(&self) -> &NotifyHub {
        &self.inner.notify
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub async fn get_app(&self, name: &str) -> SupervisorResult<Option<AppRecord>> {
        Ok(self.inner.registry.get(name).await?)
    }

    pub async fn get_apps(&self) -> SupervisorResult<BTreeMap<String, AppRecord>> {
        Ok(self.inner.registry.get_all().await?)
    }

    pub async fn status(&self, name: &str) -> SupervisorResult<LiveStatus> {
        self.inner.supervisor.status(name).await
    }

    pub async fn read_logs(&self, name: &str, lines: usize) -> SupervisorResult<LogTail> {
        self.inner.registry.require(name).await?;
        self.inner.supervisor.read_logs(name, lines).await
    }

    // ── App definitions ─────────────────────────────────────────────────

    pub async fn add_app(&self, new: NewApp) -> SupervisorResult<AppRecord> {
        validate_name(&new.name)?;
        validate_repo(&new.repo)?;
        let branch = new.branch.unwrap_or_else(|| "main".to_string());
        validate_branch(&branch)?;
        for key in new.env.keys() {
            validate_env_key(key)?;
        }

        let directory = self.inner.paths.deployments_dir.join(&new.name);
        let mut app = AppRecord::new(&new.name, new.repo, branch, directory, Utc::now());
        if let Some(cmd) = new.install_command {
            app.install_command = cmd;
        }
        if let Some(cmd) = new.build_command {
            app.build_command = cmd;
        }
        if let Some(cmd) = new.start_command {
            app.start_command = cmd;
        }
        app.env = new.env;

        let app = self.inner.registry.insert(app).await?;
        info!(app = %app.name, repo = %app.repo, "app added");
        Ok(app)
    }

    pub async fn edit_app(&self, name: &str, patch: AppPatch) -> SupervisorResult<AppRecord> {
        if let Some(repo) = &patch.repo {
            validate_repo(repo)?;
        }
        if let Some(branch) = &patch.branch {
            validate_branch(branch)?;
        }
        self.inner
            .locks
            .with_lock(name, self.inner.registry.patch(name, patch))
            .await
    }

    pub async fn set_env(&self, name: &str, key: &str, value: &str) -> SupervisorResult<AppRecord> {
        validate_env_key(key)?;
        let (key, value) = (key.to_string(), value.to_string());
        self.inner
            .locks
            .with_lock(name, async {
                self.inner
                    .registry
                    .update(name, move |app| {
                        app.env.insert(key, value);
                        Ok(app.clone())
                    })
                    .await
            })
            .await
    }

    /// Returns whether the key was present.
    pub async fn unset_env(&self, name: &str, key: &str) -> SupervisorResult<bool> {
        let key = key.to_string();
        self.inner
            .locks
            .with_lock(name, async {
                self.inner
                    .registry
                    .update(name, move |app| Ok(app.env.remove(&key).is_some()))
                    .await
            })
            .await
    }

    /// Remove an app. A running app is refused unless `force` is set, in
    /// which case it is stopped first.
    #[instrument(skip(self), fields(app = %name))]
    pub async fn remove(&self, name: &str, opts: RemoveOptions) -> SupervisorResult<()> {
        self.inner
            .locks
            .with_lock(name, async {
                let app = self.inner.registry.require(name).await?;
                let live = self.inner.supervisor.status(name).await?;
                if live.alive {
                    if !opts.force {
                        return Err(SupervisorError::StillRunning {
                            name: name.to_string(),
                        });
                    }
                    self.inner.supervisor.stop(name).await?;
                }

                self.inner.scheduler.clear_app(name);

                if opts.delete_files {
                    self.delete_files(&app).await;
                }

                self.inner.registry.delete(name).await?;
                info!(delete_files = opts.delete_files, "app removed");
                Ok(())
            })
            .await
    }

    async fn delete_files(&self, app: &AppRecord) {
        match self.inner.deployer.resolve_directory(&app.directory) {
            Ok(dir) => remove_path(&dir, true).await,
            Err(e) => warn!(app = %app.name, error = %e, "not deleting directory"),
        }
        let logs = self.inner.supervisor.log_paths(&app.name);
        remove_path(&logs.out, false).await;
        remove_path(&logs.err, false).await;
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub async fn start(&self, name: &str) -> SupervisorResult<u32> {
        self.inner
            .locks
            .with_lock(name, self.inner.supervisor.start(name))
            .await
    }

    pub async fn stop(&self, name: &str) -> SupervisorResult<StopOutcome> {
        self.inner
            .locks
            .with_lock(name, self.inner.supervisor.stop(name))
            .await
    }

    pub async fn restart(&self, name: &str) -> SupervisorResult<u32> {
        self.inner
            .locks
            .with_lock(name, self.inner.supervisor.restart(name))
            .await
    }

    /// Fetch and build, then restart if asked.
    pub async fn deploy(&self, name: &str, restart: bool) -> SupervisorResult<DeployOutcome> {
        self.inner
            .locks
            .with_lock(name, async {
                let summary = self
                    .inner
                    .deployer
                    .deploy(name, DeployOptions::default())
                    .await?;
                let pid = if restart {
                    Some(self.inner.supervisor.restart(name).await?)
                } else {
                    None
                };
                Ok(DeployOutcome { summary, pid })
            })
            .await
    }

    /// Stop if running, redeploy, start again if it had been running.
    #[instrument(skip(self), fields(app = %name))]
    pub async fn update(&self, name: &str) -> SupervisorResult<DeployOutcome> {
        self.inner
            .locks
            .with_lock(name, async {
                let app = self.inner.registry.require(name).await?;
                let was_running = app.runtime.is_running() && app.runtime.pid.is_some();
                if was_running {
                    self.inner.supervisor.stop(name).await?;
                }

                let summary = self
                    .inner
                    .deployer
                    .deploy(name, DeployOptions { update_only: true })
                    .await?;

                let pid = if was_running {
                    Some(self.inner.supervisor.start(name).await?)
                } else {
                    None
                };
                Ok(DeployOutcome { summary, pid })
            })
            .await
    }

    /// Run by the webhook route after it has already answered. Every outcome
    /// goes to the notifier.
    pub async fn webhook_deploy(&self, name: &str) {
        self.inner
            .notify
            .send(&format!("Webhook received for \"{}\", starting auto-deploy", name))
            .await;

        let text = match self.update(name).await {
            Ok(outcome) => {
                let mut text = format!("Auto-deploy of \"{}\" finished", name);
                if let Some(pid) = outcome.pid {
                    text.push_str(&format!("\nRestarted with PID {}", pid));
                }
                text.push('\n');
                text.push_str(&clip(&outcome.summary.render(), WEBHOOK_DETAIL_CHARS));
                text
            }
            Err(e) => {
                warn!(app = %name, error = %e, "webhook deploy failed");
                format!("Auto-deploy of \"{}\" failed: {}", name, e)
            }
        };
        self.inner.notify.send(&text).await;
    }

    /// One-off shell command in the app directory, bounded by the scheduler's
    /// command timeout.
    pub async fn run_command(&self, name: &str, command: &str) -> SupervisorResult<ShellOutput> {
        let app = self.inner.registry.require(name).await?;
        shell::run_in_app(&app, command, self.inner.config.scheduler.command_timeout()).await
    }

    // ── Schedules ───────────────────────────────────────────────────────

    /// Persist the auto-restart schedule and apply it. `None`, empty or an
    /// off word disables it; an unparseable schedule is refused.
    pub async fn set_auto_restart(
        &self,
        name: &str,
        schedule: Option<&str>,
    ) -> SupervisorResult<Registration> {
        let stored = checked_schedule(schedule)?;
        self.inner
            .locks
            .with_lock(name, async {
                let stored = stored.clone();
                self.inner
                    .registry
                    .update(name, move |app| {
                        app.cron_schedule = stored;
                        Ok(())
                    })
                    .await
            })
            .await?;
        Ok(self.inner.scheduler.set_auto_restart(name, stored.as_deref()))
    }

    pub async fn add_scheduled_command(
        &self,
        name: &str,
        label: &str,
        schedule: &str,
        command: &str,
    ) -> SupervisorResult<Registration> {
        let label = label.trim();
        if label.is_empty() {
            return Err(SupervisorError::InvalidApp("command label is empty".to_string()));
        }
        if command.trim().is_empty() {
            return Err(SupervisorError::InvalidApp("command is empty".to_string()));
        }
        let schedule = checked_schedule(Some(schedule))?.ok_or_else(|| {
            SupervisorError::InvalidApp("a scheduled command needs a schedule".to_string())
        })?;

        let entry = ScheduledCommand {
            label: label.to_string(),
            schedule: schedule.clone(),
            command: command.to_string(),
        };
        self.inner
            .locks
            .with_lock(name, async {
                self.inner
                    .registry
                    .update(name, move |app| {
                        if app.scheduled_command(&entry.label).is_some() {
                            return Err(SupervisorError::InvalidApp(format!(
                                "label \"{}\" is already used by another command",
                                entry.label
                            )));
                        }
                        app.scheduled_commands.push(entry);
                        Ok(())
                    })
                    .await
            })
            .await?;

        Ok(self.inner.scheduler.set_command(name, label, &schedule, command))
    }

    /// Returns whether a command with that label existed.
    pub async fn remove_scheduled_command(&self, name: &str, label: &str) -> SupervisorResult<bool> {
        let owned = label.to_string();
        let removed = self
            .inner
            .locks
            .with_lock(name, async {
                self.inner
                    .registry
                    .update(name, move |app| {
                        let before = app.scheduled_commands.len();
                        app.scheduled_commands.retain(|c| c.label != owned);
                        Ok(app.scheduled_commands.len() != before)
                    })
                    .await
            })
            .await?;
        self.inner.scheduler.remove_command(name, label);
        Ok(removed)
    }

    /// Set or clear the health check. A URL without a schedule is stored but
    /// only probed on demand.
    pub async fn set_health_check(
        &self,
        name: &str,
        url: Option<&str>,
        schedule: Option<&str>,
    ) -> SupervisorResult<Registration> {
        let url = url.map(str::trim).filter(|u| !u.is_empty()).map(str::to_string);
        if let Some(url) = &url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SupervisorError::InvalidApp(format!(
                    "health check URL must be http(s): {}",
                    url
                )));
            }
        }
        let schedule = checked_schedule(schedule)?;

        let (stored_url, stored_schedule) = (url.clone(), schedule.clone());
        self.inner
            .locks
            .with_lock(name, async {
                self.inner
                    .registry
                    .update(name, move |app| {
                        app.health_check_url = stored_url;
                        app.health_check_schedule = stored_schedule;
                        Ok(())
                    })
                    .await
            })
            .await?;

        Ok(self
            .inner
            .scheduler
            .set_health_check(name, url.as_deref(), schedule.as_deref()))
    }

    pub async fn check_health(&self, name: &str) -> SupervisorResult<HealthReport> {
        self.inner.scheduler.check_health_now(name).await
    }

    // ── Webhook ─────────────────────────────────────────────────────────

    /// Generate and persist a fresh webhook secret.
    pub async fn rotate_webhook_secret(&self, name: &str) -> SupervisorResult<String> {
        let secret = uuid::Uuid::new_v4().simple().to_string();
        let stored = secret.clone();
        self.inner
            .locks
            .with_lock(name, async {
                self.inner
                    .registry
                    .update(name, move |app| {
                        app.webhook_secret = Some(stored);
                        Ok(())
                    })
                    .await
            })
            .await?;
        info!(app = %name, "webhook secret rotated");
        Ok(secret)
    }

    /// Without a secret the webhook route rejects every request for the app.
    pub async fn clear_webhook_secret(&self, name: &str) -> SupervisorResult<()> {
        self.inner
            .locks
            .with_lock(name, async {
                self.inner
                    .registry
                    .update(name, |app| {
                        app.webhook_secret = None;
                        Ok(())
                    })
                    .await
            })
            .await
    }

    /// Effective listener settings: persisted values win over the config file.
    pub async fn webhook_settings(&self) -> SupervisorResult<(bool, u16)> {
        let settings = self.inner.registry.settings().await?;
        let defaults = &self.inner.config.webhook;
        Ok((
            settings.webhook_enabled.unwrap_or(defaults.enabled),
            settings.webhook_port.unwrap_or(defaults.port),
        ))
    }

    /// Persist listener settings without touching a running listener.
    pub async fn configure_webhook(&self, enabled: bool, port: Option<u16>) -> SupervisorResult<Settings> {
        self.inner
            .registry
            .update_settings(move |settings| {
                settings.webhook_enabled = Some(enabled);
                if let Some(port) = port {
                    settings.webhook_port = Some(port);
                }
            })
            .await
    }

    /// Bring the in-process listener in line with the effective settings.
    pub async fn apply_webhook_settings(&self) -> SupervisorResult<Option<SocketAddr>> {
        let (enabled, port) = self.webhook_settings().await?;
        self.inner
            .webhook
            .lock()
            .await
            .reconfigure(enabled, port, self.downgrade())
            .await
            .map_err(SupervisorError::Other)
    }

    /// Persist the settings and reconfigure the listener right away.
    pub async fn set_webhook_listener(
        &self,
        enabled: bool,
        port: Option<u16>,
    ) -> SupervisorResult<Option<SocketAddr>> {
        self.configure_webhook(enabled, port).await?;
        self.apply_webhook_settings().await
    }

    pub async fn webhook_addr(&self) -> Option<SocketAddr> {
        self.inner.webhook.lock().await.local_addr()
    }

    /// Stop timers and the listener. Supervised apps keep running.
    pub async fn shutdown(&self) {
        self.inner.scheduler.shutdown();
        self.inner.webhook.lock().await.stop().await;
    }
}

fn validate_name(name: &str) -> SupervisorResult<()> {
    if !valid_app_name(name) || name.len() > MAX_APP_NAME_LEN {
        return Err(SupervisorError::InvalidApp(format!(
            "app name \"{}\" must be 1-{} characters of letters, digits, '-' or '_'",
            name, MAX_APP_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_repo(repo: &str) -> SupervisorResult<()> {
    if repo == LOCAL_REPO || (valid_repo_url(repo) && !repo.starts_with('-')) {
        return Ok(());
    }
    Err(SupervisorError::InvalidApp(format!(
        "repo must be a git URL or \"{}\", got \"{}\"",
        LOCAL_REPO, repo
    )))
}

fn validate_branch(branch: &str) -> SupervisorResult<()> {
    if valid_branch(branch) {
        Ok(())
    } else {
        Err(SupervisorError::InvalidApp(format!("invalid branch name \"{}\"", branch)))
    }
}

fn validate_env_key(key: &str) -> SupervisorResult<()> {
    if valid_env_key(key) {
        Ok(())
    } else {
        Err(SupervisorError::InvalidApp(format!("invalid environment variable name \"{}\"", key)))
    }
}

/// Normalize a schedule for storage: `None` when disabled, the trimmed text
/// when valid, `InvalidApp` otherwise.
fn checked_schedule(schedule: Option<&str>) -> SupervisorResult<Option<String>> {
    match parse_schedule(schedule) {
        ParsedSchedule::Disabled => Ok(None),
        ParsedSchedule::Valid(_) => Ok(schedule.map(|s| s.trim().to_string())),
        ParsedSchedule::Invalid { schedule, reason } => Err(SupervisorError::InvalidApp(format!(
            "invalid cron schedule \"{}\": {}",
            schedule, reason
        ))),
    }
}

async fn remove_path(path: &Path, directory: bool) {
    let result = if directory {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => info!(path = %path.display(), "deleted"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use tempfile::{TempDir, tempdir};

    async fn orchestrator() -> (TempDir, Orchestrator) {
        let dir = tempdir().unwrap();
        let paths = Paths::under(dir.path());
        let orch = Orchestrator::open(paths, DeckhandConfig::default(), NotifyHub::log_only())
            .await
            .unwrap();
        (dir, orch)
    }

    fn local(name: &str) -> NewApp {
        NewApp {
            name: name.to_string(),
            repo: LOCAL_REPO.to_string(),
            start_command: Some("sleep 30".to_string()),
            ..NewApp::default()
        }
    }

    #[tokio::test]
    async fn test_add_app_applies_defaults() {
        let (dir, orch) = orchestrator().await;
        let app = orch
            .add_app(NewApp {
                name: "api".into(),
                repo: "https://example.com/acme/api.git".into(),
                ..NewApp::default()
            })
            .await
            .unwrap();
        assert_eq!(app.branch, "main");
        assert_eq!(app.install_command, "npm install");
        assert_eq!(app.start_command, "npm start");
        assert_eq!(app.directory, dir.path().join("deployments").join("api"));

        let err = orch.add_app(local("api")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_add_app_validation() {
        let (_dir, orch) = orchestrator().await;
        let too_long = "x".repeat(33);
        for bad in ["", "has space", "../up", too_long.as_str()] {
            let err = orch.add_app(local(bad)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidApp, "name {bad:?}");
        }
        let mut bad_repo = local("api");
        bad_repo.repo = "--upload-pack=touch /tmp/x".into();
        assert_eq!(orch.add_app(bad_repo).await.unwrap_err().kind(), ErrorKind::InvalidApp);

        let mut bad_branch = local("api");
        bad_branch.branch = Some("-x".into());
        assert_eq!(orch.add_app(bad_branch).await.unwrap_err().kind(), ErrorKind::InvalidApp);
    }

    #[tokio::test]
    async fn test_env_set_and_unset() {
        let (_dir, orch) = orchestrator().await;
        orch.add_app(local("api")).await.unwrap();
        let app = orch.set_env("api", "PORT", "8080").await.unwrap();
        assert_eq!(app.env.get("PORT").map(String::as_str), Some("8080"));
        assert!(orch.unset_env("api", "PORT").await.unwrap());
        assert!(!orch.unset_env("api", "PORT").await.unwrap());
        assert_eq!(
            orch.set_env("api", "BAD-KEY", "x").await.unwrap_err().kind(),
            ErrorKind::InvalidApp
        );
    }

    #[tokio::test]
    async fn test_auto_restart_schedule_is_validated_and_persisted() {
        let (_dir, orch) = orchestrator().await;
        orch.add_app(local("api")).await.unwrap();

        let err = orch.set_auto_restart("api", Some("whenever")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidApp);
        assert_eq!(orch.get_app("api").await.unwrap().unwrap().cron_schedule, None);

        let reg = orch.set_auto_restart("api", Some(" 0 4 * * * ")).await.unwrap();
        assert_eq!(reg, Registration::Registered);
        let app = orch.get_app("api").await.unwrap().unwrap();
        assert_eq!(app.cron_schedule.as_deref(), Some("0 4 * * *"));

        let reg = orch.set_auto_restart("api", Some("off")).await.unwrap();
        assert_eq!(reg, Registration::Disabled);
        assert_eq!(orch.get_app("api").await.unwrap().unwrap().cron_schedule, None);
        assert!(orch.scheduler().timers().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_command_labels_are_unique() {
        let (_dir, orch) = orchestrator().await;
        orch.add_app(local("api")).await.unwrap();
        orch.add_scheduled_command("api", "backup", "0 3 * * *", "echo hi")
            .await
            .unwrap();
        let err = orch
            .add_scheduled_command("api", "backup", "0 4 * * *", "echo again")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidApp);
        assert_eq!(orch.scheduler().timers().len(), 1);

        assert!(orch.remove_scheduled_command("api", "backup").await.unwrap());
        assert!(!orch.remove_scheduled_command("api", "backup").await.unwrap());
        assert!(orch.scheduler().timers().is_empty());
        assert!(orch.get_app("api").await.unwrap().unwrap().scheduled_commands.is_empty());
    }

    #[tokio::test]
    async fn test_rotate_and_clear_secret() {
        let (_dir, orch) = orchestrator().await;
        orch.add_app(local("api")).await.unwrap();
        let first = orch.rotate_webhook_secret("api").await.unwrap();
        let second = orch.rotate_webhook_secret("api").await.unwrap();
        assert_eq!(first.len(), 32);
        assert_ne!(first, second);
        assert_eq!(
            orch.get_app("api").await.unwrap().unwrap().webhook_secret,
            Some(second)
        );
        orch.clear_webhook_secret("api").await.unwrap();
        assert_eq!(orch.get_app("api").await.unwrap().unwrap().webhook_secret, None);
    }

    #[tokio::test]
    async fn test_remove_running_requires_force() {
        let (dir, orch) = orchestrator().await;
        orch.add_app(local("api")).await.unwrap();
        let app_dir = dir.path().join("deployments").join("api");
        std::fs::create_dir_all(&app_dir).unwrap();

        orch.start("api").await.unwrap();
        let err = orch.remove("api", RemoveOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StillRunning);

        orch.remove(
            "api",
            RemoveOptions {
                delete_files: true,
                force: true,
            },
        )
        .await
        .unwrap();
        assert!(orch.get_app("api").await.unwrap().is_none());
        assert!(!app_dir.exists());
        assert!(!dir.path().join("logs").join("api.out.log").exists());
    }

    #[tokio::test]
    async fn test_update_restarts_only_running_apps() {
        let (dir, orch) = orchestrator().await;
        orch.add_app(local("api")).await.unwrap();
        std::fs::create_dir_all(dir.path().join("deployments").join("api")).unwrap();
        orch.edit_app(
            "api",
            AppPatch {
                install_command: Some(String::new()),
                ..AppPatch::default()
            },
        )
        .await
        .unwrap();

        let outcome = orch.update("api").await.unwrap();
        assert_eq!(outcome.pid, None);
        assert!(!orch.status("api").await.unwrap().alive);

        let first = orch.start("api").await.unwrap();
        let outcome = orch.update("api").await.unwrap();
        let second = outcome.pid.unwrap();
        assert_ne!(first, second);
        assert!(orch.status("api").await.unwrap().alive);
        orch.stop("api").await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_is_busy_while_locked() {
        let (_dir, orch) = orchestrator().await;
        orch.add_app(local("api")).await.unwrap();
        let _guard = orch.locks().guard("api").unwrap();
        assert_eq!(orch.start("api").await.unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(orch.update("api").await.unwrap_err().kind(), ErrorKind::Busy);
        // reads never lock
        assert!(orch.get_app("api").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_webhook_settings_fall_back_to_config() {
        let (_dir, orch) = orchestrator().await;
        assert_eq!(orch.webhook_settings().await.unwrap(), (false, 9876));
        orch.configure_webhook(true, Some(9100)).await.unwrap();
        assert_eq!(orch.webhook_settings().await.unwrap(), (true, 9100));
        orch.configure_webhook(false, None).await.unwrap();
        assert_eq!(orch.webhook_settings().await.unwrap(), (false, 9100));
        assert_eq!(orch.apply_webhook_settings().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_listener_starts_and_stops() {
        let (_dir, orch) = orchestrator().await;
        let addr = orch.set_webhook_listener(true, Some(0)).await.unwrap().unwrap();
        assert_eq!(orch.webhook_addr().await, Some(addr));
        assert_eq!(orch.set_webhook_listener(false, None).await.unwrap(), None);
        assert_eq!(orch.webhook_addr().await, None);
    }
}
