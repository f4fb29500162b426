//! Cron-driven timers.
//!
//! Three kinds of timer exist, keyed by [`TimerKey`]: auto-restart (one per
//! app), scheduled commands (one per app and label) and health checks (one
//! per app). Each timer is a task that sleeps until the next cron occurrence
//! and then spawns its job, so replacing or cancelling a timer never
//! interrupts a job that is already running.
//!
//! A schedule either parses as cron and registers, or it deregisters whatever
//! timer held that key. Invalid schedules are logged, never raised.

pub mod cron;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use croner::Cron;
use deckhand_common::AppRecord;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::errors::{SupervisorError, SupervisorResult};
use crate::health::{HealthProbe, HealthReport};
use crate::locks::LockManager;
use crate::notify::NotifyHub;
use crate::registry::AppRegistry;
use crate::shell;
use crate::supervisor::ProcessSupervisor;

pub use self::cron::{ParsedSchedule, parse_schedule};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    AutoRestart(String),
    Command { app: String, label: String },
    HealthCheck(String),
}

impl TimerKey {
    pub fn app(&self) -> &str {
        match self {
            TimerKey::AutoRestart(app) | TimerKey::HealthCheck(app) => app,
            TimerKey::Command { app, .. } => app,
        }
    }
}

impl std::fmt::Display for TimerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerKey::AutoRestart(app) => write!(f, "restart:{}", app),
            TimerKey::Command { app, label } => write!(f, "command:{}:{}", app, label),
            TimerKey::HealthCheck(app) => write!(f, "health:{}", app),
        }
    }
}

/// What happened to a timer when a schedule was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// The schedule was empty or switched off; any previous timer is gone.
    Disabled,
    /// The schedule did not parse; any previous timer is gone.
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Job {
    AutoRestart,
    Command(String),
    HealthCheck(String),
}

struct Timer {
    schedule: String,
    job: Job,
    generation: u64,
    handle: JoinHandle<()>,
}

/// A live timer, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerInfo {
    pub key: TimerKey,
    pub schedule: String,
    pub generation: u64,
}

#[derive(Default)]
struct Timers {
    map: HashMap<TimerKey, Timer>,
    next_generation: u64,
}

struct Inner {
    registry: AppRegistry,
    supervisor: ProcessSupervisor,
    locks: LockManager,
    notify: NotifyHub,
    probe: HealthProbe,
    config: SchedulerConfig,
    timers: Mutex<Timers>,
}

impl Inner {
    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        registry: AppRegistry,
        supervisor: ProcessSupervisor,
        locks: LockManager,
        notify: NotifyHub,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                supervisor,
                locks,
                notify,
                probe: HealthProbe::new(config.health_timeout()),
                config,
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    pub fn set_auto_restart(&self, app: &str, schedule: Option<&str>) -> Registration {
        self.apply(TimerKey::AutoRestart(app.to_string()), schedule, Job::AutoRestart)
    }

    pub fn set_command(&self, app: &str, label: &str, schedule: &str, command: &str) -> Registration {
        self.apply(
            TimerKey::Command {
                app: app.to_string(),
                label: label.to_string(),
            },
            Some(schedule),
            Job::Command(command.to_string()),
        )
    }

    pub fn remove_command(&self, app: &str, label: &str) {
        self.remove(&TimerKey::Command {
            app: app.to_string(),
            label: label.to_string(),
        });
    }

    /// Health checks need both a URL and a schedule.
    pub fn set_health_check(&self, app: &str, url: Option<&str>, schedule: Option<&str>) -> Registration {
        let key = TimerKey::HealthCheck(app.to_string());
        match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => self.apply(key, schedule, Job::HealthCheck(url.to_string())),
            None => {
                self.remove(&key);
                Registration::Disabled
            }
        }
    }

    /// Drop every timer belonging to `app`.
    pub fn clear_app(&self, app: &str) {
        let mut timers = self.inner.timers();
        timers.map.retain(|key, timer| {
            let keep = key.app() != app;
            if !keep {
                timer.handle.abort();
            }
            keep
        });
    }

    /// Make the live timers match `apps`. Timers whose schedule and job are
    /// unchanged are left running; everything else is replaced or removed.
    pub fn reconcile(&self, apps: &BTreeMap<String, AppRecord>) {
        let mut desired: HashMap<TimerKey, (Option<String>, Job)> = HashMap::new();
        for (name, app) in apps {
            if app.cron_schedule.is_some() {
                desired.insert(
                    TimerKey::AutoRestart(name.clone()),
                    (app.cron_schedule.clone(), Job::AutoRestart),
                );
            }
            for command in &app.scheduled_commands {
                desired.insert(
                    TimerKey::Command {
                        app: name.clone(),
                        label: command.label.clone(),
                    },
                    (Some(command.schedule.clone()), Job::Command(command.command.clone())),
                );
            }
            if let Some(url) = app.health_check_url.as_deref().filter(|u| !u.trim().is_empty()) {
                desired.insert(
                    TimerKey::HealthCheck(name.clone()),
                    (app.health_check_schedule.clone(), Job::HealthCheck(url.trim().to_string())),
                );
            }
        }

        let stale: Vec<TimerKey> = self
            .inner
            .timers()
            .map
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            self.remove(&key);
        }

        for (key, (schedule, job)) in desired {
            self.apply(key, schedule.as_deref(), job);
        }
    }

    /// Load every app from the registry and [`reconcile`](Self::reconcile).
    pub async fn reconcile_from_registry(&self) -> SupervisorResult<usize> {
        let apps = self.inner.registry.get_all().await?;
        self.reconcile(&apps);
        Ok(self.inner.timers().map.len())
    }

    /// Periodically re-read schedules so edits made by other processes take
    /// effect.
    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let period = self.inner.config.reconcile_interval();
        tokio::spawn(async move {
            if period.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.reconcile_from_registry().await {
                    warn!(error = %e, "schedule reconcile failed");
                }
            }
        })
    }

    pub fn timers(&self) -> Vec<TimerInfo> {
        let mut infos: Vec<TimerInfo> = self
            .inner
            .timers()
            .map
            .iter()
            .map(|(key, timer)| TimerInfo {
                key: key.clone(),
                schedule: timer.schedule.clone(),
                generation: timer.generation,
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    pub fn shutdown(&self) {
        let mut timers = self.inner.timers();
        for (_, timer) in timers.map.drain() {
            timer.handle.abort();
        }
    }

    /// Probe an app's health-check URL right now. Never alerts.
    pub async fn check_health_now(&self, app: &str) -> SupervisorResult<HealthReport> {
        let record = self.inner.registry.require(app).await?;
        let url = record
            .health_check_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                SupervisorError::InvalidApp(format!("app \"{}\" has no health check URL", app))
            })?;
        Ok(self.inner.probe.check(&url).await)
    }

    fn remove(&self, key: &TimerKey) {
        if let Some(timer) = self.inner.timers().map.remove(key) {
            timer.handle.abort();
            debug!(timer = %key, "timer removed");
        }
    }

    fn apply(&self, key: TimerKey, schedule: Option<&str>, job: Job) -> Registration {
        let pattern = match parse_schedule(schedule) {
            ParsedSchedule::Valid(pattern) => pattern,
            ParsedSchedule::Disabled => {
                self.remove(&key);
                return Registration::Disabled;
            }
            ParsedSchedule::Invalid { schedule, reason } => {
                warn!(timer = %key, %schedule, %reason, "invalid cron schedule, timer not registered");
                self.remove(&key);
                return Registration::Invalid;
            }
        };
        let schedule = schedule.unwrap_or_default().trim().to_string();

        let mut timers = self.inner.timers();
        if let Some(existing) = timers.map.get(&key) {
            if existing.schedule == schedule && existing.job == job {
                return Registration::Registered;
            }
        }

        timers.next_generation += 1;
        let generation = timers.next_generation;
        let handle = spawn_timer(Arc::clone(&self.inner), key.clone(), pattern, job.clone());
        if let Some(old) = timers.map.insert(
            key.clone(),
            Timer {
                schedule: schedule.clone(),
                job,
                generation,
                handle,
            },
        ) {
            old.handle.abort();
        }
        info!(timer = %key, %schedule, "timer registered");
        Registration::Registered
    }
}

fn spawn_timer(inner: Arc<Inner>, key: TimerKey, pattern: Cron, job: Job) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(wait) = cron::until_next(&pattern, &Local::now()) else {
                warn!(timer = %key, "schedule has no future occurrence");
                return;
            };
            tokio::time::sleep(wait).await;
            tokio::spawn(run_job(Arc::clone(&inner), key.clone(), job.clone()));
            // Step past the occurrence that just fired.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
}

async fn run_job(inner: Arc<Inner>, key: TimerKey, job: Job) {
    let app = key.app().to_string();
    match job {
        Job::AutoRestart => auto_restart(&inner, &app).await,
        Job::Command(command) => {
            let TimerKey::Command { label, .. } = &key else {
                return;
            };
            scheduled_command(&inner, &app, label, &command).await;
        }
        Job::HealthCheck(url) => health_check(&inner, &app, &url).await,
    }
}

async fn auto_restart(inner: &Inner, app: &str) {
    let record = match inner.registry.get(app).await {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            warn!(app, error = %e, "auto-restart could not read registry");
            return;
        }
    };
    if !record.runtime.is_running() {
        debug!(app, "auto-restart tick skipped, app not running");
        return;
    }

    let Ok(_guard) = inner.locks.guard(app) else {
        info!(app, "auto-restart tick skipped, app busy");
        return;
    };
    match inner.supervisor.restart(app).await {
        Ok(pid) => info!(app, pid, "auto-restarted"),
        Err(e) => {
            warn!(app, error = %e, "auto-restart failed");
            inner
                .notify
                .send(&format!("Auto-restart of \"{}\" failed: {}", app, e))
                .await;
        }
    }
}

async fn scheduled_command(inner: &Inner, app: &str, label: &str, command: &str) {
    let record = match inner.registry.get(app).await {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            warn!(app, label, error = %e, "scheduled command could not read registry");
            return;
        }
    };
    info!(app, label, command, "running scheduled command");
    match shell::run_in_app(&record, command, inner.config.command_timeout()).await {
        Ok(_) => debug!(app, label, "scheduled command finished"),
        Err(e) => warn!(app, label, error = %e, "scheduled command failed"),
    }
}

async fn health_check(inner: &Inner, app: &str, url: &str) {
    let report = inner.probe.check(url).await;
    if report.ok {
        debug!(app, url, "health check passed");
        return;
    }
    warn!(app, url, reason = ?report.failure_reason(), "health check failed");

    let muted = matches!(inner.registry.get(app).await, Ok(Some(record)) if record.mute_alerts);
    if !muted {
        inner.notify.send(&report.alert_text(app)).await;
    }
}
