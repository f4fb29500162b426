//! Process supervision.
//!
//! Each app runs as `sh -c <startCommand>` in a process group of its own, with
//! stdout/stderr appended to `<logs>/<name>.out.log` and `.err.log`. The
//! persisted `runtime` block is the source of truth; the OS is consulted
//! through [`process::is_alive`].
//!
//! Lifecycle: `stopped -> starting -> running -> stopping -> stopped`. The
//! `starting`/`stopping` phases are in-memory only and keep the crash monitor
//! away from apps that are mid-transition.
//!
//! An exit observed outside a tracked stop, and a dead pid found by the crash
//! monitor, both go through [`ProcessSupervisor::mark_crashed`], a
//! compare-and-set on the persisted pid. Whichever gets there first records
//! the exit (the real exit code when one was observed, `CRASH_DETECTED`
//! otherwise) and publishes [`SupervisorEvent::Crashed`]; the other is a
//! no-op.

pub mod logs;
pub mod process;

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use deckhand_common::{ExitOutcome, RunStatus};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::errors::{ErrorKind, SupervisorError, SupervisorResult};
use crate::locks::LockManager;
use crate::registry::AppRegistry;

pub use logs::{LogPaths, LogTail};
use process::Signal;

/// Something that happened to a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started {
        app: String,
        pid: u32,
    },
    Stopped {
        app: String,
        pid: Option<u32>,
    },
    /// The process died without being asked to.
    Crashed {
        app: String,
        pid: u32,
        exit_code: Option<i32>,
        signal: Option<String>,
    },
}

impl SupervisorEvent {
    pub fn app(&self) -> &str {
        match self {
            SupervisorEvent::Started { app, .. }
            | SupervisorEvent::Stopped { app, .. }
            | SupervisorEvent::Crashed { app, .. } => app,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    /// The pid was already dead, so no signal was sent.
    pub already_stopped: bool,
}

/// Liveness as seen by the OS, which may disagree with the persisted runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveStatus {
    pub alive: bool,
    pub pid: Option<u32>,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Phase {
    Starting,
    Stopping,
}

#[derive(Default)]
struct Phases(HashMap<(String, Phase), usize>);

struct Inner {
    registry: AppRegistry,
    locks: LockManager,
    logs_dir: PathBuf,
    config: SupervisorConfig,
    phases: Mutex<Phases>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Inner {
    fn phases(&self) -> std::sync::MutexGuard<'_, Phases> {
        self.phases.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_phase(&self, name: &str, phase: Phase) -> bool {
        self.phases().0.contains_key(&(name.to_string(), phase))
    }

    fn publish(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Removes its transient phase flag on drop.
struct PhaseGuard {
    inner: Arc<Inner>,
    key: (String, Phase),
}

impl PhaseGuard {
    fn enter(inner: &Arc<Inner>, name: &str, phase: Phase) -> Self {
        let key = (name.to_string(), phase);
        *inner.phases().0.entry(key.clone()).or_default() += 1;
        Self {
            inner: Arc::clone(inner),
            key,
        }
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        let mut phases = self.inner.phases();
        if let Some(count) = phases.0.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                phases.0.remove(&self.key);
            }
        }
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: AppRegistry,
        locks: LockManager,
        logs_dir: impl Into<PathBuf>,
        config: SupervisorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                registry,
                locks,
                logs_dir: logs_dir.into(),
                config,
                phases: Mutex::new(Phases::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn logs_dir(&self) -> &Path {
        &self.inner.logs_dir
    }

    pub fn log_paths(&self, name: &str) -> LogPaths {
        LogPaths::for_app(&self.inner.logs_dir, name)
    }

    pub fn is_transitioning(&self, name: &str) -> bool {
        self.inner.in_phase(name, Phase::Starting) || self.inner.in_phase(name, Phase::Stopping)
    }

    /// OS view of the app's persisted pid.
    pub async fn status(&self, name: &str) -> SupervisorResult<LiveStatus> {
        let app = self.inner.registry.require(name).await?;
        let alive = app.runtime.pid.is_some_and(process::is_alive);
        Ok(LiveStatus {
            alive,
            pid: if alive { app.runtime.pid } else { None },
            status: if alive { RunStatus::Running } else { RunStatus::Stopped },
        })
    }

    /// Launch the app and return its pid.
    pub async fn start(&self, name: &str) -> SupervisorResult<u32> {
        let _phase = PhaseGuard::enter(&self.inner, name, Phase::Starting);
        let app = self.inner.registry.require(name).await?;

        if let Some(pid) = app.runtime.pid.filter(|pid| process::is_alive(*pid)) {
            return Err(SupervisorError::AlreadyRunning {
                name: name.to_string(),
                pid,
            });
        }
        if !tokio::fs::metadata(&app.directory)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(SupervisorError::NotDeployed {
                name: name.to_string(),
                directory: app.directory.clone(),
            });
        }
        if app.start_command.trim().is_empty() {
            return Err(SupervisorError::InvalidApp(format!(
                "app \"{}\" has no start command",
                name
            )));
        }

        let paths = self.log_paths(name);
        let (out, err) = open_log_files(&self.inner.logs_dir, &paths)
            .await
            .map_err(|source| SupervisorError::SpawnFailed {
                command: app.start_command.clone(),
                source,
            })?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&app.start_command)
            .current_dir(&app.directory)
            .envs(&app.env)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .process_group(0)
            .spawn()
            .map_err(|source| SupervisorError::SpawnFailed {
                command: app.start_command.clone(),
                source,
            })?;

        let Some(pid) = child.id() else {
            return Err(SupervisorError::SpawnFailed {
                command: app.start_command.clone(),
                source: std::io::Error::other("child exited before its pid was read"),
            });
        };

        let now = Utc::now();
        if let Err(e) = self
            .inner
            .registry
            .update_runtime(name, move |rt| rt.mark_running(pid, pid, now))
            .await
        {
            error!(app = %name, pid, error = %e, "failed to persist start, killing process");
            process::terminate(pid, Some(pid), Signal::Kill);
            let _ = child.wait().await;
            return Err(e);
        }

        tokio::spawn(observe_exit(Arc::clone(&self.inner), name.to_string(), child, pid));

        info!(app = %name, pid, command = %app.start_command, "started");
        self.inner.publish(SupervisorEvent::Started {
            app: name.to_string(),
            pid,
        });
        Ok(pid)
    }

    /// Terminate the app: SIGTERM to the group, then SIGKILL once the grace
    /// period runs out.
    pub async fn stop(&self, name: &str) -> SupervisorResult<StopOutcome> {
        let _phase = PhaseGuard::enter(&self.inner, name, Phase::Stopping);
        let app = self.inner.registry.require(name).await?;

        let Some(pid) = app.runtime.pid.filter(|pid| process::is_alive(*pid)) else {
            let now = Utc::now();
            self.inner
                .registry
                .update_runtime(name, move |rt| rt.mark_stopped(now))
                .await?;
            debug!(app = %name, "stop requested but process already gone");
            return Ok(StopOutcome {
                already_stopped: true,
            });
        };
        let pgid = app.runtime.pgid;

        process::terminate(pid, pgid, Signal::Term);

        let grace = self.inner.config.stop_grace();
        let poll = self.inner.config.stop_poll();
        let started = Instant::now();
        while process::is_alive(pid) && started.elapsed() < grace {
            tokio::time::sleep(poll).await;
        }

        if process::is_alive(pid) {
            warn!(app = %name, pid, grace_ms = grace.as_millis() as u64, "did not exit after SIGTERM, sending SIGKILL");
            process::terminate(pid, pgid, Signal::Kill);
            let deadline = Instant::now() + poll * 4;
            while process::is_alive(pid) && Instant::now() < deadline {
                tokio::time::sleep(poll / 4).await;
            }
        } else if let Some(pgid) = pgid {
            // Leftover group members (e.g. children that ignored SIGTERM).
            process::signal_group(pgid, Signal::Kill);
        }

        let now = Utc::now();
        self.inner
            .registry
            .update(name, move |app| {
                if app.runtime.pid.is_none() || app.runtime.pid == Some(pid) {
                    app.runtime.mark_stopped(now);
                }
                Ok(())
            })
            .await?;

        info!(app = %name, pid, "stopped");
        self.inner.publish(SupervisorEvent::Stopped {
            app: name.to_string(),
            pid: Some(pid),
        });
        Ok(StopOutcome {
            already_stopped: false,
        })
    }

    /// Stop then start. Not atomic on its own; callers hold the app lock.
    pub async fn restart(&self, name: &str) -> SupervisorResult<u32> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Record a crash if `pid` is still the persisted running pid of `name`.
    /// Returns whether this call recorded it.
    pub async fn mark_crashed(
        &self,
        name: &str,
        pid: u32,
        exit_code: Option<i32>,
        signal: Option<String>,
    ) -> SupervisorResult<bool> {
        mark_crashed(&self.inner, name, pid, exit_code, signal).await
    }

    /// One sweep of the crash monitor. Returns the number of crashes recorded.
    pub async fn check_crashes(&self) -> usize {
        let apps = match self.inner.registry.get_all().await {
            Ok(apps) => apps,
            Err(e) => {
                warn!(error = %e, "crash check could not read registry");
                return 0;
            }
        };

        let mut crashed = 0;
        for (name, app) in apps {
            if self.is_transitioning(&name) || app.runtime.status != RunStatus::Running {
                continue;
            }
            let Some(pid) = app.runtime.pid else {
                continue;
            };
            if process::is_alive(pid) {
                continue;
            }
            // Another process is mid-operation on this app (a one-shot stop
            // or restart). Its outcome lands in the registry; look again on
            // the next sweep.
            if self.inner.locks.is_held_elsewhere(&name) {
                debug!(app = %name, pid, "pid gone while app is locked elsewhere, deferring");
                continue;
            }
            match mark_crashed(&self.inner, &name, pid, None, None).await {
                Ok(true) => crashed += 1,
                Ok(false) => {}
                Err(e) => warn!(app = %name, error = %e, "failed to record crash"),
            }
        }
        crashed
    }

    /// Run [`check_crashes`](Self::check_crashes) on the configured interval.
    pub fn spawn_crash_monitor(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        let period = self.inner.config.crash_check_interval();
        tokio::spawn(async move {
            if period.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                supervisor.check_crashes().await;
            }
        })
    }

    /// Reconcile every persisted runtime with the OS after a daemon restart.
    pub async fn recover_state(&self) -> SupervisorResult<()> {
        for (name, app) in self.inner.registry.get_all().await? {
            let alive = app.runtime.pid.is_some_and(process::is_alive);
            let result = self
                .inner
                .registry
                .update_runtime(&name, move |rt| {
                    if alive {
                        rt.status = RunStatus::Running;
                    } else {
                        rt.status = RunStatus::Stopped;
                        rt.pid = None;
                        rt.pgid = None;
                    }
                })
                .await;
            match result {
                Ok(_) => debug!(app = %name, alive, "recovered runtime state"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(app = %name, error = %e, "failed to recover runtime state"),
            }
        }
        Ok(())
    }

    /// Tail of the app's stdout and stderr. `lines` is clamped to `1..=500`.
    pub async fn read_logs(&self, name: &str, lines: usize) -> SupervisorResult<LogTail> {
        let paths = self.log_paths(name);
        logs::read_tail(&paths, lines.clamp(1, 500))
            .await
            .map_err(|e| SupervisorError::Other(anyhow::Error::new(e).context("failed to read logs")))
    }
}

async fn open_log_files(
    logs_dir: &Path,
    paths: &LogPaths,
) -> std::io::Result<(std::fs::File, std::fs::File)> {
    tokio::fs::create_dir_all(logs_dir).await?;
    let open = |path: PathBuf| async move {
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
    };
    let out = open(paths.out.clone()).await?.into_std().await;
    let err = open(paths.err.clone()).await?.into_std().await;
    Ok((out, err))
}

async fn observe_exit(inner: Arc<Inner>, name: String, mut child: Child, pid: u32) {
    let (exit_code, signal) = match child.wait().await {
        Ok(status) => (status.code(), status.signal().map(process::signal_name)),
        Err(e) => {
            warn!(app = %name, pid, error = %e, "failed to wait for process");
            (None, None)
        }
    };

    if inner.in_phase(&name, Phase::Stopping) {
        let now = Utc::now();
        let recorded_signal = signal.clone();
        let result = inner
            .registry
            .update(&name, move |app| {
                // A newer process may already own the runtime.
                if app.runtime.pid.is_none() || app.runtime.pid == Some(pid) {
                    app.runtime.mark_stopped(now);
                    app.runtime.last_exit_code = exit_code.map(ExitOutcome::Code);
                    app.runtime.last_signal = recorded_signal;
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            debug!(app = %name, pid, error = %e, "could not record exit");
        }
        debug!(app = %name, pid, ?exit_code, ?signal, "exited during stop");
        return;
    }

    if let Err(e) = mark_crashed(&inner, &name, pid, exit_code, signal).await {
        debug!(app = %name, pid, error = %e, "could not record crash");
    }
}

async fn mark_crashed(
    inner: &Arc<Inner>,
    name: &str,
    pid: u32,
    exit_code: Option<i32>,
    signal: Option<String>,
) -> SupervisorResult<bool> {
    let now = Utc::now();
    let recorded_signal = signal.clone();
    let recorded = inner
        .registry
        .update(name, move |app| {
            let rt = &mut app.runtime;
            if rt.status != RunStatus::Running || rt.pid != Some(pid) {
                return Ok(false);
            }
            rt.mark_stopped(now);
            // The poller never knows the status; the exit observer usually does.
            rt.last_exit_code = Some(exit_code.map_or_else(ExitOutcome::crash_detected, ExitOutcome::Code));
            rt.last_signal = recorded_signal;
            Ok(true)
        })
        .await?;

    if recorded {
        warn!(app = %name, pid, ?exit_code, ?signal, "crash detected");
        inner.publish(SupervisorEvent::Crashed {
            app: name.to_string(),
            pid,
            exit_code,
            signal,
        });
    }
    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deckhand_common::AppRecord;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        registry: AppRegistry,
        supervisor: ProcessSupervisor,
        app_dir: PathBuf,
    }

    async fn fixture(start_command: &str, config: SupervisorConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let registry = AppRegistry::open(dir.path().join("data/db.json")).await.unwrap();
        let app_dir = dir.path().join("deployments/api");
        std::fs::create_dir_all(&app_dir).unwrap();

        let mut app = AppRecord::new("api", "local", "main", app_dir.clone(), Utc::now());
        app.start_command = start_command.to_string();
        app.env.insert("DECKHAND_GREETING".into(), "hi from env".into());
        registry.insert(app).await.unwrap();

        let supervisor = ProcessSupervisor::new(
            registry.clone(),
            LockManager::in_dir(dir.path().join("data/locks")),
            dir.path().join("logs"),
            config,
        );
        Fixture {
            _dir: dir,
            registry,
            supervisor,
            app_dir,
        }
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            crash_check_interval_secs: 10,
            stop_grace_ms: 2000,
            stop_poll_ms: 50,
        }
    }

    async fn wait_for_crash(rx: &mut broadcast::Receiver<SupervisorEvent>) -> SupervisorEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if matches!(event, SupervisorEvent::Crashed { .. }) {
                    return event;
                }
            }
        })
        .await
        .expect("no crash event")
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let fx = fixture("sleep 30", fast_config()).await;

        let pid = fx.supervisor.start("api").await.unwrap();
        assert!(process::is_alive(pid));
        let stored = fx.registry.get("api").await.unwrap().unwrap();
        assert_eq!(stored.runtime.status, RunStatus::Running);
        assert_eq!(stored.runtime.pid, Some(pid));
        assert_eq!(stored.runtime.pgid, Some(pid));
        assert!(stored.runtime.last_start_at.is_some());

        let outcome = fx.supervisor.stop("api").await.unwrap();
        assert!(!outcome.already_stopped);
        assert!(!process::is_alive(pid));
        let stored = fx.registry.get("api").await.unwrap().unwrap();
        assert_eq!(stored.runtime.status, RunStatus::Stopped);
        assert!(stored.runtime.pid.is_none());
        assert!(stored.runtime.last_stop_at.is_some());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fx = fixture("sleep 30", fast_config()).await;
        let outcome = fx.supervisor.stop("api").await.unwrap();
        assert!(outcome.already_stopped);

        fx.supervisor.start("api").await.unwrap();
        assert!(!fx.supervisor.stop("api").await.unwrap().already_stopped);
        assert!(fx.supervisor.stop("api").await.unwrap().already_stopped);
    }

    #[tokio::test]
    async fn test_second_start_is_already_running() {
        let fx = fixture("sleep 30", fast_config()).await;
        let pid = fx.supervisor.start("api").await.unwrap();
        let err = fx.supervisor.start("api").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
        assert!(err.to_string().contains(&pid.to_string()));
        fx.supervisor.stop("api").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_without_directory_is_not_deployed() {
        let fx = fixture("sleep 30", fast_config()).await;
        std::fs::remove_dir_all(&fx.app_dir).unwrap();
        let err = fx.supervisor.start("api").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotDeployed);
    }

    #[tokio::test]
    async fn test_start_unknown_app_is_not_found() {
        let fx = fixture("sleep 30", fast_config()).await;
        let err = fx.supervisor.start("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_env_overlay_and_log_capture() {
        let fx = fixture(
            "echo \"$DECKHAND_GREETING\"; echo oops >&2; sleep 30",
            fast_config(),
        )
        .await;
        fx.supervisor.start("api").await.unwrap();

        let mut tail = LogTail {
            out: String::new(),
            err: String::new(),
            out_path: PathBuf::new(),
            err_path: PathBuf::new(),
        };
        for _ in 0..50 {
            tail = fx.supervisor.read_logs("api", 10).await.unwrap();
            if !tail.out.is_empty() && !tail.err.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(tail.out.trim(), "hi from env");
        assert_eq!(tail.err.trim(), "oops");
        assert!(tail.out_path.ends_with("api.out.log"));

        fx.supervisor.stop("api").await.unwrap();
    }

    #[tokio::test]
    async fn test_external_kill_is_crash_detected_exactly_once() {
        let fx = fixture("sleep 30", fast_config()).await;
        let mut events = fx.supervisor.subscribe();
        let pid = fx.supervisor.start("api").await.unwrap();

        process::terminate(pid, Some(pid), Signal::Kill);
        let event = wait_for_crash(&mut events).await;
        match event {
            SupervisorEvent::Crashed { app, pid: crashed, signal, .. } => {
                assert_eq!(app, "api");
                assert_eq!(crashed, pid);
                assert_eq!(signal.as_deref(), Some("SIGKILL"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The poller racing the observer must not record a second crash.
        assert_eq!(fx.supervisor.check_crashes().await, 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        let stored = fx.registry.get("api").await.unwrap().unwrap();
        assert_eq!(stored.runtime.status, RunStatus::Stopped);
        assert!(stored.runtime.pid.is_none());
        assert!(stored.runtime.last_exit_code.unwrap().is_crash_detected());
    }

    #[tokio::test]
    async fn test_poller_detects_dead_pid_of_unowned_process() {
        let fx = fixture("sleep 30", fast_config()).await;
        let mut events = fx.supervisor.subscribe();

        // A pid that is persisted as running but is not our child.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        let now = Utc::now();
        fx.registry
            .update_runtime("api", move |rt| rt.mark_running(dead_pid, dead_pid, now))
            .await
            .unwrap();

        assert_eq!(fx.supervisor.check_crashes().await, 1);
        assert_eq!(fx.supervisor.check_crashes().await, 0);
        let event = wait_for_crash(&mut events).await;
        assert_eq!(event.app(), "api");

        let stored = fx.registry.get("api").await.unwrap().unwrap();
        assert!(stored.runtime.last_exit_code.unwrap().is_crash_detected());
    }

    #[tokio::test]
    async fn test_unexpected_exit_keeps_its_exit_code() {
        let fx = fixture("sleep 0.3; exit 3", fast_config()).await;
        let mut events = fx.supervisor.subscribe();
        let pid = fx.supervisor.start("api").await.unwrap();

        let event = wait_for_crash(&mut events).await;
        assert_eq!(
            event,
            SupervisorEvent::Crashed {
                app: "api".into(),
                pid,
                exit_code: Some(3),
                signal: None,
            }
        );
        let stored = fx.registry.get("api").await.unwrap().unwrap();
        assert_eq!(stored.runtime.status, RunStatus::Stopped);
        assert_eq!(stored.runtime.last_exit_code, Some(ExitOutcome::Code(3)));
        assert!(stored.runtime.pid.is_none());
    }

    #[tokio::test]
    async fn test_poller_defers_app_locked_by_another_process() {
        let fx = fixture("sleep 30", fast_config()).await;
        let locks_dir = fx.registry.path().parent().unwrap().join("locks");
        let other_process = LockManager::in_dir(&locks_dir);

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        let now = Utc::now();
        fx.registry
            .update_runtime("api", move |rt| rt.mark_running(dead_pid, dead_pid, now))
            .await
            .unwrap();

        let guard = other_process.guard("api").unwrap();
        assert_eq!(fx.supervisor.check_crashes().await, 0);
        let stored = fx.registry.get("api").await.unwrap().unwrap();
        assert_eq!(stored.runtime.status, RunStatus::Running);

        drop(guard);
        assert_eq!(fx.supervisor.check_crashes().await, 1);
    }

    #[tokio::test]
    async fn test_stop_records_exit_without_crash() {
        let fx = fixture("sleep 30", fast_config()).await;
        let mut events = fx.supervisor.subscribe();
        fx.supervisor.start("api").await.unwrap();
        fx.supervisor.stop("api").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SupervisorEvent::Crashed { .. }));
        }
        let stored = fx.registry.get("api").await.unwrap().unwrap();
        assert!(!stored
            .runtime
            .last_exit_code
            .is_some_and(|code| code.is_crash_detected()));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let config = SupervisorConfig {
            crash_check_interval_secs: 10,
            stop_grace_ms: 400,
            stop_poll_ms: 50,
        };
        let fx = fixture("trap '' TERM; while true; do sleep 1; done", config).await;
        let pid = fx.supervisor.start("api").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let outcome = fx.supervisor.stop("api").await.unwrap();
        assert!(!outcome.already_stopped);
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(!process::is_alive(pid));
    }

    #[tokio::test]
    async fn test_restart_changes_pid() {
        let fx = fixture("sleep 30", fast_config()).await;
        let first = fx.supervisor.start("api").await.unwrap();
        let second = fx.supervisor.restart("api").await.unwrap();
        assert_ne!(first, second);
        assert!(!process::is_alive(first));
        assert!(process::is_alive(second));

        // The late exit of the first process must not clobber the new runtime.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stored = fx.registry.get("api").await.unwrap().unwrap();
        assert_eq!(stored.runtime.pid, Some(second));
        assert_eq!(stored.runtime.status, RunStatus::Running);
        fx.supervisor.stop("api").await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_state_reconciles_with_os() {
        let fx = fixture("sleep 30", fast_config()).await;

        let mut web = AppRecord::new("web", "local", "main", fx.app_dir.clone(), Utc::now());
        web.runtime.status = RunStatus::Stopped;
        web.runtime.pid = Some(std::process::id());
        fx.registry.insert(web).await.unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        let now = Utc::now();
        fx.registry
            .update_runtime("api", move |rt| rt.mark_running(dead_pid, dead_pid, now))
            .await
            .unwrap();

        fx.supervisor.recover_state().await.unwrap();

        let api = fx.registry.get("api").await.unwrap().unwrap();
        assert_eq!(api.runtime.status, RunStatus::Stopped);
        assert!(api.runtime.pid.is_none());
        let web = fx.registry.get("web").await.unwrap().unwrap();
        assert_eq!(web.runtime.status, RunStatus::Running);
        assert_eq!(web.runtime.pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_status_reflects_os() {
        let fx = fixture("sleep 30", fast_config()).await;
        assert!(!fx.supervisor.status("api").await.unwrap().alive);
        let pid = fx.supervisor.start("api").await.unwrap();
        let status = fx.supervisor.status("api").await.unwrap();
        assert!(status.alive);
        assert_eq!(status.pid, Some(pid));
        fx.supervisor.stop("api").await.unwrap();
    }
}
