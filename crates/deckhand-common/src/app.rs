use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel `repo` value for apps provisioned by uploading files instead of cloning.
pub const LOCAL_REPO: &str = "local";

/// `lastExitCode` marker written when an app died outside a tracked stop.
pub const CRASH_DETECTED: &str = "CRASH_DETECTED";

/// Persisted lifecycle status of an app's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Stopped,
    Running,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Stopped => write!(f, "stopped"),
            RunStatus::Running => write!(f, "running"),
        }
    }
}

/// How the last process exited: a numeric exit code, or a marker such as
/// [`CRASH_DETECTED`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExitOutcome {
    Code(i32),
    Marker(String),
}

impl ExitOutcome {
    pub fn crash_detected() -> Self {
        ExitOutcome::Marker(CRASH_DETECTED.to_string())
    }

    pub fn is_crash_detected(&self) -> bool {
        matches!(self, ExitOutcome::Marker(m) if m == CRASH_DETECTED)
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "{}", code),
            ExitOutcome::Marker(marker) => write!(f, "{}", marker),
        }
    }
}

/// Runtime state of an app's process.
///
/// Invariant: `pid` is `Some` iff `status == Running`. Use [`Runtime::mark_running`]
/// and [`Runtime::mark_stopped`] rather than writing the fields directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Runtime {
    pub status: RunStatus,
    pub pid: Option<u32>,
    /// Process group the app was launched into. Signals target this first.
    pub pgid: Option<u32>,
    pub last_start_at: Option<DateTime<Utc>>,
    pub last_stop_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<ExitOutcome>,
    pub last_signal: Option<String>,
}

impl Runtime {
    /// Persisted view only; the OS may disagree (see the supervisor's liveness probe).
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running && self.pid.is_some()
    }

    pub fn mark_running(&mut self, pid: u32, pgid: u32, at: DateTime<Utc>) {
        self.status = RunStatus::Running;
        self.pid = Some(pid);
        self.pgid = Some(pgid);
        self.last_start_at = Some(at);
    }

    pub fn mark_stopped(&mut self, at: DateTime<Utc>) {
        self.status = RunStatus::Stopped;
        self.pid = None;
        self.pgid = None;
        self.last_stop_at = Some(at);
    }
}

/// A labelled shell command run on its own cron schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledCommand {
    pub label: String,
    pub schedule: String,
    pub command: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// One managed app. Keyed by `name` in the registry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    pub name: String,
    /// Git URL, or [`LOCAL_REPO`].
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub directory: PathBuf,
    #[serde(default)]
    pub install_command: String,
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub start_command: String,
    /// Merged over the host environment when the app or its build steps run.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime: Runtime,
    /// Auto-restart schedule.
    #[serde(default)]
    pub cron_schedule: Option<String>,
    #[serde(default)]
    pub scheduled_commands: Vec<ScheduledCommand>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub health_check_schedule: Option<String>,
    #[serde(default)]
    pub mute_alerts: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_deploy_at: Option<DateTime<Utc>>,
}

impl AppRecord {
    /// A fresh record with the stock Node-style commands.
    pub fn new(
        name: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
        directory: PathBuf,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            repo: repo.into(),
            branch: branch.into(),
            directory,
            install_command: "npm install".to_string(),
            build_command: String::new(),
            start_command: "npm start".to_string(),
            env: BTreeMap::new(),
            runtime: Runtime::default(),
            cron_schedule: None,
            scheduled_commands: Vec::new(),
            webhook_secret: None,
            health_check_url: None,
            health_check_schedule: None,
            mute_alerts: false,
            created_at: now,
            updated_at: now,
            last_deploy_at: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.repo == LOCAL_REPO
    }

    pub fn scheduled_command(&self, label: &str) -> Option<&ScheduledCommand> {
        self.scheduled_commands.iter().find(|c| c.label == label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for Meta {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
        }
    }
}

/// Runtime-tunable settings persisted next to the apps. `None` defers to the
/// config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub webhook_enabled: Option<bool>,
    pub webhook_port: Option<u16>,
}

/// The whole persisted registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub apps: BTreeMap<String, AppRecord>,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub settings: Settings,
}

impl RegistryDocument {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            apps: BTreeMap::new(),
            meta: Meta {
                created_at: now,
                updated_at: now,
            },
            settings: Settings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: DateTime<Utc>) -> AppRecord {
        AppRecord::new(
            "api",
            "https://example.com/api.git",
            "main",
            PathBuf::from("/srv/deployments/api"),
            now,
        )
    }

    #[test]
    fn test_app_record_serializes_camel_case() {
        let app = sample(Utc::now());
        let value = serde_json::to_value(&app).unwrap();
        assert_eq!(value["installCommand"], "npm install");
        assert_eq!(value["startCommand"], "npm start");
        assert_eq!(value["runtime"]["status"], "stopped");
        assert!(value["runtime"]["pid"].is_null());
        assert!(value["lastDeployAt"].is_null());
    }

    #[test]
    fn test_runtime_mark_running_and_stopped_keep_pid_invariant() {
        let now = Utc::now();
        let mut runtime = Runtime::default();
        assert!(!runtime.is_running());

        runtime.mark_running(4242, 4242, now);
        assert_eq!(runtime.status, RunStatus::Running);
        assert_eq!(runtime.pid, Some(4242));
        assert!(runtime.is_running());

        runtime.mark_stopped(now);
        assert_eq!(runtime.status, RunStatus::Stopped);
        assert!(runtime.pid.is_none());
        assert!(runtime.pgid.is_none());
        assert_eq!(runtime.last_stop_at, Some(now));
    }

    #[test]
    fn test_exit_outcome_is_untagged() {
        let code: ExitOutcome = serde_json::from_str("137").unwrap();
        assert_eq!(code, ExitOutcome::Code(137));

        let crash: ExitOutcome = serde_json::from_str("\"CRASH_DETECTED\"").unwrap();
        assert!(crash.is_crash_detected());
        assert_eq!(serde_json::to_string(&crash).unwrap(), "\"CRASH_DETECTED\"");
        assert!(!ExitOutcome::Code(0).is_crash_detected());
    }

    #[test]
    fn test_document_tolerates_sparse_records() {
        let raw = r#"{
            "apps": {
                "web": {
                    "name": "web",
                    "repo": "local",
                    "directory": "/srv/deployments/web",
                    "runtime": {"status": "running", "pid": 10}
                }
            },
            "meta": {"createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-01T00:00:00Z"}
        }"#;
        let doc: RegistryDocument = serde_json::from_str(raw).unwrap();
        let web = &doc.apps["web"];
        assert!(web.is_local());
        assert_eq!(web.branch, "main");
        assert!(web.start_command.is_empty());
        assert_eq!(web.runtime.pid, Some(10));
        assert!(web.scheduled_commands.is_empty());
        assert_eq!(doc.settings, Settings::default());
    }

    #[test]
    fn test_scheduled_command_lookup_by_label() {
        let mut app = sample(Utc::now());
        app.scheduled_commands.push(ScheduledCommand {
            label: "cleanup".into(),
            schedule: "0 * * * *".into(),
            command: "rm -rf tmp/*".into(),
        });
        assert!(app.scheduled_command("cleanup").is_some());
        assert!(app.scheduled_command("missing").is_none());
    }
}
