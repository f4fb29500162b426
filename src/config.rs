//! Configuration for deckhand.
//!
//! Settings are read from `deckhand.toml` (defaults apply when the file is
//! absent) and then overridden by environment variables:
//!
//! ```toml
//! [paths]
//! root = "/srv/deckhand"          # data/, deployments/ and logs/ live here
//!
//! [webhook]
//! enabled = true
//! port = 9876
//! bind = "0.0.0.0"
//!
//! [supervisor]
//! crash_check_interval_secs = 10
//! stop_grace_ms = 8000
//! stop_poll_ms = 250
//!
//! [scheduler]
//! command_timeout_secs = 60
//! health_timeout_secs = 10
//! reconcile_interval_secs = 30
//!
//! [notify]
//! admin_ids = ["123456789"]
//! url = "https://bot.internal/notify"
//!
//! [logging]
//! format = "text"                 # or "json"
//! ```
//!
//! | Variable                   | Overrides                |
//! |----------------------------|--------------------------|
//! | `DECKHAND_ROOT`            | `paths.root`             |
//! | `DECKHAND_WEBHOOK_ENABLED` | `webhook.enabled`        |
//! | `DECKHAND_WEBHOOK_PORT`    | `webhook.port`           |
//! | `DECKHAND_NOTIFY_URL`      | `notify.url`             |
//! | `ADMIN_IDS`                | `notify.admin_ids` (csv) |
//! | `DECKHAND_LOG_FORMAT`      | `logging.format`         |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "deckhand.toml";

/// Log output format for the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: text, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory. Defaults to the platform data dir (`~/.local/share/deckhand`).
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub deployments_dir: Option<PathBuf>,
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_webhook_port")]
    pub port: u16,
    #[serde(default = "default_webhook_bind")]
    pub bind: String,
}

fn default_webhook_port() -> u16 {
    9876
}

fn default_webhook_bind() -> String {
    "0.0.0.0".to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_webhook_port(),
            bind: default_webhook_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_crash_check_interval_secs")]
    pub crash_check_interval_secs: u64,
    /// How long a SIGTERM'd process gets before SIGKILL.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_stop_poll_ms")]
    pub stop_poll_ms: u64,
}

fn default_crash_check_interval_secs() -> u64 {
    10
}

fn default_stop_grace_ms() -> u64 {
    8000
}

fn default_stop_poll_ms() -> u64 {
    250
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            crash_check_interval_secs: default_crash_check_interval_secs(),
            stop_grace_ms: default_stop_grace_ms(),
            stop_poll_ms: default_stop_poll_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn crash_check_interval(&self) -> Duration {
        Duration::from_secs(self.crash_check_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    /// How often the daemon re-reads schedules from the registry.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_health_timeout_secs() -> u64 {
    10
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Recipients handed to the notifier with every message.
    #[serde(default)]
    pub admin_ids: Vec<String>,
    /// When set, notifications are POSTed here as JSON; otherwise they are logged.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// `serve` always writes a daily-rolling `deckhand.log` under the logs
    /// dir; this extends it to one-shot commands.
    #[serde(default)]
    pub file: bool,
}

/// Raw `deckhand.toml` contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeckhandConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DeckhandConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse deckhand.toml")
    }

    /// Load `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Split out so tests do not have
    /// to mutate the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("DECKHAND_ROOT") {
            self.paths.root = Some(PathBuf::from(root));
        }
        if let Some(enabled) = lookup("DECKHAND_WEBHOOK_ENABLED") {
            self.webhook.enabled = matches!(enabled.as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(port) = lookup("DECKHAND_WEBHOOK_PORT") {
            self.webhook.port = port
                .parse()
                .with_context(|| format!("Invalid DECKHAND_WEBHOOK_PORT '{}'", port))?;
        }
        if let Some(url) = lookup("DECKHAND_NOTIFY_URL") {
            self.notify.url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(ids) = lookup("ADMIN_IDS") {
            self.notify.admin_ids = ids
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(format) = lookup("DECKHAND_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        Ok(())
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize deckhand.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.supervisor.stop_poll_ms == 0 {
            warnings.push("supervisor.stop_poll_ms is 0; stop will spin".to_string());
        }
        if self.supervisor.stop_poll_ms > self.supervisor.stop_grace_ms {
            warnings.push(format!(
                "supervisor.stop_poll_ms ({}) exceeds stop_grace_ms ({})",
                self.supervisor.stop_poll_ms, self.supervisor.stop_grace_ms
            ));
        }
        if self.supervisor.crash_check_interval_secs == 0 {
            warnings.push("supervisor.crash_check_interval_secs is 0; crash detection disabled".to_string());
        }
        if self.webhook.enabled && self.webhook.port == 0 {
            warnings.push("webhook.port is 0; an ephemeral port will be chosen".to_string());
        }
        if self.notify.admin_ids.is_empty() {
            warnings.push("notify.admin_ids is empty; notifications have no recipients".to_string());
        }

        warnings
    }

    /// Resolve the on-disk layout.
    pub fn paths(&self) -> Result<Paths> {
        let root = match &self.paths.root {
            Some(root) => root.clone(),
            None => dirs::data_local_dir()
                .map(|d| d.join("deckhand"))
                .context("Could not determine a data directory; set paths.root or DECKHAND_ROOT")?,
        };
        Ok(Paths::new(
            root.clone(),
            self.paths.data_dir.clone().unwrap_or_else(|| root.join("data")),
            self.paths
                .deployments_dir
                .clone()
                .unwrap_or_else(|| root.join("deployments")),
            self.paths.logs_dir.clone().unwrap_or_else(|| root.join("logs")),
        ))
    }
}

/// Resolved directory layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub deployments_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub registry_file: PathBuf,
    /// Per-app lock files shared by the daemon and one-shot commands.
    pub locks_dir: PathBuf,
}

impl Paths {
    pub fn new(root: PathBuf, data_dir: PathBuf, deployments_dir: PathBuf, logs_dir: PathBuf) -> Self {
        let registry_file = data_dir.join("db.json");
        let locks_dir = data_dir.join("locks");
        Self {
            root,
            data_dir,
            deployments_dir,
            logs_dir,
            registry_file,
            locks_dir,
        }
    }

    /// Standard layout under a single root.
    pub fn under(root: &Path) -> Self {
        Self::new(
            root.to_path_buf(),
            root.join("data"),
            root.join("deployments"),
            root.join("logs"),
        )
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
        std::fs::create_dir_all(&self.deployments_dir)
            .context("Failed to create deployments directory")?;
        std::fs::create_dir_all(&self.logs_dir).context("Failed to create logs directory")?;
        std::fs::create_dir_all(&self.locks_dir).context("Failed to create locks directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = DeckhandConfig::default();
        assert!(!config.webhook.enabled);
        assert_eq!(config.webhook.port, 9876);
        assert_eq!(config.supervisor.crash_check_interval(), Duration::from_secs(10));
        assert_eq!(config.supervisor.stop_grace(), Duration::from_millis(8000));
        assert_eq!(config.supervisor.stop_poll(), Duration::from_millis(250));
        assert_eq!(config.scheduler.command_timeout(), Duration::from_secs(60));
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = DeckhandConfig::parse(
            r#"
[paths]
root = "/srv/deckhand"

[webhook]
enabled = true

[notify]
admin_ids = ["1", "2"]
"#,
        )
        .unwrap();
        assert_eq!(config.paths.root, Some(PathBuf::from("/srv/deckhand")));
        assert!(config.webhook.enabled);
        assert_eq!(config.webhook.port, 9876);
        assert_eq!(config.notify.admin_ids, vec!["1", "2"]);
        assert_eq!(config.supervisor.stop_grace_ms, 8000);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(DeckhandConfig::parse("not valid toml {{{{").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = DeckhandConfig::load_or_default(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(config.paths.root.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = DeckhandConfig::default();
        config.webhook.port = 8080;
        config.save(&path).unwrap();
        let loaded = DeckhandConfig::load(&path).unwrap();
        assert_eq!(loaded.webhook.port, 8080);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DECKHAND_ROOT", "/opt/deck"),
            ("DECKHAND_WEBHOOK_ENABLED", "true"),
            ("DECKHAND_WEBHOOK_PORT", "7000"),
            ("ADMIN_IDS", " 11, 22 ,,"),
            ("DECKHAND_LOG_FORMAT", "json"),
        ]);
        let mut config = DeckhandConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.paths.root, Some(PathBuf::from("/opt/deck")));
        assert!(config.webhook.enabled);
        assert_eq!(config.webhook.port, 7000);
        assert_eq!(config.notify.admin_ids, vec!["11", "22"]);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = DeckhandConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "DECKHAND_WEBHOOK_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = DeckhandConfig::default();
        config.notify.admin_ids = vec!["1".into()];
        assert!(config.validate().is_empty());

        config.supervisor.stop_poll_ms = 10_000;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("exceeds stop_grace_ms"));
    }

    #[test]
    fn test_paths_layout_and_ensure_directories() {
        let dir = tempdir().unwrap();
        let mut config = DeckhandConfig::default();
        config.paths.root = Some(dir.path().to_path_buf());
        let paths = config.paths().unwrap();
        assert_eq!(paths, Paths::under(dir.path()));
        assert_eq!(paths.registry_file, dir.path().join("data/db.json"));

        paths.ensure_directories().unwrap();
        assert!(paths.data_dir.exists());
        assert!(paths.deployments_dir.exists());
        assert!(paths.logs_dir.exists());
    }
}
