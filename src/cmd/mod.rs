//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                                      |
//! |-------------|-------------------------------------------------------|
//! | `serve`     | `Serve`                                               |
//! | `apps`      | `Apps`                                                |
//! | `lifecycle` | `Deploy`, `Update`, `Start`, `Stop`, `Restart`, `Logs`, `Run` |
//! | `schedule`  | `Schedule`, `Health`, `Webhook`                       |

pub mod apps;
pub mod lifecycle;
pub mod schedule;
pub mod serve;

use std::sync::Arc;

use anyhow::{Context, Result};
use deckhand::Orchestrator;
use deckhand::config::{CONFIG_FILE_NAME, DeckhandConfig, Paths};
use deckhand::notify::{HttpNotifier, LogNotifier, Notifier, NotifyHub};

use super::Cli;

pub use apps::cmd_apps;
pub use lifecycle::{cmd_deploy, cmd_logs, cmd_restart, cmd_run, cmd_start, cmd_stop, cmd_update};
pub use schedule::{cmd_health, cmd_schedule, cmd_webhook};
pub use serve::cmd_serve;

/// Read `deckhand.toml` and the environment. `--root` wins over both.
pub fn load_config(cli: &Cli) -> Result<(DeckhandConfig, Paths)> {
    let mut config = match &cli.config {
        Some(path) => DeckhandConfig::load(path)?,
        None => {
            let mut probe = DeckhandConfig::default();
            probe.apply_env()?;
            if let Some(root) = &cli.root {
                probe.paths.root = Some(root.clone());
            }
            DeckhandConfig::load_or_default(&probe.paths()?.root.join(CONFIG_FILE_NAME))?
        }
    };
    config.apply_env()?;
    if let Some(root) = &cli.root {
        config.paths.root = Some(root.clone());
    }
    let paths = config.paths()?;
    Ok((config, paths))
}

pub async fn open(config: DeckhandConfig, paths: Paths) -> Result<Orchestrator> {
    let notifier: Arc<dyn Notifier> = match config.notify.url.as_deref() {
        Some(url) => Arc::new(HttpNotifier::new(url)),
        None => Arc::new(LogNotifier),
    };
    let notify = NotifyHub::new(notifier, config.notify.admin_ids.clone());
    Orchestrator::open(paths, config, notify)
        .await
        .context("Failed to initialize deckhand")
}

/// `KEY=VALUE` argument parser.
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}
