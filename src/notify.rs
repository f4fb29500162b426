//! Outbound notifications.
//!
//! Everything noteworthy (crashes, webhook deploys, failed health checks) is
//! reported through a [`Notifier`]. The daemon picks [`HttpNotifier`] when a
//! notify URL is configured and falls back to [`LogNotifier`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::supervisor::SupervisorEvent;

/// Delivers a text message to a set of admins. Delivery is best effort:
/// implementations log failures instead of returning them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, admin_ids: &[String], text: &str);
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, admin_ids: &[String], text: &str) {
        info!(recipients = admin_ids.len(), "notify: {}", text);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotifyPayload<'a> {
    admin_ids: &'a [String],
    text: &'a str,
}

/// POSTs `{"adminIds": [...], "text": "..."}` to a relay endpoint.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, admin_ids: &[String], text: &str) {
        let payload = NotifyPayload { admin_ids, text };
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %self.url, "notification delivered");
            }
            Ok(resp) => warn!(url = %self.url, status = %resp.status(), "notification rejected"),
            Err(e) => warn!(url = %self.url, error = %e, "notification failed"),
        }
    }
}

/// A notifier bound to its recipients.
#[derive(Clone)]
pub struct NotifyHub {
    notifier: Arc<dyn Notifier>,
    admin_ids: Arc<Vec<String>>,
}

impl NotifyHub {
    pub fn new(notifier: Arc<dyn Notifier>, admin_ids: Vec<String>) -> Self {
        Self {
            notifier,
            admin_ids: Arc::new(admin_ids),
        }
    }

    /// A hub that only logs.
    pub fn log_only() -> Self {
        Self::new(Arc::new(LogNotifier), Vec::new())
    }

    pub async fn send(&self, text: &str) {
        self.notifier.notify(&self.admin_ids, text).await;
    }

    /// Fire and forget.
    pub fn send_detached(&self, text: String) {
        let hub = self.clone();
        tokio::spawn(async move { hub.send(&text).await });
    }

    /// Forward supervisor crash events until the channel closes.
    pub fn spawn_event_forwarder(
        &self,
        mut events: broadcast::Receiver<SupervisorEvent>,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(text) = describe_event(&event) {
                            hub.send(&text).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notifier fell behind supervisor events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Message for events worth telling an admin about.
pub fn describe_event(event: &SupervisorEvent) -> Option<String> {
    match event {
        SupervisorEvent::Crashed {
            app,
            pid,
            exit_code,
            signal,
        } => {
            let mut text = format!("App \"{}\" crashed (PID {})", app, pid);
            if let Some(code) = exit_code {
                text.push_str(&format!(", exit code {}", code));
            }
            if let Some(signal) = signal {
                text.push_str(&format!(", signal {}", signal));
            }
            Some(text)
        }
        SupervisorEvent::Started { .. } | SupervisorEvent::Stopped { .. } => None,
    }
}
