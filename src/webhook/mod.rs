//! Push webhook listener.
//!
//! The listener can be started, stopped and moved to another port while the
//! daemon runs. Each start binds a fresh socket and serves the router until a
//! shutdown signal arrives.

pub mod routes;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::orchestrator::WeakOrchestrator;

pub use routes::router;

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct WebhookListener {
    bind: String,
    running: Option<RunningServer>,
}

impl WebhookListener {
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address actually bound; differs from the requested port when it was 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    /// Bind `port` and serve. A server that is already running is stopped
    /// first.
    pub async fn start(&mut self, port: u16, orchestrator: WeakOrchestrator) -> Result<SocketAddr> {
        self.stop().await;

        let addr = format!("{}:{}", self.bind, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind webhook listener to {}", addr))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(orchestrator);
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "webhook listener failed");
            }
        });

        info!(addr = %local_addr, "webhook listener started");
        self.running = Some(RunningServer {
            addr: local_addr,
            shutdown: shutdown_tx,
            handle,
        });
        Ok(local_addr)
    }

    /// Stop serving and wait for the server task to finish.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(());
            let _ = running.handle.await;
            info!(addr = %running.addr, "webhook listener stopped");
        }
    }

    /// Converge on the requested state: stopped when disabled, otherwise
    /// listening on `port` (restarted only if the port changed).
    pub async fn reconfigure(
        &mut self,
        enabled: bool,
        port: u16,
        orchestrator: WeakOrchestrator,
    ) -> Result<Option<SocketAddr>> {
        if !enabled {
            self.stop().await;
            return Ok(None);
        }
        if let Some(addr) = self.local_addr() {
            if port != 0 && addr.port() == port {
                return Ok(Some(addr));
            }
        }
        self.start(port, orchestrator).await.map(Some)
    }
}
