//! Supervisor daemon: `deckhand serve`.

use anyhow::{Context, Result};
use deckhand::Orchestrator;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

pub async fn cmd_serve(orchestrator: Orchestrator) -> Result<()> {
    for warning in orchestrator.config().validate() {
        warn!("{}", warning);
    }

    let paths = orchestrator.paths();
    info!(
        root = %paths.root.display(),
        registry = %paths.registry_file.display(),
        "deckhand starting"
    );

    orchestrator
        .supervisor()
        .recover_state()
        .await
        .context("Failed to recover runtime state")?;
    let timers = orchestrator
        .scheduler()
        .reconcile_from_registry()
        .await
        .context("Failed to register schedules")?;
    info!(timers, "schedules registered");

    let forwarder = orchestrator
        .notify()
        .spawn_event_forwarder(orchestrator.supervisor().subscribe());
    let crash_monitor = orchestrator.supervisor().spawn_crash_monitor();
    let reconciler = orchestrator.scheduler().spawn_reconciler();

    match orchestrator.apply_webhook_settings().await {
        Ok(Some(addr)) => info!(%addr, "webhook listener enabled"),
        Ok(None) => info!("webhook listener disabled"),
        Err(e) => warn!(error = %e, "webhook listener could not start"),
    }
    let webhook_sync = spawn_webhook_sync(orchestrator.clone());

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl-c")?;
            info!("interrupt received, shutting down");
        }
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
    }

    webhook_sync.abort();
    reconciler.abort();
    crash_monitor.abort();
    orchestrator.shutdown().await;
    forwarder.abort();
    info!("deckhand stopped; supervised apps keep running");
    Ok(())
}

/// `deckhand webhook enable|disable` only persists settings; the daemon picks
/// them up on the schedule reconcile interval.
fn spawn_webhook_sync(orchestrator: Orchestrator) -> tokio::task::JoinHandle<()> {
    let period = orchestrator.config().scheduler.reconcile_interval();
    tokio::spawn(async move {
        if period.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if let Err(e) = orchestrator.apply_webhook_settings().await {
                warn!(error = %e, "webhook reconfigure failed");
            }
        }
    })
}
