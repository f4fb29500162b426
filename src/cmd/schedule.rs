//! Schedule, health-check and webhook commands.

use anyhow::Result;
use console::style;
use deckhand::Orchestrator;
use deckhand::scheduler::Registration;

use super::super::{HealthCommands, ScheduleCommands, WebhookCommands};

fn describe(registration: Registration) -> String {
    match registration {
        Registration::Registered => style("scheduled").green().to_string(),
        Registration::Disabled => style("disabled").dim().to_string(),
        Registration::Invalid => style("invalid schedule").red().to_string(),
    }
}

const DAEMON_NOTE: &str = "A running `deckhand serve` picks this up on its next reconcile.";

pub async fn cmd_schedule(orchestrator: &Orchestrator, command: ScheduleCommands) -> Result<()> {
    match command {
        ScheduleCommands::Restart { name, schedule } => {
            let registration = orchestrator.set_auto_restart(&name, Some(&schedule)).await?;
            println!("Auto-restart for {}: {}", style(&name).bold(), describe(registration));
        }
        ScheduleCommands::Add {
            name,
            label,
            schedule,
            command,
        } => {
            let registration = orchestrator
                .add_scheduled_command(&name, &label, &schedule, &command.join(" "))
                .await?;
            println!("Command [{}] for {}: {}", label, style(&name).bold(), describe(registration));
        }
        ScheduleCommands::Remove { name, label } => {
            if orchestrator.remove_scheduled_command(&name, &label).await? {
                println!("{} Removed command [{}] from {}", style("✓").green(), label, name);
            } else {
                println!("{} has no command labelled [{}]", name, label);
            }
        }
    }
    println!("{}", style(DAEMON_NOTE).dim());
    Ok(())
}

pub async fn cmd_health(orchestrator: &Orchestrator, command: HealthCommands) -> Result<()> {
    match command {
        HealthCommands::Set { name, url, schedule } => {
            let registration = orchestrator
                .set_health_check(&name, url.as_deref(), schedule.as_deref())
                .await?;
            match url {
                Some(url) => println!("Health check for {}: {} ({})", name, url, describe(registration)),
                None => println!("Health check for {} cleared", name),
            }
            println!("{}", style(DAEMON_NOTE).dim());
        }
        HealthCommands::Check { name } => {
            let report = orchestrator.check_health(&name).await?;
            match report.failure_reason() {
                None => println!(
                    "{} {} is healthy (HTTP {})",
                    style("✓").green(),
                    name,
                    report.status.map(|s| s.to_string()).unwrap_or_default()
                ),
                Some(reason) => {
                    println!("{} {} is unhealthy: {}", style("✗").red(), name, reason);
                    anyhow::bail!("health check failed for {}", name);
                }
            }
        }
    }
    Ok(())
}

pub async fn cmd_webhook(orchestrator: &Orchestrator, command: WebhookCommands) -> Result<()> {
    match command {
        WebhookCommands::Secret { name, clear: true } => {
            orchestrator.clear_webhook_secret(&name).await?;
            println!("Webhook secret for {} cleared; pushes are now rejected.", name);
        }
        WebhookCommands::Secret { name, clear: false } => {
            let secret = orchestrator.rotate_webhook_secret(&name).await?;
            let (_, port) = orchestrator.webhook_settings().await?;
            println!("New webhook secret for {}:", style(&name).bold());
            println!("  {}", secret);
            println!(
                "Push URL: http://<host>:{}/webhook/{}?secret={}",
                port, name, secret
            );
        }
        WebhookCommands::Enable { port } => {
            orchestrator.configure_webhook(true, port).await?;
            let (_, port) = orchestrator.webhook_settings().await?;
            println!("{} Webhook listener enabled on port {}", style("✓").green(), port);
            println!("{}", style(DAEMON_NOTE).dim());
        }
        WebhookCommands::Disable => {
            orchestrator.configure_webhook(false, None).await?;
            println!("Webhook listener disabled");
            println!("{}", style(DAEMON_NOTE).dim());
        }
        WebhookCommands::Status => {
            let (enabled, port) = orchestrator.webhook_settings().await?;
            println!(
                "Webhook listener: {} (port {})",
                if enabled { style("enabled").green() } else { style("disabled").dim() },
                port
            );
        }
    }
    Ok(())
}
