//! App definition commands: `deckhand apps`.

use anyhow::Result;
use console::style;
use deckhand::registry::AppPatch;
use deckhand::supervisor::LiveStatus;
use deckhand::{NewApp, Orchestrator, RemoveOptions};
use deckhand_common::AppRecord;

use super::super::{AppsCommands, Cli};

pub async fn cmd_apps(orchestrator: &Orchestrator, cli: &Cli, command: AppsCommands) -> Result<()> {
    match command {
        AppsCommands::List => list(orchestrator).await,
        AppsCommands::Show { name } => show(orchestrator, &name).await,
        AppsCommands::Add {
            name,
            repo,
            branch,
            install,
            build,
            start,
            env,
        } => {
            let app = orchestrator
                .add_app(NewApp {
                    name,
                    repo,
                    branch,
                    install_command: install,
                    build_command: build,
                    start_command: start,
                    env: env.into_iter().collect(),
                })
                .await?;
            println!(
                "{} Added {} ({})",
                style("✓").green(),
                style(&app.name).bold(),
                app.directory.display()
            );
            Ok(())
        }
        AppsCommands::Edit {
            name,
            repo,
            branch,
            install,
            build,
            start,
            mute_alerts,
        } => {
            let patch = AppPatch {
                repo,
                branch,
                install_command: install,
                build_command: build,
                start_command: start,
                mute_alerts,
            };
            if patch.is_empty() {
                println!("Nothing to change.");
                return Ok(());
            }
            let app = orchestrator.edit_app(&name, patch).await?;
            println!("{} Updated {}", style("✓").green(), style(&app.name).bold());
            Ok(())
        }
        AppsCommands::Env { name, set, unset } => {
            for (key, value) in &set {
                orchestrator.set_env(&name, key, value).await?;
                println!("{} {}={}", style("set").green(), key, value);
            }
            for key in &unset {
                if orchestrator.unset_env(&name, key).await? {
                    println!("{} {}", style("unset").yellow(), key);
                } else {
                    println!("{} {} (not set)", style("skip").dim(), key);
                }
            }
            if set.is_empty() && unset.is_empty() {
                let app = require(orchestrator, &name).await?;
                if app.env.is_empty() {
                    println!("No environment variables set for {}.", name);
                }
                for (key, value) in &app.env {
                    println!("{}={}", key, value);
                }
            }
            Ok(())
        }
        AppsCommands::Remove {
            name,
            delete_files,
            force,
        } => {
            use dialoguer::Confirm;

            require(orchestrator, &name).await?;
            if !cli.yes {
                let prompt = if delete_files {
                    format!("Remove '{}' and delete its files?", name)
                } else {
                    format!("Remove '{}'?", name)
                };
                let confirm = Confirm::new()
                    .with_prompt(prompt)
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if !confirm {
                    println!("Cancelled.");
                    return Ok(());
                }
            }
            orchestrator
                .remove(&name, RemoveOptions { delete_files, force })
                .await?;
            println!("{} Removed {}", style("✓").green(), style(&name).bold());
            Ok(())
        }
    }
}

async fn require(orchestrator: &Orchestrator, name: &str) -> Result<AppRecord> {
    Ok(orchestrator.registry().require(name).await?)
}

async fn list(orchestrator: &Orchestrator) -> Result<()> {
    let apps = orchestrator.get_apps().await?;
    if apps.is_empty() {
        println!("No apps registered. Add one with `deckhand apps add`.");
        return Ok(());
    }

    println!();
    for (name, app) in &apps {
        let live = orchestrator.status(name).await?;
        println!(
            "  {:<20} {:<18} {}@{}",
            style(name).bold(),
            render_status(&live),
            app.repo,
            app.branch
        );
    }
    println!();
    Ok(())
}

fn render_status(live: &LiveStatus) -> String {
    match (live.alive, live.pid) {
        (true, Some(pid)) => style(format!("running ({})", pid)).green().to_string(),
        _ => style("stopped").dim().to_string(),
    }
}

async fn show(orchestrator: &Orchestrator, name: &str) -> Result<()> {
    let app = require(orchestrator, name).await?;
    let live = orchestrator.status(name).await?;
    let rt = &app.runtime;
    let or_dash = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };

    println!();
    println!("{}", style(&app.name).bold());
    println!("  status      {}", render_status(&live));
    println!("  repo        {} ({})", app.repo, app.branch);
    println!("  directory   {}", app.directory.display());
    println!("  install     {}", or_dash(&app.install_command));
    println!("  build       {}", or_dash(&app.build_command));
    println!("  start       {}", or_dash(&app.start_command));
    if let Some(at) = app.last_deploy_at {
        println!("  deployed    {}", at.to_rfc3339());
    }
    if let Some(code) = &rt.last_exit_code {
        let signal = rt.last_signal.as_deref().unwrap_or("-");
        println!("  last exit   {} (signal {})", code, signal);
    }
    if let Some(schedule) = &app.cron_schedule {
        println!("  restart     {}", schedule);
    }
    for command in &app.scheduled_commands {
        println!(
            "  command     [{}] {} → {}",
            command.label, command.schedule, command.command
        );
    }
    if let Some(url) = &app.health_check_url {
        let schedule = app.health_check_schedule.as_deref().unwrap_or("manual");
        let muted = if app.mute_alerts { ", muted" } else { "" };
        println!("  health      {} ({}{})", url, schedule, muted);
    }
    println!(
        "  webhook     {}",
        if app.webhook_secret.is_some() { "secret set" } else { "no secret" }
    );
    if !app.env.is_empty() {
        println!("  env         {}", app.env.keys().cloned().collect::<Vec<_>>().join(", "));
    }
    println!();
    Ok(())
}
