//! Process and deploy commands: `deckhand deploy|update|start|stop|restart|logs|run`.

use std::time::Duration;

use anyhow::Result;
use console::style;
use deckhand::{DeployOutcome, Orchestrator};
use indicatif::{ProgressBar, ProgressStyle};

fn spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn print_outcome(name: &str, verb: &str, outcome: &DeployOutcome) {
    println!("{} {} {}", style("✓").green(), verb, style(name).bold());
    println!("{}", outcome.summary.render());
    if let Some(pid) = outcome.pid {
        println!("Running with PID {}", pid);
    }
}

pub async fn cmd_deploy(orchestrator: &Orchestrator, name: &str, restart: bool) -> Result<()> {
    let bar = spinner(format!("Deploying {}...", name));
    let result = orchestrator.deploy(name, restart).await;
    bar.finish_and_clear();
    print_outcome(name, "Deployed", &result?);
    Ok(())
}

pub async fn cmd_update(orchestrator: &Orchestrator, name: &str) -> Result<()> {
    let bar = spinner(format!("Updating {}...", name));
    let result = orchestrator.update(name).await;
    bar.finish_and_clear();
    print_outcome(name, "Updated", &result?);
    Ok(())
}

pub async fn cmd_start(orchestrator: &Orchestrator, name: &str) -> Result<()> {
    let pid = orchestrator.start(name).await?;
    println!("{} Started {} (PID {})", style("✓").green(), style(name).bold(), pid);
    Ok(())
}

pub async fn cmd_stop(orchestrator: &Orchestrator, name: &str) -> Result<()> {
    let outcome = orchestrator.stop(name).await?;
    if outcome.already_stopped {
        println!("{} was not running", style(name).bold());
    } else {
        println!("{} Stopped {}", style("✓").green(), style(name).bold());
    }
    Ok(())
}

pub async fn cmd_restart(orchestrator: &Orchestrator, name: &str) -> Result<()> {
    let pid = orchestrator.restart(name).await?;
    println!("{} Restarted {} (PID {})", style("✓").green(), style(name).bold(), pid);
    Ok(())
}

pub async fn cmd_logs(orchestrator: &Orchestrator, name: &str, lines: usize) -> Result<()> {
    let tail = orchestrator.read_logs(name, lines).await?;
    println!("{}", style(format!("── stdout ({})", tail.out_path.display())).dim());
    if !tail.out.is_empty() {
        println!("{}", tail.out);
    }
    println!("{}", style(format!("── stderr ({})", tail.err_path.display())).dim());
    if !tail.err.is_empty() {
        println!("{}", tail.err);
    }
    Ok(())
}

pub async fn cmd_run(orchestrator: &Orchestrator, name: &str, command: &str) -> Result<()> {
    let output = orchestrator.run_command(name, command).await?;
    let combined = output.combined();
    if combined.is_empty() {
        println!("{}", style("(no output)").dim());
    } else {
        println!("{}", combined);
    }
    Ok(())
}
