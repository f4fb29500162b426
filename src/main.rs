use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "deckhand")]
#[command(version, about = "Single-host app supervisor and deploy orchestrator")]
pub struct Cli {
    /// Root directory holding data/, deployments/ and logs/
    #[arg(long, global = true, env = "DECKHAND_ROOT")]
    pub root: Option<PathBuf>,

    /// Path to deckhand.toml (defaults to <root>/deckhand.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor daemon (crash detection, schedules, webhook)
    Serve,
    /// Manage app definitions
    Apps {
        #[command(subcommand)]
        command: AppsCommands,
    },
    /// Fetch and build an app
    Deploy {
        name: String,
        /// Restart the app after a successful deploy
        #[arg(long)]
        restart: bool,
    },
    /// Stop, redeploy and start again if it was running
    Update { name: String },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    /// Show the tail of an app's stdout and stderr
    Logs {
        name: String,
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
    /// Run a one-off shell command in the app directory
    Run {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Auto-restart and scheduled commands
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Health-check probes
    Health {
        #[command(subcommand)]
        command: HealthCommands,
    },
    /// Push webhook settings
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum AppsCommands {
    /// List apps with their live status
    List,
    /// Show one app in full
    Show { name: String },
    /// Register a new app
    Add {
        name: String,
        /// Git URL, or "local" for an uploaded directory
        #[arg(long)]
        repo: String,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        install: Option<String>,
        #[arg(long)]
        build: Option<String>,
        #[arg(long)]
        start: Option<String>,
        /// KEY=VALUE, repeatable
        #[arg(long = "env", value_parser = cmd::parse_key_value)]
        env: Vec<(String, String)>,
    },
    /// Change an app's definition
    Edit {
        name: String,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        install: Option<String>,
        #[arg(long)]
        build: Option<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        mute_alerts: Option<bool>,
    },
    /// Show, set or unset environment variables
    Env {
        name: String,
        /// KEY=VALUE to set
        #[arg(value_parser = cmd::parse_key_value)]
        set: Vec<(String, String)>,
        /// KEY to remove, repeatable
        #[arg(long)]
        unset: Vec<String>,
    },
    /// Remove an app
    Remove {
        name: String,
        /// Also delete the app directory and log files
        #[arg(long)]
        delete_files: bool,
        /// Stop the app first if it is running
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ScheduleCommands {
    /// Set the auto-restart schedule ("off" disables it)
    Restart { name: String, schedule: String },
    /// Add a labelled scheduled command
    Add {
        name: String,
        label: String,
        schedule: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Remove a scheduled command
    Remove { name: String, label: String },
}

#[derive(Subcommand, Clone)]
pub enum HealthCommands {
    /// Set the health-check URL and schedule; omit --url to clear it
    Set {
        name: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        schedule: Option<String>,
    },
    /// Probe the health-check URL now
    Check { name: String },
}

#[derive(Subcommand, Clone)]
pub enum WebhookCommands {
    /// Generate a new secret for an app (or clear it)
    Secret {
        name: String,
        #[arg(long)]
        clear: bool,
    },
    /// Enable the listener, optionally on another port
    Enable {
        #[arg(long)]
        port: Option<u16>,
    },
    Disable,
    /// Show listener settings
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (config, paths) = cmd::load_config(&cli)?;
    let daemon = matches!(cli.command, Commands::Serve);
    let file_dir = (daemon || config.logging.file).then_some(paths.logs_dir.as_path());
    let _log_guard = deckhand::logging::init(deckhand::logging::LogOptions {
        format: config.logging.format,
        default_filter: deckhand::logging::default_filter(daemon, cli.verbose),
        file_dir,
    })?;

    let orchestrator = cmd::open(config, paths).await?;

    match &cli.command {
        Commands::Serve => cmd::cmd_serve(orchestrator).await?,
        Commands::Apps { command } => cmd::cmd_apps(&orchestrator, &cli, command.clone()).await?,
        Commands::Deploy { name, restart } => cmd::cmd_deploy(&orchestrator, name, *restart).await?,
        Commands::Update { name } => cmd::cmd_update(&orchestrator, name).await?,
        Commands::Start { name } => cmd::cmd_start(&orchestrator, name).await?,
        Commands::Stop { name } => cmd::cmd_stop(&orchestrator, name).await?,
        Commands::Restart { name } => cmd::cmd_restart(&orchestrator, name).await?,
        Commands::Logs { name, lines } => cmd::cmd_logs(&orchestrator, name, *lines).await?,
        Commands::Run { name, command } => cmd::cmd_run(&orchestrator, name, &command.join(" ")).await?,
        Commands::Schedule { command } => cmd::cmd_schedule(&orchestrator, command.clone()).await?,
        Commands::Health { command } => cmd::cmd_health(&orchestrator, command.clone()).await?,
        Commands::Webhook { command } => cmd::cmd_webhook(&orchestrator, command.clone()).await?,
    }

    Ok(())
}
