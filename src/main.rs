//! Relay Agent - CLI and daemon
//!
//! Runs the relay daemon, or performs one-shot operations against the same
//! state directory: run a command, show status, force a catch-up sync, or
//! read the activity log.

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_agent::activity_log::ActivityLog;
use relay_agent::config::Config;
use relay_agent::settings::SettingsStore;
use relay_agent::{Collaborators, RelayAgent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Relay Agent - SMS/MMS relay daemon
#[derive(Parser)]
#[command(name = "relay-agent")]
#[command(about = "Relay incoming messages to phone and email destinations")]
struct Cli {
    /// State directory (settings, watermarks, activity log)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Telephony database to read messages from
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Run,

    /// Run one operator command and print the reply
    Command {
        /// Sender the command is attributed to
        sender: String,

        /// Full command text, including the prefix
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },

    /// Show settings and watermarks
    Status,

    /// Run one catch-up sync pass now
    Sync {
        /// Re-arm the sync watermarks at the current maximum instead
        #[arg(long)]
        reset: bool,
    },

    /// Show the most recent activity log entries
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::from_env();
    if let Some(dir) = cli.state_dir {
        config = config.with_state_dir(dir);
    }
    if let Some(db) = cli.db {
        config.messages_db = db;
    }

    match cli.command {
        Commands::Run => cmd_run(config),
        Commands::Command { sender, text } => cmd_command(config, &sender, &text.join(" ")),
        Commands::Status => cmd_status(config),
        Commands::Sync { reset } => cmd_sync(config, reset),
        Commands::Logs { lines } => cmd_logs(&config, lines),
    }
}

// ============================================================================
// CLI Commands
// ============================================================================

fn build_agent(config: Config) -> anyhow::Result<RelayAgent> {
    let collaborators = Collaborators::from_config(&config).context("failed to set up collaborators")?;
    let state_dir = config.state_dir.clone();
    RelayAgent::new(config, collaborators)
        .with_context(|| format!("failed to open state in {}", state_dir.display()))
}

fn cmd_run(config: Config) -> anyhow::Result<()> {
    info!("Relay agent daemon starting");
    info!(db = %config.messages_db.display(), "Reading messages");

    let agent = build_agent(config)?;
    agent.start()?;

    // Main loop
    loop {
        std::thread::sleep(Duration::from_secs(60));
        debug!(status = %agent.sync_status(), queue = %agent.queue_state(), "Heartbeat");
    }
}

fn cmd_command(config: Config, sender: &str, text: &str) -> anyhow::Result<()> {
    let agent = build_agent(config)?;
    let result = agent.process(sender, text);
    println!("{}", result.reply_text);
    if result.is_error {
        drop(agent);
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_status(config: Config) -> anyhow::Result<()> {
    let agent = build_agent(config)?;
    println!("{}", agent.config_summary());
    Ok(())
}

fn cmd_sync(config: Config, reset: bool) -> anyhow::Result<()> {
    let agent = build_agent(config)?;

    if reset {
        agent.reset_sync()?;
        println!("{}", agent.sync_status());
        return Ok(());
    }

    let report = agent.sync_now();
    println!("{}", report);
    let handled = agent.drain_pending()?;
    if handled > 0 {
        println!("handled {} recovered message(s)", handled);
    }
    Ok(())
}

fn cmd_logs(config: &Config, lines: usize) -> anyhow::Result<()> {
    let settings = Arc::new(SettingsStore::open(&config.settings_file)?);
    let log = ActivityLog::new(&config.activity_log_file, settings);
    let entries = log.tail(lines)?;
    if entries.is_empty() {
        println!("No activity logged yet: {}", log.path().display());
    }
    for line in entries {
        println!("{}", line);
    }
    Ok(())
}
