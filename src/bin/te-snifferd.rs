//! te-snifferd - test agent sniffer manager daemon.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use te_sniffer::interfaces::{describe_interface, list_interfaces};
use te_sniffer::{AgentConfig, ControlServer, ProcessSupervisor, SnifferCore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "te-snifferd")]
#[command(about = "Test agent sniffer manager - runs capture workers and serves their captures")]
struct Cli {
    /// Configuration file (default: $SNIFFERD_CONFIG or /etc/te-snifferd.conf)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve controller requests (default)
    Run,
    /// Show network interfaces sniffers can attach to
    Interfaces {
        /// Only show this interface
        name: Option<String>,
    },
}

fn run(config: AgentConfig) -> Result<()> {
    tracing::info!("Starting te-snifferd for test agent '{}'", config.ta_name);
    tracing::info!("Private directory: {:?}", config.private_dir);
    tracing::info!("Capture worker: {:?}", config.worker);

    let addr = config.socket_addr()?;
    let core = SnifferCore::new(
        &config.ta_name,
        &config.private_dir,
        Box::new(ProcessSupervisor::new(&config.worker)),
    );
    let server = ControlServer::new(core, addr);

    let running = server.running_flag();
    ctrlc::set_handler(move || {
        tracing::info!("Interrupt received, shutting down");
        running.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    server.run().context("Control server failed")
}

fn show_interfaces(name: Option<&str>) -> Result<()> {
    match name {
        Some(name) => println!("{}", describe_interface(name)?),
        None => {
            for line in list_interfaces() {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AgentConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.tracing_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config),
        Commands::Interfaces { name } => show_interfaces(name.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
