use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};

use hyperv_webhook::agent::config::Config;
use hyperv_webhook::agent::privileges::check_privileges;
use hyperv_webhook::commands::{CommandExecutor, OperationOutcome, VmDispatcher};
use hyperv_webhook::comms::local_api;
use hyperv_webhook::utils;

#[derive(Parser)]
#[command(name = "hyperv-webhook", version, about = "Hyper-V webhook service")]
struct AppCli {
    /// Config file path (JSON); environment variables are used when omitted
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start HTTP server (default)
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show VM power state
    Status { name: String },
    /// Start VM
    Start { name: String },
    /// Stop VM
    Stop {
        name: String,
        /// Turn the VM off instead of shutting down the guest
        #[arg(long)]
        force: bool,
    },
    /// Restart VM
    Restart {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Verify administrator privileges
    CheckPrivileges,
    /// Print the effective configuration
    ShowConfig,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
}

fn dispatcher(config: &Config) -> Result<VmDispatcher> {
    if config.require_admin {
        check_privileges()?;
    }
    let executor = CommandExecutor::powershell(&config.powershell_path, &config.execution_policy)
        .with_strategy(config.timeout_strategy());
    Ok(VmDispatcher::new(Arc::new(executor)))
}

fn print_outcome(outcome: OperationOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        bail!(outcome.error.unwrap_or_else(|| "operation failed".to_string()));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppCli::parse();
    let mut config = load_config(args.config.as_deref())?;
    utils::logging::init(config.effective_log_level());

    let command = args.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    });

    match command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            config.validate()?;
            if config.debug {
                warn!("Debug mode enabled");
            }
            info!("Starting HTTP server on {}:{}", config.host, config.port);
            local_api::serve(config).await?;
        }
        Commands::Status { name } => print_outcome(dispatcher(&config)?.status(&name).await)?,
        Commands::Start { name } => print_outcome(dispatcher(&config)?.start(&name).await)?,
        Commands::Stop { name, force } => {
            print_outcome(dispatcher(&config)?.stop(&name, force).await)?
        }
        Commands::Restart { name, force } => {
            print_outcome(dispatcher(&config)?.restart(&name, force).await)?
        }
        Commands::CheckPrivileges => {
            check_privileges()?;
            println!("Administrator privileges available");
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config.summary())?);
        }
    }

    Ok(())
}
