use berth_core::{install_signal_handler, AgentConfig, Fleet, StoreLock};
use berth_runtime::{check_docker_prereqs, format_missing};
use berth_server::{run_server, Agent, ServerError};
use berth_store::StoreLayout;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "berth-agent",
    version,
    about = "berth fleet agent: serves the control API for the services on this host"
)]
struct Cli {
    /// Agent configuration file.
    #[arg(long, global = true, default_value = AgentConfig::DEFAULT_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the control API until interrupted. Runs first setup when needed.
    Serve {
        /// Listen address, overriding the configuration.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Seed shared variables, create the API token and install essential services.
    Setup,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BERTH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), ServerError> {
    let config = AgentConfig::load_or_default(&cli.config)?;
    let layout = StoreLayout::new(&config.store_root);
    let lock_path = layout.lock_file();
    let Some(_lock) = StoreLock::try_acquire(&lock_path)? else {
        return Err(ServerError::Io(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            format!("{} is held by another berth process", lock_path.display()),
        )));
    };

    if config.driver == "docker" && std::env::var("BERTH_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = check_docker_prereqs();
        if !missing.is_empty() {
            return Err(ServerError::Prerequisites(format_missing(&missing)));
        }
    }

    let fleet = Arc::new(Fleet::from_config(&config)?);
    match cli.command {
        Command::Setup => {
            let installed = fleet.first_setup()?;
            info!("setup complete, essential services: {}", installed.join(", "));
            fleet.wait_idle()?;
        }
        Command::Serve { listen } => {
            install_signal_handler();
            if !fleet.is_set_up() {
                info!("store not set up yet, running first setup");
                fleet.first_setup()?;
            }
            let agent = Agent::new(fleet)?;
            let addr = listen.unwrap_or(config.listen);
            run_server(&agent, &addr)?;
        }
    }
    info!("berth-agent stopped");
    Ok(())
}
