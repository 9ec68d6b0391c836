mod commands;

use berth_core::{install_signal_handler, AgentConfig, Fleet, StoreLock};
use berth_store::StoreLayout;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_STORE_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "berth",
    version,
    about = "Install, update and control the services on this host"
)]
struct Cli {
    /// Agent configuration file.
    #[arg(long, global = true, default_value = AgentConfig::DEFAULT_PATH)]
    config: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Seed shared variables, create the API token and install essential services.
    Setup,
    /// List installed services, or the plugins the repository offers.
    List {
        /// Show installable plugins instead of installed services.
        #[arg(long, default_value_t = false)]
        available: bool,
    },
    /// Show the state of one service.
    Status {
        service: String,
    },
    /// Install a service (or resume an install waiting for variables).
    Install {
        service: String,
        /// Leave the service paused after building.
        #[arg(long, default_value_t = false)]
        no_start: bool,
    },
    /// Start a paused service.
    Start {
        service: String,
    },
    /// Stop a running service.
    Stop {
        service: String,
    },
    /// Update a service to a version (default: newest compatible).
    Update {
        service: String,
        version: Option<String>,
    },
    /// Go back to the version installed before the last update.
    Revert {
        service: String,
    },
    /// Recreate every container of a service at its installed version.
    Rebuild {
        service: String,
    },
    /// Remove a service with its containers, volumes and data.
    Delete {
        service: String,
    },
    /// Show the newest version a service can be updated to.
    CheckUpdate {
        service: String,
    },
    /// Read or write environment variables.
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },
    /// Force-remove every service container and prune the engine.
    Purge {
        /// Confirm the purge.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Check host prerequisites, store health and repository access.
    Doctor,
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Generate man pages.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum EnvCommands {
    /// List shared and service-private variables.
    List,
    /// Store a variable. Use `[service]NAME` for a service-private one.
    Set {
        name: String,
        value: String,
        #[arg(long)]
        description: Option<String>,
        /// Allow the value to be changed later.
        #[arg(long, default_value_t = false)]
        mutable: bool,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BERTH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("configuration error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("store error:") || msg.starts_with("store lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> Result<u8, String> {
    let json = cli.json;
    match cli.command {
        Commands::Completions { shell } => return commands::completions::run::<Cli>(shell),
        Commands::ManPages { ref dir } => return commands::man_pages::run::<Cli>(dir),
        _ => {}
    }

    let config = AgentConfig::load_or_default(&cli.config).map_err(|e| e.to_string())?;
    if matches!(cli.command, Commands::Doctor) {
        return commands::doctor::run(&config, json);
    }

    let layout = StoreLayout::new(&config.store_root);
    let lock_path = layout.lock_file();
    let _lock = StoreLock::try_acquire(&lock_path)
        .map_err(|e| format!("store lock: {e}"))?
        .ok_or_else(|| {
            format!(
                "store lock: {} is held by another berth process (use the agent's API while it runs)",
                lock_path.display()
            )
        })?;

    if config.driver == "docker" && std::env::var("BERTH_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = berth_runtime::check_docker_prereqs();
        if !missing.is_empty() {
            return Err(berth_runtime::format_missing(&missing));
        }
    }

    install_signal_handler();
    let fleet = Fleet::from_config(&config).map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Setup => commands::setup::run(&fleet, json),
        Commands::List { available } => commands::list::run(&fleet, available, json),
        Commands::Status { service } => commands::status::run(&fleet, &service, json),
        Commands::Install { service, no_start } => {
            commands::install::run(&fleet, &service, no_start, json)
        }
        Commands::Start { service } => commands::control::run(&fleet, &service, true, json),
        Commands::Stop { service } => commands::control::run(&fleet, &service, false, json),
        Commands::Update { service, version } => {
            commands::update::run(&fleet, &service, version.as_deref(), json)
        }
        Commands::Revert { service } => commands::revert::run(&fleet, &service, json),
        Commands::Rebuild { service } => commands::rebuild::run(&fleet, &service, json),
        Commands::Delete { service } => commands::delete::run(&fleet, &service, json),
        Commands::CheckUpdate { service } => commands::check_update::run(&fleet, &service, json),
        Commands::Env { command } => match command {
            EnvCommands::List => commands::env::list(&fleet, json),
            EnvCommands::Set {
                name,
                value,
                description,
                mutable,
            } => commands::env::set(
                &fleet,
                &name,
                &value,
                description.as_deref(),
                mutable,
                json,
            ),
        },
        Commands::Purge { yes } => commands::purge::run(&fleet, yes, json),
        Commands::Doctor | Commands::Completions { .. } | Commands::ManPages { .. } => {
            Ok(commands::EXIT_SUCCESS)
        }
    }
}
