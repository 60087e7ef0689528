//! Termgate gateway
//!
//! Serves one authenticated remote terminal session over WebSocket.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gateway::auth::{generate_token, SecretStore, TokenFileStore, TokenProvider};
use gateway::config::{default_config_path, Config};
use gateway::session::{PtySupervisor, SpawnOptions};
use gateway::{logging, Gateway, DRAIN_TIMEOUT};
use tokio_util::sync::CancellationToken;

/// Termgate - remote terminal gateway for a private overlay network.
#[derive(Parser, Debug)]
#[command(name = "termgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the gateway
    Start,

    /// Generate a new bearer token and write it to the token file
    GenerateToken {
        /// Overwrite an existing token file
        #[arg(long, short)]
        force: bool,
    },

    /// Validate the configuration and token file, then print the resolved settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides()?;
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };

    match cli.command {
        Commands::Start => {
            let guard = logging::init(&level, &config.logging.log_dir)?;
            let clean = run_gateway(config).await?;
            drop(guard);
            if !clean {
                std::process::exit(1);
            }
        }
        Commands::GenerateToken { force } => {
            logging::init_console(&level);
            let store = TokenFileStore::new(&config.auth.token_file);

            if store.path().exists() && !force {
                eprintln!(
                    "Error: token file already exists at {}",
                    store.path().display()
                );
                eprintln!("Use --force to replace it. Connected clients will need the new token.");
                std::process::exit(1);
            }

            let token = generate_token();
            store.set(&token)?;

            println!("Token written to {}", store.path().display());
            println!();
            println!("  {}", token);
            println!();
            println!("Enter this token in the client. Keep it secret.");
        }
        Commands::CheckConfig => {
            logging::init_console(&level);
            println!("Config file: {}", config_path.display());
            println!();
            println!("{}", config.to_toml()?);

            let auth = TokenProvider::new(TokenFileStore::new(&config.auth.token_file));
            match auth.init() {
                Ok(token) => println!("Token: ok ({} bytes)", token.len()),
                Err(e) => {
                    eprintln!("Token: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Runs the gateway until a termination signal or a fault. Returns `false`
/// when shutdown was not clean: a fault occurred or sessions did not drain.
async fn run_gateway(config: Config) -> anyhow::Result<bool> {
    let auth = TokenProvider::new(TokenFileStore::new(&config.auth.token_file));
    auth.init()?;

    let spawner = Arc::new(PtySupervisor::new(SpawnOptions::from(&config)));
    let gateway = Gateway::new(config, auth, spawner);
    let listener = gateway.bind().await?;

    let shutdown = gateway.shutdown_token();
    let faulted = install_fault_hook(shutdown.clone());

    let server = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.serve(listener).await }
    });

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {
            tracing::error!("Fatal fault; shutting down");
        }
    }

    let mut clean = !faulted.load(Ordering::SeqCst);

    if let Err(e) = gateway.shutdown(DRAIN_TIMEOUT).await {
        tracing::error!(error = %e, "Forcing exit");
        clean = false;
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Listener failed");
            clean = false;
        }
        Err(e) => {
            tracing::error!(error = %e, "Listener task panicked");
            clean = false;
        }
    }

    Ok(clean && !faulted.load(Ordering::SeqCst))
}

/// Routes panics on any thread into the shutdown path.
fn install_fault_hook(shutdown: CancellationToken) -> Arc<AtomicBool> {
    let faulted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&faulted);
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        flag.store(true, Ordering::SeqCst);
        shutdown.cancel();
    }));

    faulted
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }

    Ok(())
}
