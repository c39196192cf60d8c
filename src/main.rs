//! wirewan main entry point
//!
//! This binary serves the overlay control plane. It handles CLI parsing,
//! logging setup, startup validation of required secrets, and the HTTP
//! server lifecycle.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wirewan::api::{build_router, AppState};
use wirewan::config::Settings;
use wirewan::deploy::{DeployEngine, HttpConnector};
use wirewan::dns::DnsPublisher;
use wirewan::model::Store;
use wirewan::secrets::SecretEnvelope;
use wirewan::{APP_NAME, VERSION};

/// WireGuard WAN overlay manager
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "/etc/wirewan/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the control-plane server
    Serve,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize structured logging with tracing
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run the CLI command
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve => {
            info!("Starting {} v{} with config: {}", APP_NAME, VERSION, cli.config);
            let settings = Arc::new(Settings::load(Some(&cli.config))?);

            // Missing encryption key material is fatal here, not at first
            // credential use.
            let envelope = Arc::new(SecretEnvelope::from_settings(&settings)?);

            let store = Arc::new(Store::new());
            let engine = Arc::new(DeployEngine::new(
                store.clone(),
                settings.clone(),
                envelope.clone(),
                Arc::new(HttpConnector),
            ));
            let dns = Arc::new(DnsPublisher::from_settings(&settings));
            if dns.is_configured() {
                info!("DNS publishing enabled");
            }

            let state = AppState {
                store,
                settings: settings.clone(),
                envelope,
                engine,
                dns,
            };
            let app = build_router(state);

            let listener = tokio::net::TcpListener::bind(&settings.bind_address).await?;
            info!("Control API listening on {}", settings.bind_address);

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            info!("Shutting down");
            Ok(())
        }
        Commands::Version => {
            println!("{} v{}", APP_NAME, VERSION);
            Ok(())
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
