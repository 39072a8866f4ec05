//! plcgw CLI entry point.
//!
//! Runs the gateway against simulated devices, or prints an example seed
//! configuration. Real protocol drivers plug in through
//! [`plcgw::drivers::DriverFactory`] when embedding the library.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use plcgw::drivers::{DriverFactory, SimDriverFactory};
use plcgw::polling::{PollingOptions, PollingOrchestrator};
use plcgw::registry::DeviceRegistry;
use plcgw::store::{ConfigStore, GatewaySnapshot, TagValueCache};
use plcgw::Result;

/// PLC Gateway - supervisory polling gateway for PLC fleets
#[derive(Parser, Debug)]
#[command(name = "plcgw", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway with simulated drivers
    Run {
        /// Seed configuration (TOML), applied only on first start
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory for the persisted gateway state
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },

    /// Print an example seed configuration
    Example,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, data_dir } => {
            if let Err(e) = run(config, data_dir).await {
                error!(error = %e, "gateway failed");
                std::process::exit(1);
            }
        }
        Commands::Example => print_example(),
    }
}

async fn run(seed_path: Option<PathBuf>, data_dir: PathBuf) -> Result<()> {
    let seed = match &seed_path {
        Some(path) => GatewaySnapshot::from_toml_file(path)?,
        None => GatewaySnapshot::default(),
    };

    let store = Arc::new(ConfigStore::open(data_dir.join("gateway.json"), seed)?);
    let factory: Arc<dyn DriverFactory> = Arc::new(SimDriverFactory::new());
    let registry = Arc::new(DeviceRegistry::new(Arc::clone(&store), factory));
    let cache = Arc::new(TagValueCache::new());

    let shutdown = CancellationToken::new();
    let listener = registry.spawn_listener(shutdown.clone());
    let status_log = spawn_status_logger(Arc::clone(&cache), shutdown.clone());

    let polling = PollingOrchestrator::spawn(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&cache),
        PollingOptions::default(),
    );

    info!(
        devices = store.list_devices().len(),
        tags = store.list_tags(None).len(),
        state = %store.path().display(),
        "gateway started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");

    polling.shutdown().await;
    shutdown.cancel();
    let _ = listener.await;
    let _ = status_log.await;
    registry.shutdown().await;

    info!("gateway stopped");
    Ok(())
}

fn spawn_status_logger(
    cache: Arc<TagValueCache>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = cache.subscribe_status();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                status = rx.recv() => match status {
                    Ok(status) => {
                        if status.online {
                            info!(device = %status.device_id, "device online");
                        } else {
                            info!(device = %status.device_id, "device offline");
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

fn print_example() {
    println!(
        r#"# plcgw seed configuration
#
# Applied on first start only; afterwards the gateway persists its own
# state under the data directory and runtime changes win.

[[devices]]
id = "plc1"
type = "SiemensS7"
host = "192.168.1.100"
port = 102
rack = 0
slot = 1
poll_interval_ms = 1000

[[devices]]
id = "meter1"
type = "ModbusTcp"
host = "192.168.1.101"
port = 502
station = 1
poll_interval_ms = 2000

[[tags]]
device_id = "plc1"
name = "temperature"
address = "DB1.DBD0"
data_type = "float32"

[[tags]]
device_id = "meter1"
name = "power"
address = "40001"
data_type = "int16"
"#
    );
}
