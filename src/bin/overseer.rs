use clap::{Parser, Subcommand};
use overseer::catalog::ProcessCatalog;
use overseer::client::HttpEngineApi;
use overseer::config::Config;
use overseer::machines::{Machine, MachineRegistry};
use overseer::manager::PollingManager;
use overseer::persistence;
use overseer::store::ReconciliationStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll a fleet of engines and log consolidated state changes
    Run {
        /// Path to the polling config YAML file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Engine address as host:port, repeatable
        #[arg(long = "engine")]
        engines: Vec<String>,

        /// Path of the persisted deployment snapshot
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

fn parse_engine(address: &str) -> anyhow::Result<Machine> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("engine address must be host:port, got {address}"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid port in engine address {address}"))?;
    Ok(Machine::new(address, host, port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Run {
            config,
            engines,
            snapshot,
        } => {
            let config = match config {
                Some(path) => Config::load(path)?,
                None => Config::default(),
            };

            let registry = Arc::new(MachineRegistry::new());
            for address in engines {
                registry.add_machine(parse_engine(address)?, false);
            }

            let api = Arc::new(HttpEngineApi::new());
            let store = Arc::new(ReconciliationStore::new());
            let catalog = Arc::new(ProcessCatalog::new());

            if let Some(path) = snapshot {
                persistence::load_snapshot(path, &store)?;
            }

            registry.refresh_statuses(api.as_ref()).await;
            info!(
                machines = registry.machines().len(),
                connected = registry.connected_machines().len(),
                "machine registry initialized"
            );

            let manager = PollingManager::new(
                Arc::clone(&registry),
                api,
                Arc::clone(&store),
                Arc::clone(&catalog),
                config,
            );
            manager.poll_deployment_info();
            manager.poll_active_user_tasks();

            let mut events = store.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    info!(?event, "store changed");
                }
            });

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            manager.stop_polling_deployment_info();
            manager.stop_polling_active_user_tasks();

            if let Some(path) = snapshot {
                persistence::save_snapshot(path, &store, &catalog)?;
            }
        }
    }

    Ok(())
}
