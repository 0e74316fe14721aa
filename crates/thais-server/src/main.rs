use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use thais_runner::logging::{init_logging, level_for_verbosity};
use thais_runner::{ConfigLoadError, LoggingObserver, ShardRunner, ThaisConfig};
use thais_server::{DemoDecoder, GameWorld, Listener};

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enables debug mode
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Config file to use instead of the platform default
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Write an example config file and exit
    #[arg(long)]
    init_config: bool,
}

fn create_example_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path,
        None => ThaisConfig::config_path()?,
    };
    ThaisConfig::default().save_to(&path)?;
    eprintln!("Config file created at: {}", path.display());
    eprintln!("Edit it to change the listen address or tick rate, then start thais-server again.");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<ThaisConfig> {
    let loaded = match &cli.config {
        Some(path) => ThaisConfig::load_from(path),
        None => ThaisConfig::load(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(ConfigLoadError::NotFound) if cli.config.is_none() => ThaisConfig::default(),
        Err(e) => return Err(e).context("loading config"),
    };

    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.init_config {
        return create_example_config(cli.config);
    }

    let config = load_config(&cli)?;
    let _log_guard = init_logging("server", level_for_verbosity(cli.debug), config.logging.file)?;
    info!("Starting thais-server...");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut runner = ShardRunner::builder()
        .with_world(GameWorld::new())
        .with_config(config.scheduler.clone())
        .with_observer(LoggingObserver::new())
        .with_shutdown(shutdown_rx.clone())
        .handle_ctrl_c(false)
        .build()?;
    let bridge = runner.bridge(Arc::new(DemoDecoder));

    let address = config.server.address();
    let listener = Listener::bind(&address, bridge.clone(), config.server.max_packet_len)
        .await
        .with_context(|| format!("binding {address}"))?;

    let shard = tokio::spawn(runner.run());
    let mut server = tokio::spawn(listener.serve(shutdown_rx));

    let served = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down");
            None
        }
        served = &mut server => {
            warn!("Listener stopped before shutdown was requested");
            Some(served)
        }
    };

    let _ = shutdown_tx.send(true);
    let served = match served {
        Some(served) => served,
        None => server.await,
    };
    served??;
    let report = shard.await??;

    info!(
        "Shard finished at tick {} with {} player action(s)",
        report.world.tick,
        report.world.total_actions()
    );
    info!("{}", bridge.stats());
    Ok(())
}
