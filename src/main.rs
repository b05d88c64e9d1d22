use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use loragw_pkt_fwd::fwd::conf::GlobalConf;
use loragw_pkt_fwd::fwd::{Forwarder, SharedConcentrator};
use loragw_pkt_fwd::hal::sim::SimulatedConcentrator;

const DEFAULT_CONF_PATH:&str = "global_conf.json";


#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONF_PATH.to_string());
    info!("*** Packet Forwarder ***");
    info!("INFO: found configuration file {}, parsing it", path);
    let conf = GlobalConf::from_file(&path)?;

    let hal: SharedConcentrator = Arc::new(Mutex::new(SimulatedConcentrator::new()));
    let forwarder = Forwarder::start(conf, hal, None).await?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = sigint.recv() => info!("INFO: SIGINT received"),
        _ = sigterm.recv() => info!("INFO: SIGTERM received"),
        _ = sigquit.recv() => info!("INFO: SIGQUIT received"),
    }

    forwarder.shutdown().await;
    Ok(())
}
