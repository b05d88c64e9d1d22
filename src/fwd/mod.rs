pub mod conf;
pub mod credentials;
pub mod downlink;
pub mod error;
pub mod json;
pub mod protocol;
pub mod stats;
pub mod transport;
pub mod uplink;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::hal::Concentrator;

use conf::GlobalConf;
use credentials::CredentialStore;
use downlink::{DownlinkScheduler, Downstream};
use stats::GatewayStats;
use transport::{Transport, UdpTransport};
use uplink::{Uplink, UplinkDispatcher};


pub const UPLINK_QUEUE_SIZE:usize =  64;      /* frames and reports waiting for the upstream unit */
pub const TX_OUTCOME_QUEUE_SIZE:usize = 16;


/// 64-bit gateway EUI, big-endian as it appears on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GatewayId(pub [u8; 8]);

impl GatewayId {
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(|v| GatewayId(v.to_be_bytes()))
    }
}

impl std::fmt::Display for GatewayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}


pub type SharedConcentrator = Arc<Mutex<dyn Concentrator>>;

/// State shared by every unit of the forwarder.
#[derive(Debug)]
pub struct Context {
    pub gateway_id: GatewayId,
    pub conf: GlobalConf,
    pub stats: GatewayStats,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn new(conf: GlobalConf) -> Arc<Self> {
        Arc::new(Self {
            gateway_id: conf.gateway_conf.gateway_id,
            conf,
            stats: GatewayStats::new(),
            cancel: CancellationToken::new(),
        })
    }
}


/// Capture unit: polls the concentrator and feeds the upstream queue.
pub async fn run_capture(ctx: Arc<Context>, hal: SharedConcentrator, uplink: mpsc::Sender<Uplink>) {
    let fetch_sleep = Duration::from_millis(ctx.conf.gateway_conf.fetch_sleep_ms.max(1));

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let frame = hal.lock().unwrap().capture_frame();
        match frame {
            Some(frame) => {
                if uplink.send(Uplink::Frame(frame)).await.is_err() {
                    break;
                }
            }
            None => tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep(fetch_sleep) => {}
            },
        }
    }
    info!("INFO: End of capture thread");
}


/// A running packet forwarder.
pub struct Forwarder {
    ctx: Arc<Context>,
    push: Arc<UdpTransport>,
    pull: Arc<UdpTransport>,
    scheduler: Arc<DownlinkScheduler>,
    tasks: Vec<JoinHandle<()>>,
}

impl Forwarder {
    pub async fn start(
        conf: GlobalConf,
        hal: SharedConcentrator,
        credentials: Option<Arc<dyn CredentialStore>>,
    ) -> Result<Self> {
        let ctx = Context::new(conf);
        let gw = &ctx.conf.gateway_conf;
        info!("INFO: gateway MAC address is configured to {}", ctx.gateway_id);
        if gw.known_devices_only && credentials.is_none() {
            warn!("WARNING: known_devices_only is set but no credential store is available, forwarding everything");
        }

        let push = Arc::new(
            UdpTransport::connect(gw.push_target())
                .await
                .with_context(|| format!("failed to open upstream socket to {}", gw.push_target()))?,
        );
        let pull = Arc::new(
            UdpTransport::connect(gw.pull_target())
                .await
                .with_context(|| format!("failed to open downstream socket to {}", gw.pull_target()))?,
        );
        info!("INFO: upstream to {}, downstream to {}", push.target(), pull.target());

        let (uplink_tx, uplink_rx) = mpsc::channel(UPLINK_QUEUE_SIZE);
        let (outcome_tx, outcome_rx) = mpsc::channel(TX_OUTCOME_QUEUE_SIZE);

        let mut dispatcher = UplinkDispatcher::new(ctx.clone());
        if let Some(store) = credentials {
            dispatcher = dispatcher.with_credential_store(store);
        }
        let scheduler = Arc::new(DownlinkScheduler::new(ctx.clone(), hal.clone()));
        let downstream = Downstream::new(ctx.clone(), scheduler.clone());

        let push_transport: Arc<dyn Transport> = push.clone();
        let pull_transport: Arc<dyn Transport> = pull.clone();
        let tasks = vec![
            tokio::spawn(run_capture(ctx.clone(), hal, uplink_tx.clone())),
            tokio::spawn(dispatcher.run(push_transport, uplink_rx)),
            tokio::spawn(stats::run_reporter(ctx.clone(), uplink_tx)),
            tokio::spawn(downstream.run(pull_transport, outcome_rx)),
            tokio::spawn(scheduler.clone().run_tx(outcome_tx)),
        ];

        Ok(Self { ctx, push, pull, scheduler, tasks })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn scheduler(&self) -> &Arc<DownlinkScheduler> {
        &self.scheduler
    }

    /// Stops every unit and waits for them to exit.
    pub async fn shutdown(self) {
        info!("INFO: shutting down packet forwarder");
        self.ctx.cancel.cancel();
        self.push.close();
        self.pull.close();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("ERROR: task ended abnormally: {}", e);
            }
        }
        self.ctx.stats.snapshot().log();
        info!("INFO: Exiting packet forwarder program");
    }
}
