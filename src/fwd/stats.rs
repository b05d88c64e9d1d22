use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::json::{stat_time, Stat};
use super::uplink::Uplink;
use super::Context;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    PushRcv,            /* frames captured from the radio */
    PushRcvOk,          /* captured frames with a valid CRC */
    RxBad,              /* captured frames with a CRC error */
    RxNoCrc,            /* captured frames without CRC */
    PushFwd,            /* frames packed into a PUSH_DATA */
    PushDgramSent,      /* PUSH_DATA datagrams handed to the socket, retries included */
    PushPayloadBytes,   /* payload bytes forwarded upstream */
    PushAck,            /* PUSH_ACK received for an in-flight token */
    PullSent,           /* PULL_DATA keepalives sent */
    PullAck,            /* PULL_ACK received for the last keepalive */
    PullRcv,            /* PULL_RESP received */
    TxRequested,        /* PULL_RESP carrying a well-formed txpk */
    TxRejectedCollision,
    TxRejectedLate,
    TxRejectedEarly,
    TxRejectedParams,
    PullTrans,          /* frames handed to the radio */
    TxFail,             /* hand-offs that missed their deadline or were refused */
}

const NB_COUNTERS: usize = Counter::TxFail as usize + 1;

/// Process-wide counters. Cumulative, only a restart clears them.
#[derive(Debug, Default)]
pub struct GatewayStats {
    counters: [AtomicU64; NB_COUNTERS],
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            push_rcv: self.get(Counter::PushRcv),
            push_rcv_ok: self.get(Counter::PushRcvOk),
            rx_bad: self.get(Counter::RxBad),
            rx_nocrc: self.get(Counter::RxNoCrc),
            push_fwd: self.get(Counter::PushFwd),
            push_dgram_sent: self.get(Counter::PushDgramSent),
            push_payload_bytes: self.get(Counter::PushPayloadBytes),
            push_ack: self.get(Counter::PushAck),
            pull_sent: self.get(Counter::PullSent),
            pull_ack: self.get(Counter::PullAck),
            pull_rcv: self.get(Counter::PullRcv),
            tx_requested: self.get(Counter::TxRequested),
            tx_rejected: self.get(Counter::TxRejectedCollision)
                + self.get(Counter::TxRejectedLate)
                + self.get(Counter::TxRejectedEarly)
                + self.get(Counter::TxRejectedParams),
            pull_trans: self.get(Counter::PullTrans),
            tx_fail: self.get(Counter::TxFail),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub push_rcv: u64,
    pub push_rcv_ok: u64,
    pub rx_bad: u64,
    pub rx_nocrc: u64,
    pub push_fwd: u64,
    pub push_dgram_sent: u64,
    pub push_payload_bytes: u64,
    pub push_ack: u64,
    pub pull_sent: u64,
    pub pull_ack: u64,
    pub pull_rcv: u64,
    pub tx_requested: u64,
    pub tx_rejected: u64,
    pub pull_trans: u64,
    pub tx_fail: u64,
}

impl StatsSnapshot {
    /// Percentage of PUSH_DATA datagrams that got acknowledged.
    pub fn ack_ratio(&self) -> f64 {
        if self.push_dgram_sent == 0 {
            return 0.0;
        }
        (1000.0 * self.push_ack as f64 / self.push_dgram_sent as f64).round() / 10.0
    }

    pub fn to_stat(&self, time: String) -> Stat {
        Stat {
            time,
            rxnb: self.push_rcv,
            rxok: self.push_rcv_ok,
            rxfw: self.push_fwd,
            ackr: self.ack_ratio(),
            dwnb: self.pull_rcv,
            txnb: self.pull_trans,
        }
    }

    pub fn log(&self) {
        info!("##### {} #####", stat_time(Utc::now()));
        info!("### [UPSTREAM] ###");
        info!("# RF packets received by concentrator: {}", self.push_rcv);
        info!(
            "# CRC_OK: {}, CRC_FAIL: {}, NO_CRC: {}",
            self.push_rcv_ok, self.rx_bad, self.rx_nocrc
        );
        info!("# RF packets forwarded: {} ({} bytes)", self.push_fwd, self.push_payload_bytes);
        info!("# PUSH_DATA datagrams sent: {}", self.push_dgram_sent);
        info!("# PUSH_DATA acknowledged: {:.1}%", self.ack_ratio());
        info!("### [DOWNSTREAM] ###");
        info!("# PULL_DATA sent: {} ({} acknowledged)", self.pull_sent, self.pull_ack);
        info!("# PULL_RESP(onse) datagrams received: {}", self.pull_rcv);
        info!(
            "# TX requested: {}, rejected: {}, transmitted: {}, failed: {}",
            self.tx_requested, self.tx_rejected, self.pull_trans, self.tx_fail
        );
        info!("##### END #####");
    }
}


/// Logs a snapshot every `stat_interval` seconds and queues it for upstream.
pub async fn run_reporter(ctx: Arc<Context>, uplink: mpsc::Sender<Uplink>) {
    let period = Duration::from_secs(ctx.conf.gateway_conf.stat_interval.max(1));
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tick.tick() => {
                let snapshot = ctx.stats.snapshot();
                snapshot.log();
                let stat = snapshot.to_stat(stat_time(Utc::now()));
                if let Err(e) = uplink.try_send(Uplink::Status(stat)) {
                    warn!(e=?e, "WARNING: [stat] status report not queued");
                }
            }
        }
    }
    info!("INFO: End of statistics thread");
}
