//! Downstream half of the forwarder: PULL_RESP in, radio transmissions out.
//!
//! Accepted requests wait in a time-ordered queue. The head is handed to the
//! concentrator `tx_jit_lead_us` before its deadline and then occupies the
//! single armed slot until its emission is over. A request whose transmit
//! window overlaps a queued or armed one is refused.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::prelude::*;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::hal::{
    time_on_air, ts_diff, tx_start_delay, Modulation, RadioFrame, BW_UNDEFINED,
    MIN_FSK_PREAMBLE, MIN_LORA_PREAMBLE, STD_FSK_PREAMBLE, STD_LORA_PREAMBLE,
};

use super::conf::TxConf;
use super::error::{Error, ParamFault};
use super::json::{bw_from_khz, codr_from_str, Datr, PullRespBody, TxAckBody, TxpkAck};
use super::protocol::{self, Message};
use super::stats::Counter;
use super::transport::{reconnect_with_backoff, Transport};
use super::uplink::{PendingAck, RECV_BUFF_SIZE};
use super::{Context, GatewayId, SharedConcentrator};


pub const TX_POLL_MS:u64 = 1;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxTiming {
    Immediate,
    Timestamped(u32),
    OnGps(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxRequest {
    pub timing: TxTiming,
    pub frame: RadioFrame,
}

/// Reads the `txpk` object of a PULL_RESP body.
///
/// Structural problems (no `txpk`, a mandatory field missing, undecodable
/// data) come back as `Malformed` and are dropped without a reply. Values
/// that are well formed but cannot be transmitted are `RejectedParameters`.
pub fn parse_txpk(body: &Value) -> Result<TxRequest, Error> {
    let txpk = match serde_json::from_value::<PullRespBody>(body.clone()) {
        Ok(resp) => resp.txpk,
        Err(e) => {
            debug!(e=?e, "INFO: [down] txpk object rejected");
            return Err(Error::Malformed("no valid \"txpk\" object in JSON"));
        }
    };

    let timing = if txpk.imme {
        TxTiming::Immediate
    } else if let Some(tmst) = txpk.tmst {
        TxTiming::Timestamped(tmst)
    } else if let Some(tmms) = txpk.tmms {
        TxTiming::OnGps(tmms)
    } else {
        return Err(Error::Malformed("no mandatory \"txpk.tmst\" or \"txpk.tmms\""));
    };

    let freq = txpk.freq.ok_or(Error::Malformed("no mandatory \"txpk.freq\""))?;
    let rfch = txpk.rfch.ok_or(Error::Malformed("no mandatory \"txpk.rfch\""))?;
    let modu = txpk.modu.as_deref().ok_or(Error::Malformed("no mandatory \"txpk.modu\""))?;

    let mut frame = RadioFrame {
        freq_hz: if freq > 0.0 { (freq * 1e6).round() as u32 } else { 0 },
        invert_pol: txpk.ipol,
        no_crc: txpk.ncrc,
        ..Default::default()
    };

    match modu {
        "LORA" => {
            frame.modulation = Modulation::LORA;
            let datr = match txpk.datr {
                Some(Datr::Lora(ref s)) => s.as_str(),
                Some(Datr::Fsk(_)) => return Err(Error::Malformed("format error in \"txpk.datr\"")),
                None => return Err(Error::Malformed("no mandatory \"txpk.datr\"")),
            };
            let (sf, bw_khz) = Datr::parse_lora(datr).ok_or(Error::Malformed("format error in \"txpk.datr\""))?;
            if !(7..=12).contains(&sf) {
                return Err(Error::RejectedParameters(ParamFault::Modulation));
            }
            frame.datarate = sf;
            frame.bandwidth = bw_from_khz(bw_khz).ok_or(Error::RejectedParameters(ParamFault::Modulation))?;

            let codr = txpk.codr.as_deref().ok_or(Error::Malformed("no mandatory \"txpk.codr\""))?;
            frame.coderate = codr_from_str(codr).ok_or(Error::RejectedParameters(ParamFault::Modulation))?;

            frame.preamble = txpk.prea.unwrap_or(STD_LORA_PREAMBLE).max(MIN_LORA_PREAMBLE);
        }
        "FSK" => {
            frame.modulation = Modulation::FSK;
            frame.bandwidth = BW_UNDEFINED;
            frame.datarate = match txpk.datr {
                Some(Datr::Fsk(bps)) => bps,
                Some(Datr::Lora(_)) => return Err(Error::Malformed("format error in \"txpk.datr\"")),
                None => return Err(Error::Malformed("no mandatory \"txpk.datr\"")),
            };
            let fdev = txpk.fdev.ok_or(Error::Malformed("no mandatory \"txpk.fdev\""))?;
            frame.f_dev = (fdev / 1000).min(u8::MAX as u32) as u8;
            frame.preamble = txpk.prea.unwrap_or(STD_FSK_PREAMBLE).max(MIN_FSK_PREAMBLE);
        }
        other => {
            warn!("WARNING: [down] invalid modulation in \"txpk.modu\": {}", other);
            return Err(Error::RejectedParameters(ParamFault::Modulation));
        }
    }

    let size = txpk.size.ok_or(Error::Malformed("no mandatory \"txpk.size\""))?;
    let data = txpk.data.as_deref().ok_or(Error::Malformed("no mandatory \"txpk.data\""))?;
    frame.payload = BASE64_STANDARD
        .decode(data)
        .map_err(|_| Error::Malformed("format error in \"txpk.data\""))?;
    if frame.payload.len() != size as usize {
        warn!("WARNING: [down] mismatch between .size ({}) and .data size ({}) once converted to binary", size, frame.payload.len());
    }
    frame
        .check_size()
        .map_err(|_| Error::RejectedParameters(ParamFault::Size))?;

    /* values the radio fields cannot hold */
    frame.rf_chain = u8::try_from(rfch).map_err(|_| {
        error!("ERROR: [down] Packet REJECTED, invalid RF chain {}", rfch);
        Error::RejectedParameters(ParamFault::RfChain)
    })?;
    let powe = txpk.powe.unwrap_or(0);
    frame.rf_power = i8::try_from(powe).map_err(|_| {
        error!("ERROR: [down] Packet REJECTED, unsupported RF power - {}dBm", powe);
        Error::RejectedParameters(ParamFault::Power)
    })?;

    Ok(TxRequest { timing, frame })
}

/// Checks frequency, power and RF chain against the TX chain limits.
pub fn validate(frame: &RadioFrame, tx_conf: &TxConf) -> Result<(), Error> {
    let chain = match tx_conf.chains.get(frame.rf_chain as usize) {
        Some(chain) if chain.tx_enable => chain,
        _ => {
            error!("ERROR: [down] Packet REJECTED, TX not enabled on RF chain {}", frame.rf_chain);
            return Err(Error::RejectedParameters(ParamFault::RfChain));
        }
    };
    if frame.freq_hz < chain.tx_freq_min || frame.freq_hz > chain.tx_freq_max {
        error!(
            "ERROR: [down] Packet REJECTED, unsupported frequency - {} (min:{},max:{})",
            frame.freq_hz, chain.tx_freq_min, chain.tx_freq_max
        );
        return Err(Error::RejectedParameters(ParamFault::Freq));
    }
    if frame.rf_power < chain.tx_power_min || frame.rf_power > chain.tx_power_max {
        error!(
            "ERROR: [down] Packet REJECTED, unsupported RF power - {}dBm (min:{},max:{})",
            frame.rf_power, chain.tx_power_min, chain.tx_power_max
        );
        return Err(Error::RejectedParameters(ParamFault::Power));
    }
    Ok(())
}


/// Counter interval `[start, end)` a transmission keeps the radio busy,
/// margins included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxWindow {
    pub start: u32,
    pub end: u32,
}

impl TxWindow {
    fn overlaps(&self, other: &TxWindow, now: u32) -> bool {
        let (a0, a1) = (ts_diff(self.start, now) as i64, ts_diff(self.end, now) as i64);
        let (b0, b1) = (ts_diff(other.start, now) as i64, ts_diff(other.end, now) as i64);
        a0 < b1 && b0 < a1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTx {
    pub token: u16,
    pub target: u32,     /* counter value of the first RF symbol */
    pub deadline: u32,   /* counter value the radio must be triggered at */
    pub airtime_us: u32,
    pub frame: RadioFrame,
}

impl ScheduledTx {
    pub fn new(token: u16, target: u32, mut frame: RadioFrame) -> Result<Self, Error> {
        let airtime_us = time_on_air(&frame).map_err(|e| {
            warn!(e=?e, "WARNING: [down] cannot compute time on air");
            Error::RejectedParameters(ParamFault::Modulation)
        })?;
        let deadline = target.wrapping_sub(tx_start_delay(frame.bandwidth) as u32);
        frame.count_us = deadline;
        Ok(Self { token, target, deadline, airtime_us, frame })
    }

    pub fn window(&self, margin_us: u32) -> TxWindow {
        TxWindow {
            start: self.deadline.wrapping_sub(margin_us),
            end: self.target.wrapping_add(self.airtime_us).wrapping_add(margin_us),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArmedSlot {
    token: u16,
    window: TxWindow,
}

/// Accepted downlinks of one concentrator.
#[derive(Debug)]
pub struct TxSchedule {
    queue: VecDeque<ScheduledTx>,
    armed: Option<ArmedSlot>,
    capacity: usize,
    margin_us: u32,
    lead_us: u32,
    max_advance_us: u32,
}

impl TxSchedule {
    pub fn new(conf: &TxConf) -> Self {
        Self {
            queue: VecDeque::with_capacity(conf.jit_queue_size),
            armed: None,
            capacity: conf.jit_queue_size,
            margin_us: conf.tx_margin_us,
            lead_us: conf.tx_jit_lead_us,
            max_advance_us: conf.tx_max_advance_us,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    fn release_finished(&mut self, now: u32) {
        if let Some(armed) = self.armed {
            if ts_diff(now, armed.window.end) >= 0 {
                debug!(token = armed.token, "INFO: [jit] TX slot released");
                self.armed = None;
            }
        }
    }

    pub fn enqueue(&mut self, now: u32, tx: ScheduledTx) -> Result<(), Error> {
        self.release_finished(now);

        if (ts_diff(tx.deadline, now) as i64) < self.margin_us as i64 {
            return Err(Error::RejectedLate);
        }
        if ts_diff(tx.target, now) as i64 > self.max_advance_us as i64 {
            return Err(Error::RejectedEarly);
        }

        let window = tx.window(self.margin_us);
        let armed_collides = self.armed.map_or(false, |armed| armed.window.overlaps(&window, now));
        if armed_collides || self.queue.iter().any(|q| q.window(self.margin_us).overlaps(&window, now)) {
            return Err(Error::RejectedCollision);
        }
        if self.queue.len() >= self.capacity {
            warn!("WARNING: [jit] queue is full ({} packets)", self.capacity);
            return Err(Error::RejectedCollision);
        }

        let pos = self
            .queue
            .partition_point(|q| ts_diff(q.deadline, now) <= ts_diff(tx.deadline, now));
        debug!(token = tx.token, target = tx.target, airtime_us = tx.airtime_us, "INFO: [jit] packet enqueued at position {}", pos);
        self.queue.insert(pos, tx);
        Ok(())
    }

    /// Moves the head into the armed slot once its deadline is within the
    /// lead window and the slot is free.
    pub fn take_due(&mut self, now: u32) -> Option<ScheduledTx> {
        self.release_finished(now);
        if self.armed.is_some() {
            return None;
        }
        let head = self.queue.front()?;
        if ts_diff(head.deadline, now) as i64 > self.lead_us as i64 {
            return None;
        }
        let tx = self.queue.pop_front()?;
        self.armed = Some(ArmedSlot { token: tx.token, window: tx.window(self.margin_us) });
        Some(tx)
    }

    pub fn disarm(&mut self, token: u16) {
        if self.armed.map_or(false, |armed| armed.token == token) {
            self.armed = None;
        }
    }
}


#[derive(Debug)]
pub struct TxOutcome {
    pub token: u16,
    pub result: Result<(), Error>,
}

pub fn encode_tx_ack(gateway_id: GatewayId, token: u16, error: Option<&str>) -> Vec<u8> {
    let body = error.and_then(|code| {
        serde_json::to_value(TxAckBody { txpk_ack: TxpkAck { error: code.to_string() } }).ok()
    });
    protocol::encode(&Message::TxAck { token, gateway_id, body })
}


pub struct DownlinkScheduler {
    ctx: Arc<Context>,
    schedule: Mutex<TxSchedule>,
    hal: SharedConcentrator,
}

impl DownlinkScheduler {
    pub fn new(ctx: Arc<Context>, hal: SharedConcentrator) -> Self {
        let schedule = Mutex::new(TxSchedule::new(&ctx.conf.tx_conf));
        Self { ctx, schedule, hal }
    }

    pub fn queued(&self) -> usize {
        self.schedule.lock().unwrap().len()
    }

    pub fn is_armed(&self) -> bool {
        self.schedule.lock().unwrap().is_armed()
    }

    /// Validates a PULL_RESP body and queues the transmission it describes.
    pub fn submit(&self, token: u16, body: &Value) -> Result<(), Error> {
        let request = match parse_txpk(body) {
            Err(e @ Error::Malformed(_)) => return Err(e),
            parsed => {
                self.ctx.stats.incr(Counter::TxRequested);
                parsed?
            }
        };

        if let TxTiming::OnGps(tmms) = request.timing {
            warn!("WARNING: [down] no valid GPS time reference, impossible to send packet at GPS time {}", tmms);
            return Err(Error::GpsUnlocked);
        }
        validate(&request.frame, &self.ctx.conf.tx_conf)?;

        let now = self.hal.lock().unwrap().current_timestamp();
        let target = match request.timing {
            TxTiming::Timestamped(tmst) => tmst,
            _ => {
                let tx_conf = &self.ctx.conf.tx_conf;
                now.wrapping_add(tx_conf.tx_jit_lead_us)
                    .wrapping_add(tx_conf.tx_margin_us)
                    .wrapping_add(tx_start_delay(request.frame.bandwidth) as u32)
            }
        };
        let tx = ScheduledTx::new(token, target, request.frame)?;
        self.schedule.lock().unwrap().enqueue(now, tx)
    }

    /// Handles one PULL_RESP. Returns the TX_ACK to send right away when
    /// the request is refused.
    pub fn handle_pull_resp(&self, token: u16, body: &Value) -> Option<Vec<u8>> {
        let e = match self.submit(token, body) {
            Ok(()) => {
                info!(token, "INFO: [down] packet accepted for transmission");
                return None;
            }
            Err(e) => e,
        };

        let counter = match e {
            Error::RejectedCollision => Some(Counter::TxRejectedCollision),
            Error::RejectedLate => Some(Counter::TxRejectedLate),
            Error::RejectedEarly => Some(Counter::TxRejectedEarly),
            Error::RejectedParameters(_) | Error::GpsUnlocked => Some(Counter::TxRejectedParams),
            _ => None,
        };
        if let Some(counter) = counter {
            self.ctx.stats.incr(counter);
        }

        match e.tx_ack_code() {
            Some(code) => {
                warn!(token, "WARNING: [down] packet REJECTED ({})", code);
                Some(encode_tx_ack(self.ctx.gateway_id, token, Some(code)))
            }
            None => {
                warn!(token, "WARNING: [down] {}, TX aborted", e);
                None
            }
        }
    }

    /// Hands the next due transmission to the concentrator, if any.
    pub fn dispatch_due(&self) -> Option<TxOutcome> {
        let now = self.hal.lock().unwrap().current_timestamp();
        let tx = self.schedule.lock().unwrap().take_due(now)?;

        let result = {
            let mut hal = self.hal.lock().unwrap();
            let now = hal.current_timestamp();
            if ts_diff(tx.deadline, now) <= 0 {
                Err(Error::RejectedLate)
            } else if !hal.transmit(&tx.frame, tx.deadline) {
                Err(Error::TxFailed)
            } else {
                Ok(())
            }
        };

        match &result {
            Ok(()) => {
                self.ctx.stats.incr(Counter::PullTrans);
                info!(token = tx.token, count_us = tx.deadline, "INFO: [jit] frame handed to the concentrator: {}", tx.frame);
            }
            Err(e) => {
                self.schedule.lock().unwrap().disarm(tx.token);
                self.ctx.stats.incr(Counter::TxFail);
                error!(token = tx.token, "ERROR: [jit] transmission failed: {}", e);
            }
        }
        Some(TxOutcome { token: tx.token, result })
    }

    /// TX unit: polls the schedule and reports every hand-off.
    pub async fn run_tx(self: Arc<Self>, outcomes: mpsc::Sender<TxOutcome>) {
        let mut tick = tokio::time::interval(Duration::from_millis(TX_POLL_MS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Some(outcome) = self.dispatch_due() {
                        if outcomes.send(outcome).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!("INFO: End of JIT thread");
    }
}


/// Pull side of the protocol: keepalives, PULL_RESP intake and TX_ACKs.
pub struct Downstream {
    ctx: Arc<Context>,
    scheduler: Arc<DownlinkScheduler>,
    pull: Option<PendingAck>,
}

impl Downstream {
    pub fn new(ctx: Arc<Context>, scheduler: Arc<DownlinkScheduler>) -> Self {
        Self { ctx, scheduler, pull: None }
    }

    pub fn keepalive(&mut self, now: Instant) -> Vec<u8> {
        if let Some(previous) = &self.pull {
            warn!(token = previous.token, "WARNING: [down] no PULL_ACK received for the last PULL_DATA");
        }
        let token: u16 = rand::rng().random();
        let datagram = protocol::encode(&Message::PullData { token, gateway_id: self.ctx.gateway_id });
        self.pull = Some(PendingAck { token, sent_at: now, retry_count: 0, datagram: datagram.clone() });
        datagram
    }

    pub fn awaiting_pull_ack(&self) -> bool {
        self.pull.is_some()
    }

    /// Processes a datagram from the pull socket, returning the immediate
    /// reply if one is due.
    pub fn handle_datagram(&mut self, buff: &[u8]) -> Option<Vec<u8>> {
        match protocol::decode(buff) {
            Ok(Message::PullAck { token }) => {
                match &self.pull {
                    Some(pending) if pending.token == token => {
                        self.ctx.stats.incr(Counter::PullAck);
                        debug!(token, "INFO: [down] PULL_ACK received in {:?}", pending.sent_at.elapsed());
                        self.pull = None;
                    }
                    _ => warn!(token, "WARNING: [down] received out-of-sync PULL_ACK"),
                }
                None
            }
            Ok(Message::PullResp { token, body }) => {
                self.ctx.stats.incr(Counter::PullRcv);
                debug!(token, "INFO: [down] PULL_RESP received: {}", body);
                self.scheduler.handle_pull_resp(token, &body)
            }
            Ok(other) => {
                debug!("INFO: [down] ignoring message of type {} on pull socket", other.kind());
                None
            }
            Err(e) => {
                warn!(e=?e, "WARNING: [down] ignoring invalid datagram ({} bytes)", buff.len());
                None
            }
        }
    }

    pub fn tx_ack(&self, outcome: &TxOutcome) -> Vec<u8> {
        let code = match &outcome.result {
            Ok(()) => None,
            Err(e) => e.tx_ack_code(),
        };
        encode_tx_ack(self.ctx.gateway_id, outcome.token, code)
    }

    async fn send(&self, transport: &dyn Transport, datagram: &[u8]) -> bool {
        match transport.send(datagram).await {
            Ok(()) => true,
            Err(e) => {
                warn!(e=?e, "WARNING: [down] send failed");
                reconnect_with_backoff(transport, &self.ctx.conf.gateway_conf, &self.ctx.cancel).await
            }
        }
    }

    pub async fn run(mut self, transport: Arc<dyn Transport>, mut outcomes: mpsc::Receiver<TxOutcome>) {
        let cancel = self.ctx.cancel.clone();
        let period = Duration::from_secs(self.ctx.conf.gateway_conf.keepalive_interval.max(1));
        let mut keepalive = tokio::time::interval(period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let recv_timeout = Duration::from_millis(self.ctx.conf.gateway_conf.pull_timeout_ms.max(1));
        let mut buff = vec![0u8; RECV_BUFF_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = keepalive.tick() => {
                    let datagram = self.keepalive(Instant::now());
                    if self.send(transport.as_ref(), &datagram).await {
                        self.ctx.stats.incr(Counter::PullSent);
                    }
                }
                res = tokio::time::timeout(recv_timeout, transport.recv(&mut buff)) => match res {
                    Err(_) => {}
                    Ok(Ok(n)) => {
                        if let Some(reply) = self.handle_datagram(&buff[..n]) {
                            self.send(transport.as_ref(), &reply).await;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(e=?e, "WARNING: [down] receive failed");
                        reconnect_with_backoff(transport.as_ref(), &self.ctx.conf.gateway_conf, &cancel).await;
                    }
                },
                Some(outcome) = outcomes.recv() => {
                    let datagram = self.tx_ack(&outcome);
                    self.send(transport.as_ref(), &datagram).await;
                }
            }
        }
        info!("INFO: End of downstream thread");
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::fwd::conf::GlobalConf;
    use crate::hal::sim::SimulatedConcentrator;
    use crate::hal::{BW_125KHZ, DR_LORA_SF9};
    use serde_json::json;

    fn scheduler(now: u32) -> (Arc<DownlinkScheduler>, Arc<Mutex<SimulatedConcentrator>>) {
        let ctx = Context::new(GlobalConf::default());
        let sim = Arc::new(Mutex::new(SimulatedConcentrator::with_manual_clock(now)));
        let hal: SharedConcentrator = sim.clone();
        (Arc::new(DownlinkScheduler::new(ctx, hal)), sim)
    }

    fn txpk(tmst: u32) -> Value {
        json!({
            "txpk": {
                "imme": false, "tmst": tmst, "freq": 869.525, "rfch": 0, "powe": 14,
                "modu": "LORA", "datr": "SF9BW125", "codr": "4/5", "ipol": true,
                "size": 12, "data": "YW55IGNhcm5hbCBw"
            }
        })
    }

    #[test]
    fn test_parse_lora_request() {
        let request = parse_txpk(&txpk(5_000_000)).unwrap();
        assert_eq!(request.timing, TxTiming::Timestamped(5_000_000));
        assert_eq!(request.frame.freq_hz, 869_525_000);
        assert_eq!(request.frame.datarate, DR_LORA_SF9);
        assert_eq!(request.frame.bandwidth, BW_125KHZ);
        assert_eq!(request.frame.preamble, STD_LORA_PREAMBLE);
        assert_eq!(request.frame.rf_power, 14);
        assert!(request.frame.invert_pol);
        assert_eq!(request.frame.payload, b"any carnal p");
    }

    #[test]
    fn test_parse_fsk_request() {
        let request = parse_txpk(&json!({
            "txpk": { "imme": true, "freq": 868.8, "rfch": 0, "modu": "FSK", "datr": 50000,
                      "fdev": 25000, "prea": 2, "size": 3, "data": "AQID" }
        }))
        .unwrap();
        assert_eq!(request.timing, TxTiming::Immediate);
        assert_eq!(request.frame.modulation, Modulation::FSK);
        assert_eq!(request.frame.datarate, 50000);
        assert_eq!(request.frame.f_dev, 25);
        assert_eq!(request.frame.preamble, MIN_FSK_PREAMBLE);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_txpk(&json!({})), Err(Error::Malformed(_))));

        let mut body = txpk(1);
        body["txpk"].as_object_mut().unwrap().remove("tmst");
        assert!(matches!(parse_txpk(&body), Err(Error::Malformed(_))));

        let mut body = txpk(1);
        body["txpk"]["datr"] = json!("SF6BW125");
        assert!(matches!(parse_txpk(&body), Err(Error::RejectedParameters(ParamFault::Modulation))));

        let mut body = txpk(1);
        body["txpk"]["datr"] = json!("SF9BW200");
        assert!(matches!(parse_txpk(&body), Err(Error::RejectedParameters(ParamFault::Modulation))));

        let mut body = txpk(1);
        body["txpk"]["modu"] = json!("GFSK");
        assert!(matches!(parse_txpk(&body), Err(Error::RejectedParameters(ParamFault::Modulation))));

        let mut body = txpk(1);
        body["txpk"]["data"] = json!("not base64!");
        assert!(matches!(parse_txpk(&body), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_invalid_parameters_answer_tx_ack() {
        let (scheduler, _) = scheduler(0);

        let mut body = txpk(1_000_000);
        body["txpk"]["freq"] = json!(915.0);
        let ack = scheduler.handle_pull_resp(0x0102, &body).unwrap();
        let msg = protocol::decode(&ack).unwrap();
        assert_eq!(msg.token(), 0x0102);
        match msg {
            Message::TxAck { body: Some(body), .. } => assert_eq!(body["txpk_ack"]["error"], "TX_FREQ"),
            other => panic!("unexpected {:?}", other),
        }

        let mut body = txpk(1_000_000);
        body["txpk"]["powe"] = json!(40);
        let ack = scheduler.handle_pull_resp(3, &body).unwrap();
        assert!(matches!(protocol::decode(&ack).unwrap(), Message::TxAck { body: Some(b), .. } if b["txpk_ack"]["error"] == "TX_POWER"));

        let mut body = txpk(1_000_000);
        body["txpk"]["rfch"] = json!(1);
        assert!(scheduler.handle_pull_resp(4, &body).is_some());

        assert_eq!(scheduler.queued(), 0);
        assert_eq!(scheduler.ctx.stats.get(Counter::TxRejectedParams), 3);
    }

    #[test]
    fn test_out_of_range_power_and_chain_answer_tx_ack() {
        let (scheduler, _) = scheduler(0);

        let mut body = txpk(1_000_000);
        body["txpk"]["powe"] = json!(128);
        assert!(matches!(parse_txpk(&body), Err(Error::RejectedParameters(ParamFault::Power))));
        let ack = scheduler.handle_pull_resp(5, &body).unwrap();
        assert!(matches!(protocol::decode(&ack).unwrap(), Message::TxAck { body: Some(b), .. } if b["txpk_ack"]["error"] == "TX_POWER"));

        let mut body = txpk(1_000_000);
        body["txpk"]["powe"] = json!(-200);
        assert!(matches!(parse_txpk(&body), Err(Error::RejectedParameters(ParamFault::Power))));

        let mut body = txpk(1_000_000);
        body["txpk"]["rfch"] = json!(256);
        let ack = scheduler.handle_pull_resp(6, &body).unwrap();
        assert!(matches!(protocol::decode(&ack).unwrap(), Message::TxAck { body: Some(b), .. } if b["txpk_ack"]["error"] == "TX_PARAMS"));

        assert_eq!(scheduler.ctx.stats.get(Counter::TxRequested), 2);
        assert_eq!(scheduler.ctx.stats.get(Counter::TxRejectedParams), 2);
        assert_eq!(scheduler.queued(), 0);
    }

    #[test]
    fn test_malformed_request_gets_no_reply() {
        let (scheduler, _) = scheduler(0);
        assert!(scheduler.handle_pull_resp(1, &json!({"txpk": {"imme": true}})).is_none());
        assert!(scheduler.handle_pull_resp(1, &json!({})).is_none());
        assert_eq!(scheduler.ctx.stats.get(Counter::TxRequested), 0);
    }

    #[test]
    fn test_gps_time_is_refused() {
        let (scheduler, _) = scheduler(0);
        let mut body = txpk(0);
        body["txpk"].as_object_mut().unwrap().remove("tmst");
        body["txpk"]["tmms"] = json!(1_234_567_890_123u64);
        assert!(matches!(scheduler.submit(1, &body), Err(Error::GpsUnlocked)));
    }

    #[test]
    fn test_overlapping_requests_collide() {
        let (scheduler, _) = scheduler(0);
        assert!(scheduler.submit(1, &txpk(1_000_000)).is_ok());
        /* SF9 12 bytes is ~144ms on air */
        assert!(matches!(scheduler.submit(2, &txpk(1_100_000)), Err(Error::RejectedCollision)));
        assert!(scheduler.submit(3, &txpk(2_000_000)).is_ok());
        assert_eq!(scheduler.queued(), 2);
    }

    #[test]
    fn test_late_and_early_requests() {
        let (scheduler, _) = scheduler(10_000_000);
        assert!(matches!(scheduler.submit(1, &txpk(10_001_000)), Err(Error::RejectedLate)));
        assert!(matches!(scheduler.submit(2, &txpk(9_000_000)), Err(Error::RejectedLate)));
        assert!(matches!(scheduler.submit(3, &txpk(10_000_000 + 600_000_000)), Err(Error::RejectedEarly)));
        assert!(scheduler.submit(4, &txpk(10_100_000)).is_ok());
    }

    #[test]
    fn test_large_advance_limit_does_not_wrap() {
        let conf = TxConf { tx_max_advance_us: 3_000_000_000, ..Default::default() };
        let mut schedule = TxSchedule::new(&conf);
        let frame = RadioFrame { payload: vec![0; 10], ..Default::default() };
        assert!(schedule.enqueue(0, ScheduledTx::new(1, 1_000_000, frame).unwrap()).is_ok());
    }

    #[test]
    fn test_queue_full_counts_as_collision() {
        let mut conf = GlobalConf::default();
        conf.tx_conf.jit_queue_size = 2;
        let ctx = Context::new(conf);
        let hal: SharedConcentrator = Arc::new(Mutex::new(SimulatedConcentrator::with_manual_clock(0)));
        let scheduler = DownlinkScheduler::new(ctx, hal);
        assert!(scheduler.submit(1, &txpk(1_000_000)).is_ok());
        assert!(scheduler.submit(2, &txpk(2_000_000)).is_ok());
        let e = scheduler.submit(3, &txpk(3_000_000)).unwrap_err();
        assert_eq!(e.tx_ack_code(), Some("COLLISION_PACKET"));
    }

    #[test]
    fn test_queue_is_time_ordered_and_single_armed() {
        let mut schedule = TxSchedule::new(&TxConf::default());
        let frame = RadioFrame { payload: vec![0; 10], ..Default::default() };
        for (token, target) in [(1u16, 3_000_000u32), (2, 1_000_000), (3, 2_000_000)] {
            schedule.enqueue(0, ScheduledTx::new(token, target, frame.clone()).unwrap()).unwrap();
        }

        /* nothing is due before the lead window */
        assert!(schedule.take_due(0).is_none());

        let first = schedule.take_due(1_000_000 - 10_000).unwrap();
        assert_eq!(first.token, 2);
        assert_eq!(first.deadline, 1_000_000 - 1498);
        assert!(schedule.is_armed());

        /* slot busy until the first frame is over */
        assert!(schedule.take_due(1_000_000).is_none());
        assert_eq!(schedule.len(), 2);
        let second = schedule.take_due(1_995_000).unwrap();
        assert_eq!(second.token, 3);
        schedule.disarm(3);
        assert!(!schedule.is_armed());
        assert_eq!(schedule.take_due(2_975_000).unwrap().token, 1);
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_armed_slot_blocks_next_hand_off() {
        let mut schedule = TxSchedule::new(&TxConf::default());
        let frame = RadioFrame { payload: vec![0; 10], ..Default::default() };
        let first = ScheduledTx::new(1, 100_000, frame.clone()).unwrap();
        let first_end = first.window(TX_MARGIN).end;
        schedule.enqueue(0, first).unwrap();
        schedule.enqueue(0, ScheduledTx::new(2, first_end + 10_000, frame).unwrap()).unwrap();

        assert_eq!(schedule.take_due(80_000).unwrap().token, 1);
        /* second is inside its lead window but the slot is still taken */
        assert!(schedule.take_due(first_end - 1).is_none());
        assert_eq!(schedule.take_due(first_end).unwrap().token, 2);
    }

    const TX_MARGIN: u32 = crate::fwd::conf::TX_MARGIN_DELAY;

    #[test]
    fn test_dispatch_hands_off_at_deadline() {
        let (scheduler, sim) = scheduler(0);
        scheduler.submit(7, &txpk(1_000_000)).unwrap();

        assert!(scheduler.dispatch_due().is_none());
        sim.lock().unwrap().set_time(1_000_000 - 20_000);
        let outcome = scheduler.dispatch_due().unwrap();
        assert_eq!(outcome.token, 7);
        assert!(outcome.result.is_ok());

        let sent = sim.lock().unwrap().transmissions().to_vec();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, 1_000_000 - 1498);
        assert_eq!(scheduler.ctx.stats.get(Counter::PullTrans), 1);
    }

    #[test]
    fn test_dispatch_reports_refusal() {
        let (scheduler, sim) = scheduler(0);
        scheduler.submit(9, &txpk(1_000_000)).unwrap();
        {
            let mut sim = sim.lock().unwrap();
            sim.set_refuse_tx(true);
            sim.set_time(990_000);
        }
        let outcome = scheduler.dispatch_due().unwrap();
        assert!(matches!(outcome.result, Err(Error::TxFailed)));
        assert!(!scheduler.is_armed());
        assert_eq!(scheduler.ctx.stats.get(Counter::TxFail), 1);
    }

    #[test]
    fn test_downstream_keepalive_and_acks() {
        let (scheduler, _) = scheduler(0);
        let ctx = scheduler.ctx.clone();
        let mut downstream = Downstream::new(ctx.clone(), scheduler);

        let pull = downstream.keepalive(Instant::now());
        assert_eq!(pull[3], protocol::PKT_PULL_DATA);
        assert!(downstream.awaiting_pull_ack());

        /* wrong token */
        let bad = [2, pull[1].wrapping_add(1), pull[2], protocol::PKT_PULL_ACK];
        assert!(downstream.handle_datagram(&bad).is_none());
        assert!(downstream.awaiting_pull_ack());

        let good = [2, pull[1], pull[2], protocol::PKT_PULL_ACK];
        assert!(downstream.handle_datagram(&good).is_none());
        assert!(!downstream.awaiting_pull_ack());
        assert_eq!(ctx.stats.get(Counter::PullAck), 1);

        let mut resp = vec![2, 0x34, 0x12, protocol::PKT_PULL_RESP];
        resp.extend_from_slice(txpk(2_000_000).to_string().as_bytes());
        assert!(downstream.handle_datagram(&resp).is_none());
        assert_eq!(ctx.stats.get(Counter::PullRcv), 1);

        let ack = downstream.tx_ack(&TxOutcome { token: 0x1234, result: Ok(()) });
        assert_eq!(
            protocol::decode(&ack).unwrap(),
            Message::TxAck { token: 0x1234, gateway_id: ctx.gateway_id, body: None }
        );
        let ack = downstream.tx_ack(&TxOutcome { token: 1, result: Err(Error::RejectedLate) });
        assert!(matches!(protocol::decode(&ack).unwrap(), Message::TxAck { body: Some(b), .. } if b["txpk_ack"]["error"] == "TOO_LATE"));
    }
}
