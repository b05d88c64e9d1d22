//! Upstream half of the forwarder: radio frames in, PUSH_DATA out.
//!
//! Every PUSH_DATA is kept in a table keyed by its token until the matching
//! PUSH_ACK arrives. Entries that stay unacknowledged for `push_timeout_ms`
//! are resent, up to `push_max_retries` times, then given up on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::hal::{annotate, RadioFrame, STAT_CRC_BAD, STAT_CRC_OK, STAT_NO_CRC};

use super::credentials::{dev_addr, CredentialStore};
use super::error::Error;
use super::json::{PushDataBody, Rxpk, Stat};
use super::protocol::{self, Message};
use super::stats::Counter;
use super::transport::{reconnect_with_backoff, Transport};
use super::Context;


pub const RECV_BUFF_SIZE:usize = 1024;


/// Work item for the upstream unit.
#[derive(Debug, Clone)]
pub enum Uplink {
    Frame(RadioFrame),
    Status(Stat),
}

#[derive(Debug, Clone)]
pub struct PendingAck {
    pub token: u16,
    pub sent_at: Instant,
    pub retry_count: u32,
    pub datagram: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    AwaitingAck,
}

pub struct UplinkDispatcher {
    ctx: Arc<Context>,
    pending: HashMap<u16, PendingAck>,
    credentials: Option<Arc<dyn CredentialStore>>,
}

impl UplinkDispatcher {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            pending: HashMap::new(),
            credentials: None,
        }
    }

    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn state(&self) -> DispatcherState {
        if self.pending.is_empty() {
            DispatcherState::Idle
        } else {
            DispatcherState::AwaitingAck
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingAck> {
        self.pending.values()
    }

    /// Turns a captured frame into a PUSH_DATA datagram and starts tracking
    /// its acknowledgement. None when the frame is not forwarded.
    pub fn prepare_frame(&mut self, frame: RadioFrame, now: Instant) -> Option<Vec<u8>> {
        let annotated = match annotate(frame) {
            Ok(annotated) => annotated,
            Err(e) => {
                warn!(e=?e, "WARNING: [up] frame dropped, cannot compute time on air");
                return None;
            }
        };
        let frame = annotated.frame();
        let conf = &self.ctx.conf.gateway_conf;
        let stats = &self.ctx.stats;

        stats.incr(Counter::PushRcv);
        let forward = match frame.status {
            STAT_CRC_OK => {
                stats.incr(Counter::PushRcvOk);
                conf.forward_crc_valid
            }
            STAT_CRC_BAD => {
                stats.incr(Counter::RxBad);
                conf.forward_crc_error
            }
            STAT_NO_CRC => {
                stats.incr(Counter::RxNoCrc);
                conf.forward_crc_disabled
            }
            status => {
                warn!("WARNING: [up] received packet with unknown status 0x{:02X}", status);
                false
            }
        };
        if !forward {
            trace!("INFO: [up] packet with status 0x{:02X} not forwarded", frame.status);
            return None;
        }

        if conf.known_devices_only {
            if let (Some(store), Some(addr)) = (&self.credentials, dev_addr(&frame.payload)) {
                if store.lookup_session_keys(addr).is_none() {
                    debug!("INFO: [up] dropping frame from unknown DevAddr {:08X}", addr);
                    return None;
                }
            }
        }

        let rxpk = match Rxpk::from_frame(frame) {
            Some(rxpk) => rxpk,
            None => {
                warn!("WARNING: [up] cannot describe frame in JSON: {}", frame);
                return None;
            }
        };
        debug!(airtime_us = annotated.airtime_us(), tmst = rxpk.tmst, "INFO: [up] forwarding {} bytes", rxpk.size);

        let body = match serde_json::to_value(PushDataBody { rxpk: vec![rxpk], stat: None }) {
            Ok(body) => body,
            Err(e) => {
                warn!(e=?e, "WARNING: [up] failed to serialize rxpk");
                return None;
            }
        };
        stats.incr(Counter::PushFwd);
        stats.add(Counter::PushPayloadBytes, frame.size() as u64);

        Some(self.register(body, now))
    }

    pub fn prepare_status(&mut self, stat: Stat, now: Instant) -> Option<Vec<u8>> {
        match serde_json::to_value(PushDataBody { rxpk: Vec::new(), stat: Some(stat) }) {
            Ok(body) => Some(self.register(body, now)),
            Err(e) => {
                warn!(e=?e, "WARNING: [up] failed to serialize stat");
                None
            }
        }
    }

    fn register(&mut self, body: serde_json::Value, now: Instant) -> Vec<u8> {
        let token = self.fresh_token();
        let datagram = protocol::encode(&Message::PushData {
            token,
            gateway_id: self.ctx.gateway_id,
            body,
        });
        self.pending.insert(
            token,
            PendingAck {
                token,
                sent_at: now,
                retry_count: 0,
                datagram: datagram.clone(),
            },
        );
        datagram
    }

    fn fresh_token(&self) -> u16 {
        let mut rng = rand::rng();
        loop {
            let token: u16 = rng.random();
            if !self.pending.contains_key(&token) {
                return token;
            }
        }
    }

    /// Processes a datagram received on the push socket. Returns true when
    /// it acknowledged an in-flight request.
    pub fn handle_datagram(&mut self, buff: &[u8]) -> bool {
        match protocol::decode(buff) {
            Ok(Message::PushAck { token }) => match self.pending.remove(&token) {
                Some(pending) => {
                    self.ctx.stats.incr(Counter::PushAck);
                    debug!(token, retries = pending.retry_count, "INFO: [up] PUSH_ACK received in {:?}", pending.sent_at.elapsed());
                    true
                }
                None => {
                    debug!(token, "INFO: [up] ignoring PUSH_ACK with unknown token");
                    false
                }
            },
            Ok(other) => {
                debug!("INFO: [up] ignoring message of type {} on push socket", other.kind());
                false
            }
            Err(e) => {
                warn!(e=?e, "WARNING: [up] ignoring invalid datagram ({} bytes)", buff.len());
                false
            }
        }
    }

    /// Datagrams to resend at `now`. Requests out of retries are dropped.
    pub fn due_retries(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let timeout = Duration::from_millis(self.ctx.conf.gateway_conf.push_timeout_ms);
        let max_retries = self.ctx.conf.gateway_conf.push_max_retries;
        let mut resend = Vec::new();

        self.pending.retain(|token, pending| {
            if now.saturating_duration_since(pending.sent_at) < timeout {
                return true;
            }
            if pending.retry_count >= max_retries {
                let e = Error::DeliveryTimeout { token: *token, attempts: pending.retry_count + 1 };
                warn!("WARNING: [up] {}, frame dropped", e);
                return false;
            }
            pending.retry_count += 1;
            pending.sent_at = now;
            resend.push(pending.datagram.clone());
            true
        });
        resend
    }

    async fn send(&self, transport: &dyn Transport, datagram: &[u8], cancel: &CancellationToken) -> bool {
        match transport.send(datagram).await {
            Ok(()) => {
                self.ctx.stats.incr(Counter::PushDgramSent);
                true
            }
            Err(e) => {
                warn!(e=?e, "WARNING: [up] send failed");
                reconnect_with_backoff(transport, &self.ctx.conf.gateway_conf, cancel).await
            }
        }
    }

    pub async fn run(mut self, transport: Arc<dyn Transport>, mut rx: mpsc::Receiver<Uplink>) {
        let cancel = self.ctx.cancel.clone();
        let recv_timeout = Duration::from_millis(self.ctx.conf.gateway_conf.push_timeout_ms.max(1));
        let period = Duration::from_millis((self.ctx.conf.gateway_conf.push_timeout_ms / 2).max(1));
        let mut retry_tick = tokio::time::interval(period);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buff = vec![0u8; RECV_BUFF_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => {
                    let datagram = match item {
                        Some(Uplink::Frame(frame)) => self.prepare_frame(frame, Instant::now()),
                        Some(Uplink::Status(stat)) => self.prepare_status(stat, Instant::now()),
                        None => break,
                    };
                    if let Some(datagram) = datagram {
                        self.send(transport.as_ref(), &datagram, &cancel).await;
                    }
                }
                res = tokio::time::timeout(recv_timeout, transport.recv(&mut buff)) => match res {
                    Err(_) => {}
                    Ok(Ok(n)) => {
                        self.handle_datagram(&buff[..n]);
                    }
                    Ok(Err(e)) => {
                        warn!(e=?e, "WARNING: [up] receive failed");
                        reconnect_with_backoff(transport.as_ref(), &self.ctx.conf.gateway_conf, &cancel).await;
                    }
                },
                _ = retry_tick.tick() => {
                    for datagram in self.due_retries(Instant::now()) {
                        if !self.send(transport.as_ref(), &datagram, &cancel).await {
                            break;
                        }
                    }
                }
            }
        }
        info!("INFO: End of upstream thread");
    }
}
