//! Concentrator stand-in used when no radio board is attached.
//!
//! The counter either follows the host clock or only moves when told to,
//! which lets tests put the scheduler at an exact microsecond.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, trace};

use super::{Concentrator, RadioFrame};


pub const TX_LOG_MAX:usize =  64;     /* transmissions kept, oldest dropped first */

#[derive(Debug, Clone, Copy)]
enum Clock {
    FreeRunning { start: Instant, offset: u32 },
    Manual(u32),
}

#[derive(Debug)]
pub struct SimulatedConcentrator {
    clock: Clock,
    rx_queue: VecDeque<RadioFrame>,
    sent: VecDeque<(RadioFrame, u32)>,
    refuse_tx: bool,
}

impl Default for SimulatedConcentrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedConcentrator {
    pub fn new() -> Self {
        Self {
            clock: Clock::FreeRunning { start: Instant::now(), offset: rand::random() },
            rx_queue: VecDeque::new(),
            sent: VecDeque::with_capacity(TX_LOG_MAX),
            refuse_tx: false,
        }
    }

    pub fn with_manual_clock(count_us: u32) -> Self {
        Self { clock: Clock::Manual(count_us), ..Self::new() }
    }

    pub fn set_time(&mut self, count_us: u32) {
        self.clock = Clock::Manual(count_us);
    }

    pub fn advance(&mut self, us: u32) {
        let now = self.current_timestamp();
        self.clock = Clock::Manual(now.wrapping_add(us));
    }

    /// Queues a frame for the next capture. `count_us` is stamped with the
    /// current counter value.
    pub fn inject(&mut self, mut frame: RadioFrame) {
        frame.count_us = self.current_timestamp();
        self.rx_queue.push_back(frame);
    }

    /// Last `TX_LOG_MAX` frames handed over for emission, with their
    /// trigger counter value.
    pub fn transmissions(&self) -> Vec<(RadioFrame, u32)> {
        self.sent.iter().cloned().collect()
    }

    pub fn drain_transmissions(&mut self) -> Vec<(RadioFrame, u32)> {
        self.sent.drain(..).collect()
    }

    pub fn set_refuse_tx(&mut self, refuse: bool) {
        self.refuse_tx = refuse;
    }
}

impl Concentrator for SimulatedConcentrator {
    fn capture_frame(&mut self) -> Option<RadioFrame> {
        let frame = self.rx_queue.pop_front()?;
        trace!("[sim] frame captured: {}", frame);
        Some(frame)
    }

    fn transmit(&mut self, frame: &RadioFrame, at: u32) -> bool {
        if self.refuse_tx {
            debug!("[sim] TX refused");
            return false;
        }
        debug!("[sim] TX loaded for count_us {}: {}", at, frame);
        if self.sent.len() >= TX_LOG_MAX {
            self.sent.pop_front();
        }
        self.sent.push_back((frame.clone(), at));
        true
    }

    fn current_timestamp(&self) -> u32 {
        match self.clock {
            Clock::FreeRunning { start, offset } => offset.wrapping_add(start.elapsed().as_micros() as u32),
            Clock::Manual(count_us) => count_us,
        }
    }
}
