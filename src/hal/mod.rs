pub mod error;
pub mod time_on_air;
pub mod sim;

use error::Error;
use tracing::error;

pub use time_on_air::{annotate, time_on_air, tx_start_delay, AnnotatedFrame};


pub const LGW_RF_CHAIN_NB:u8 =     2;       /* number of RF chains */
pub const LGW_IF_CHAIN_NB:u8 =     10;      /* number of IF+modem RX chains */
pub const LGW_PAYLOAD_MAX:usize =  255;     /* largest payload a single frame can carry */


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Modulation{
    LORA        =    0x10,
    FSK         =    0x20,
}

impl std::fmt::Display for Modulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modulation::LORA => write!(f, "LORA"),
            Modulation::FSK => write!(f, "FSK"),
        }
    }
}


/* values available for the 'bandwidth' parameters (LoRa & FSK) */
/* NOTE: directly encode FSK RX bandwidth, do not change */
pub const    BW_UNDEFINED:u8=   0;
pub const    BW_500KHZ:u8=      0x01;
pub const    BW_250KHZ:u8=      0x02;
pub const    BW_125KHZ:u8=      0x03;
pub const    BW_62K5HZ:u8=      0x04;
pub const    BW_31K2HZ:u8=      0x05;
pub const    BW_15K6HZ:u8=      0x06;
pub const    BW_7K8HZ:u8=       0x07;

/* values available for the 'datarate' parameters */
pub const    DR_UNDEFINED:u32=    0;
pub const    DR_LORA_SF7:u32=     7;
pub const    DR_LORA_SF8:u32=     8;
pub const    DR_LORA_SF9:u32=     9;
pub const    DR_LORA_SF10:u32=    10;
pub const    DR_LORA_SF11:u32=    11;
pub const    DR_LORA_SF12:u32=    12;
pub const    DR_FSK_MIN:u32=      500;
pub const    DR_FSK_MAX:u32=      250000;

/* values available for the 'coderate' parameters (LoRa only) */
pub const CR_UNDEFINED:u8=     0;   /* CR0 exists but is not recommended, so consider it as invalid */
pub const CR_LORA_4_5 :u8=     0x01;
pub const CR_LORA_4_6 :u8=     0x02;
pub const CR_LORA_4_7 :u8=     0x03;
pub const CR_LORA_4_8 :u8=     0x04;

/* values available for the 'status' parameter */
pub const STAT_UNDEFINED:u8 =  0x00;
pub const STAT_NO_CRC:u8 =     0x01;
pub const STAT_CRC_BAD:u8 =    0x11;
pub const STAT_CRC_OK:u8 =     0x10;

/* preamble lengths */
pub const STD_LORA_PREAMBLE:u16 =  8;
pub const MIN_LORA_PREAMBLE:u16 =  6;
pub const STD_FSK_PREAMBLE:u16 =   5;
pub const MIN_FSK_PREAMBLE:u16 =   3;


/// A frame as it crosses the concentrator boundary, in either direction.
///
/// `datarate` holds the spreading factor for LoRa and the bit rate for FSK.
/// RSSI and SNR are only filled in on the receive side.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioFrame {
    pub freq_hz: u32,        /* central frequency of the IF chain */
    pub if_chain: u8,       /* by which IF chain was packet received */
    pub rf_chain: u8,       /* through which RF chain the packet was received / will be sent */
    pub status: u8,         /* CRC status of the received packet */
    pub count_us: u32,       /* internal concentrator counter for timestamping, 1 microsecond resolution */
    pub modulation: Modulation,
    pub bandwidth: u8,
    pub datarate: u32,
    pub coderate: u8,       /* error-correcting code of the packet (LoRa only) */
    pub preamble: u16,       /* preamble length, symbols for LoRa, bytes for FSK */
    pub no_crc: bool,
    pub no_header: bool,      /* implicit header mode (LoRa), fixed length (FSK) */
    pub rssi: Option<f32>,
    pub snr: Option<f32>,
    pub rf_power: i8,       /* TX power, in dBm */
    pub invert_pol: bool,     /* invert signal polarity, for orthogonal downlinks (LoRa only) */
    pub f_dev: u8,          /* frequency deviation, in kHz (FSK only) */
    pub payload: Vec<u8>,
}

impl Default for RadioFrame {
    fn default() -> Self {
        Self {
            freq_hz: 0,
            if_chain: 0,
            rf_chain: 0,
            status: STAT_UNDEFINED,
            count_us: 0,
            modulation: Modulation::LORA,
            bandwidth: BW_125KHZ,
            datarate: DR_LORA_SF7,
            coderate: CR_LORA_4_5,
            preamble: STD_LORA_PREAMBLE,
            no_crc: false,
            no_header: false,
            rssi: None,
            snr: None,
            rf_power: 0,
            invert_pol: false,
            f_dev: 0,
            payload: Vec::new(),
        }
    }
}

impl std::fmt::Display for RadioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RadioFrame {{ freq_hz: {}, rf_chain: {}, count_us: {}, modulation: {}, bandwidth: {}, datarate: {}, coderate: {}, size: {}, payload: {:02X?} }}",
            self.freq_hz,
            self.rf_chain,
            self.count_us,
            self.modulation,
            bw_getval(self.bandwidth).unwrap_or(0),
            self.datarate,
            self.coderate,
            self.payload.len(),
            &self.payload
        )
    }
}

impl RadioFrame {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Checks the payload length against what a single frame can carry.
    pub fn check_size(&self) -> Result<(), Error> {
        if self.payload.len() > LGW_PAYLOAD_MAX {
            error!("ERROR: payload too large ({} bytes)", self.payload.len());
            return Err(Error::UnsupportedParameter { param: "size", value: self.payload.len() as u32 });
        }
        Ok(())
    }
}


/// Radio front-end as seen by the forwarder.
///
/// Timestamps are taken from the free-running microsecond counter of the
/// concentrator and wrap at 2^32.
pub trait Concentrator: Send {
    /// Non-blocking poll for the next received frame.
    fn capture_frame(&mut self) -> Option<RadioFrame>;
    /// Loads `frame` for emission at counter value `at`. Returns false if the
    /// radio refused it.
    fn transmit(&mut self, frame: &RadioFrame, at: u32) -> bool;
    fn current_timestamp(&self) -> u32;
}


pub fn bw_getval(bw: u8) -> Option<u32> {
    match bw {
        BW_500KHZ => Some(500000),
        BW_250KHZ => Some(250000),
        BW_125KHZ => Some(125000),
        BW_62K5HZ => Some(62500),
        BW_31K2HZ => Some(31200),
        BW_15K6HZ => Some(15600),
        BW_7K8HZ => Some(7800),
        _ => None,
    }
}

pub fn bw_from_hz(hz: u32) -> Option<u8> {
    match hz {
        500000 => Some(BW_500KHZ),
        250000 => Some(BW_250KHZ),
        125000 => Some(BW_125KHZ),
        62500 => Some(BW_62K5HZ),
        31200 => Some(BW_31K2HZ),
        15600 => Some(BW_15K6HZ),
        7800 => Some(BW_7K8HZ),
        _ => None,
    }
}

pub fn is_lora_bw(bw: u8) -> bool {
    bw_getval(bw).is_some()
}

pub fn is_lora_dr(dr: u32) -> bool {
    matches!(
        dr,
        DR_LORA_SF7 | DR_LORA_SF8 | DR_LORA_SF9 | DR_LORA_SF10 | DR_LORA_SF11 | DR_LORA_SF12
    )
}

pub fn is_lora_cr(cr: u8) -> bool {
    cr == CR_LORA_4_5 || cr == CR_LORA_4_6 || cr == CR_LORA_4_7 || cr == CR_LORA_4_8
}

pub fn is_fsk_dr(dr: u32) -> bool {
    dr >= DR_FSK_MIN && dr <= DR_FSK_MAX
}

/// Signed distance from `b` to `a` on the wrapping microsecond counter.
pub fn ts_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}
