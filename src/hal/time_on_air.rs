use super::error::Error;
use super::{bw_getval, is_fsk_dr, is_lora_cr, is_lora_dr, Modulation, RadioFrame, BW_125KHZ};
use tracing::{error, trace};


pub const TX_START_DELAY_DEFAULT:u16 =  1500;    /* Calibrated value for 500KHz BW */
pub const FSK_SYNC_WORD_SIZE:u32 =      3;       /* default FSK sync word, in bytes */


/// Breakdown of a LoRa time-on-air computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeOnAir {
    pub toa_us: u32,
    pub nb_symbols: f64,
    pub nb_symbols_payload: u32,
    pub t_symbol_us: f64,
}

/// LoRa time on air, in microseconds.
///
/// The final value is truncated, never rounded.
pub fn lora_packet_time_on_air(
    bw: u8,
    sf: u32,
    cr: u8,
    n_symbol_preamble: u16,
    no_header: bool,
    size: usize,
) -> Result<TimeOnAir, Error> {
    /* Check input parameters */
    if !is_lora_dr(sf) {
        error!("ERROR: wrong datarate");
        return Err(Error::UnsupportedParameter { param: "datarate", value: sf });
    }
    if !is_lora_cr(cr) {
        error!("ERROR: wrong coding rate");
        return Err(Error::UnsupportedParameter { param: "coderate", value: cr as u32 });
    }
    let bw_hz = match bw_getval(bw) {
        Some(hz) => hz,
        None => {
            error!("ERROR: unsupported bandwidth 0x{:02X}", bw);
            return Err(Error::UnsupportedParameter { param: "bandwidth", value: bw as u32 });
        }
    };
    if size > super::LGW_PAYLOAD_MAX {
        error!("ERROR: payload too large ({} bytes)", size);
        return Err(Error::UnsupportedParameter { param: "size", value: size as u32 });
    }

    /* Duration of 1 symbol */
    let t_symbol_us = libm::pow(2.0, sf as f64) * 1E6 / bw_hz as f64; /* 2^SF / BW , in microseconds */

    /* Duration of preamble */
    let t_preamble_us = (n_symbol_preamble as f64 + 4.25) * t_symbol_us;

    /* Packet parameters */
    let h: i32 = if no_header { 1 } else { 0 }; /* header is always enabled, except for beacons */
    let de: i32 = if sf >= 11 { 1 } else { 0 }; /* Low datarate optimization enabled for SF11 and SF12 */

    /* Number of symbols in the payload, ceil before the coding rate multiply */
    let num = (8 * size as i32 - 4 * sf as i32 + 28 + 16 - 20 * h) as f64;
    let den = (4 * (sf as i32 - 2 * de)) as f64;
    let n_symbol_payload = 8 + (libm::ceil(num / den).max(0.0) * (cr as f64 + 4.0)) as u32;

    let t_payload_us = n_symbol_payload as f64 * t_symbol_us;

    /* Duration of packet in microseconds, truncated */
    let toa_us = (t_preamble_us + t_payload_us) as u32;

    let n_symbol = n_symbol_preamble as f64 + 4.25 + n_symbol_payload as f64;
    trace!("INFO: LoRa packet ToA: {} us (n_symbol:{}, t_symbol_us:{})", toa_us, n_symbol, t_symbol_us);

    Ok(TimeOnAir {
        toa_us,
        nb_symbols: n_symbol,
        nb_symbols_payload: n_symbol_payload,
        t_symbol_us,
    })
}

/* PREAMBLE + SYNC_WORD + PKT_LEN + PKT_PAYLOAD + CRC
        PREAMBLE: default 5 bytes
        SYNC_WORD: default 3 bytes
        PKT_LEN: 1 byte (variable length mode)
        PKT_PAYLOAD: x bytes
        CRC: 0 or 2 bytes
*/
pub fn fsk_packet_time_on_air(
    datarate: u32,
    preamble: u16,
    no_crc: bool,
    size: usize,
    sync_word_size: u32,
) -> Result<u32, Error> {
    if datarate == 0 || !is_fsk_dr(datarate) {
        error!("ERROR: wrong FSK datarate {}", datarate);
        return Err(Error::UnsupportedParameter { param: "datarate", value: datarate });
    }
    if size > super::LGW_PAYLOAD_MAX {
        error!("ERROR: payload too large ({} bytes)", size);
        return Err(Error::UnsupportedParameter { param: "size", value: size as u32 });
    }

    let n_bytes = preamble as u32 + sync_word_size + 1 + size as u32 + if no_crc { 0 } else { 2 };
    let t_fsk_us = 8.0 * n_bytes as f64 / datarate as f64 * 1E6;

    let toa_us = t_fsk_us as u32 + 1; /* add margin for rounding */
    trace!("INFO: FSK packet ToA: {} us", toa_us);
    Ok(toa_us)
}

/// Time on air of `frame` in microseconds.
pub fn time_on_air(frame: &RadioFrame) -> Result<u32, Error> {
    match frame.modulation {
        Modulation::LORA => lora_packet_time_on_air(
            frame.bandwidth,
            frame.datarate,
            frame.coderate,
            frame.preamble,
            frame.no_header,
            frame.size(),
        )
        .map(|toa| toa.toa_us),
        Modulation::FSK => fsk_packet_time_on_air(
            frame.datarate,
            frame.preamble,
            frame.no_crc,
            frame.size(),
            FSK_SYNC_WORD_SIZE,
        ),
    }
}

/// Delay between the TX trigger and the first RF symbol, in microseconds.
pub fn tx_start_delay(bw: u8) -> u16 {
    /* Calibrated delay brought by the concentrator depending on signal bandwidth */
    let bw_delay_us: f32 = match bw {
        BW_125KHZ => 1.5,
        _ => 0.0, /* 500KHz is the calibrated reference */
    };

    let tx_start_delay = TX_START_DELAY_DEFAULT as f32 - bw_delay_us;
    trace!("INFO: tx_start_delay={} ({}) - ({}, bw_delay={})", tx_start_delay as u16, tx_start_delay, TX_START_DELAY_DEFAULT, bw_delay_us);

    tx_start_delay as u16 /* keep truncating instead of rounding */
}


/// A frame together with its computed time on air. Read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedFrame {
    frame: RadioFrame,
    airtime_us: u32,
}

impl AnnotatedFrame {
    pub fn frame(&self) -> &RadioFrame {
        &self.frame
    }

    pub fn airtime_us(&self) -> u32 {
        self.airtime_us
    }

    pub fn into_frame(self) -> RadioFrame {
        self.frame
    }
}

pub fn annotate(frame: RadioFrame) -> Result<AnnotatedFrame, Error> {
    let airtime_us = time_on_air(&frame)?;
    Ok(AnnotatedFrame { frame, airtime_us })
}
