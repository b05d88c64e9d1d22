//! JSON objects exchanged inside PUSH_DATA, PULL_RESP and TX_ACK bodies.

use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hal::{
    bw_from_hz, bw_getval, Modulation, RadioFrame, CR_LORA_4_5, CR_LORA_4_6, CR_LORA_4_7, CR_LORA_4_8, STAT_CRC_BAD,
    STAT_CRC_OK, STAT_NO_CRC,
};


/// `datr` is a string for LoRa ("SF7BW125") and a bit rate for FSK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datr {
    Lora(String),
    Fsk(u32),
}

impl Datr {
    pub fn lora(sf: u32, bw: u8) -> Option<Self> {
        let bw_khz = bw_getval(bw)? / 1000;
        Some(Datr::Lora(format!("SF{}BW{}", sf, bw_khz)))
    }

    /// Splits "SF9BW125" into spreading factor and bandwidth code.
    /// Returns None when the string does not follow that shape.
    pub fn parse_lora(s: &str) -> Option<(u32, u32)> {
        let rest = s.strip_prefix("SF")?;
        let (sf, bw) = rest.split_once("BW")?;
        let sf: u32 = sf.parse().ok()?;
        let bw_khz: u32 = bw.parse().ok()?;
        Some((sf, bw_khz))
    }
}

/// Maps a bandwidth in kHz as written in `datr` to its HAL code.
pub fn bw_from_khz(bw_khz: u32) -> Option<u8> {
    match bw_khz {
        500 => bw_from_hz(500000),
        250 => bw_from_hz(250000),
        125 => bw_from_hz(125000),
        62 | 63 => bw_from_hz(62500),
        31 => bw_from_hz(31200),
        15 | 16 => bw_from_hz(15600),
        7 | 8 => bw_from_hz(7800),
        _ => None,
    }
}

pub fn codr_to_str(cr: u8) -> Option<&'static str> {
    match cr {
        CR_LORA_4_5 => Some("4/5"),
        CR_LORA_4_6 => Some("4/6"),
        CR_LORA_4_7 => Some("4/7"),
        CR_LORA_4_8 => Some("4/8"),
        _ => None,
    }
}

pub fn codr_from_str(s: &str) -> Option<u8> {
    match s {
        "4/5" => Some(CR_LORA_4_5),
        "4/6" | "2/3" => Some(CR_LORA_4_6),
        "4/7" => Some(CR_LORA_4_7),
        "4/8" | "1/2" => Some(CR_LORA_4_8),
        _ => None,
    }
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rxpk {
    pub tmst: u32,
    pub chan: u8,
    pub rfch: u8,
    pub freq: f64,          //* MHz */
    pub stat: i8,
    pub modu: String,
    pub datr: Datr,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub codr: Option<String>,
    pub rssi: i32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lsnr: Option<f32>,
    pub size: u16,
    pub data: String,
}

impl Rxpk {
    /// Builds the `rxpk` object for a received frame. None when the frame's
    /// radio settings cannot be described.
    pub fn from_frame(frame: &RadioFrame) -> Option<Self> {
        let stat = match frame.status {
            STAT_CRC_OK => 1,
            STAT_CRC_BAD => -1,
            STAT_NO_CRC => 0,
            _ => return None,
        };
        let (datr, codr, lsnr) = match frame.modulation {
            Modulation::LORA => (
                Datr::lora(frame.datarate, frame.bandwidth)?,
                Some(codr_to_str(frame.coderate).unwrap_or("OFF").to_string()),
                frame.snr.map(|snr| (snr * 10.0).round() / 10.0),
            ),
            Modulation::FSK => (Datr::Fsk(frame.datarate), None, None),
        };

        Some(Rxpk {
            tmst: frame.count_us,
            chan: frame.if_chain,
            rfch: frame.rf_chain,
            freq: frame.freq_hz as f64 / 1e6,
            stat,
            modu: frame.modulation.to_string(),
            datr,
            codr,
            rssi: frame.rssi.map_or(0, |rssi| rssi.round() as i32),
            lsnr,
            size: frame.payload.len() as u16,
            data: BASE64_STANDARD.encode(&frame.payload),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub time: String,
    pub rxnb: u64,
    pub rxok: u64,
    pub rxfw: u64,
    pub ackr: f64,
    pub dwnb: u64,
    pub txnb: u64,
}

pub fn stat_time(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d %H:%M:%S GMT").to_string()
}

/// Body of a PUSH_DATA datagram.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushDataBody {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub rxpk: Vec<Rxpk>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stat: Option<Stat>,
}


#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Txpk {
    #[serde(default)]
    pub imme: bool,
    pub tmst: Option<u32>,
    pub tmms: Option<u64>,
    pub freq: Option<f64>,
    pub rfch: Option<i64>,
    pub powe: Option<i64>,
    pub modu: Option<String>,
    pub datr: Option<Datr>,
    pub codr: Option<String>,
    pub fdev: Option<u32>,
    #[serde(default)]
    pub ipol: bool,
    pub prea: Option<u16>,
    pub size: Option<u16>,
    pub data: Option<String>,
    #[serde(default)]
    pub ncrc: bool,
}

/// Body of a PULL_RESP datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRespBody {
    pub txpk: Txpk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxpkAck {
    pub error: String,
}

/// Body of a TX_ACK datagram carrying an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxAckBody {
    pub txpk_ack: TxpkAck,
}
