use std::path::Path;

use anyhow::{anyhow, Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::GatewayId;


pub const DEFAULT_SERVER:&str =          "127.0.0.1";
pub const DEFAULT_PORT_UP:u16 =          1780;
pub const DEFAULT_PORT_DW:u16 =          1782;
pub const DEFAULT_KEEPALIVE:u64 =        5;       /* default time interval for downstream keep-alive packet */
pub const DEFAULT_STAT:u64 =             30;      /* default time interval for statistics */
pub const PUSH_TIMEOUT_MS:u64 =          100;
pub const PULL_TIMEOUT_MS:u64 =          200;
pub const FETCH_SLEEP_MS:u64 =           10;      /* nb of ms waited when a fetch return no packets */

pub const JIT_QUEUE_MAX:usize =          32;      /* Maximum number of packets to be stored in JiT queue */
pub const TX_JIT_DELAY:u32 =             30000;   /* Pre-delay to program packet for TX in microseconds */
pub const TX_MARGIN_DELAY:u32 =          1000;    /* Packet overlap margin in microseconds */
pub const TX_MAX_ADVANCE_DELAY:u32 =     512_000_000; /* Maximum advance delay accepted for a TX packet, compared to current time */
pub const TX_DELAY_LIMIT:u32 =           i32::MAX as u32; /* half the counter range, the furthest ts_diff can see */


/// Top level of `global_conf.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConf {
    #[serde(default)]
    pub gateway_conf: GatewayConf,
    #[serde(default)]
    pub tx_conf: TxConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConf {
    #[serde(rename = "gateway_ID", with = "eui_serde")]
    pub gateway_id: GatewayId,
    pub server_address: String,
    pub serv_port_up: u16,
    pub serv_port_down: u16,
    pub keepalive_interval: u64,     //* seconds between PULL_DATA keepalives */
    pub stat_interval: u64,          //* seconds between status reports */
    pub push_timeout_ms: u64,        //* time to wait for a PUSH_ACK before resending */
    pub push_max_retries: u32,
    pub pull_timeout_ms: u64,
    pub fetch_sleep_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub forward_crc_valid: bool,
    pub forward_crc_error: bool,
    pub forward_crc_disabled: bool,
    pub known_devices_only: bool,    //* drop data frames from devices the credential store does not know */
}

impl Default for GatewayConf {
    fn default() -> Self {
        Self {
            gateway_id: GatewayId::default(),
            server_address: DEFAULT_SERVER.to_string(),
            serv_port_up: DEFAULT_PORT_UP,
            serv_port_down: DEFAULT_PORT_DW,
            keepalive_interval: DEFAULT_KEEPALIVE,
            stat_interval: DEFAULT_STAT,
            push_timeout_ms: PUSH_TIMEOUT_MS,
            push_max_retries: 2,
            pull_timeout_ms: PULL_TIMEOUT_MS,
            fetch_sleep_ms: FETCH_SLEEP_MS,
            reconnect_backoff_ms: 500,
            reconnect_backoff_max_ms: 30_000,
            forward_crc_valid: true,
            forward_crc_error: false,
            forward_crc_disabled: false,
            known_devices_only: false,
        }
    }
}

impl GatewayConf {
    pub fn push_target(&self) -> String {
        format!("{}:{}", self.server_address, self.serv_port_up)
    }

    pub fn pull_target(&self) -> String {
        format!("{}:{}", self.server_address, self.serv_port_down)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConf {
    pub jit_queue_size: usize,
    pub tx_jit_lead_us: u32,        //* hand a frame to the radio this long before its deadline */
    pub tx_margin_us: u32,          //* guard time around every transmit window */
    pub tx_max_advance_us: u32,
    pub chains: Vec<TxChainConf>,   //* one entry per RF chain */
}

impl Default for TxConf {
    fn default() -> Self {
        Self {
            jit_queue_size: JIT_QUEUE_MAX,
            tx_jit_lead_us: TX_JIT_DELAY,
            tx_margin_us: TX_MARGIN_DELAY,
            tx_max_advance_us: TX_MAX_ADVANCE_DELAY,
            chains: vec![TxChainConf::default()],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TxChainConf {
    pub tx_enable: bool,
    pub tx_freq_min: u32,
    pub tx_freq_max: u32,
    pub tx_power_min: i8,
    pub tx_power_max: i8,
}

impl Default for TxChainConf {
    fn default() -> Self {
        Self {
            tx_enable: true,
            tx_freq_min: 863_000_000,
            tx_freq_max: 870_000_000,
            tx_power_min: 0,
            tx_power_max: 27,
        }
    }
}

impl GlobalConf {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        let conf: GlobalConf = text.parse()?;
        info!("INFO: {} parsed, gateway MAC address is {}", path.display(), conf.gateway_conf.gateway_id);
        Ok(conf)
    }

    fn validate(&self) -> Result<()> {
        if self.tx_conf.chains.is_empty() {
            return Err(anyhow!("tx_conf.chains must describe at least one RF chain"));
        }
        if self.tx_conf.jit_queue_size == 0 {
            return Err(anyhow!("tx_conf.jit_queue_size must be at least 1"));
        }
        for (name, value) in [
            ("tx_jit_lead_us", self.tx_conf.tx_jit_lead_us),
            ("tx_margin_us", self.tx_conf.tx_margin_us),
            ("tx_max_advance_us", self.tx_conf.tx_max_advance_us),
        ] {
            if value > TX_DELAY_LIMIT {
                return Err(anyhow!("tx_conf.{} must be below 2^31 us (got {})", name, value));
            }
        }
        for (i, chain) in self.tx_conf.chains.iter().enumerate() {
            if chain.tx_freq_min > chain.tx_freq_max {
                return Err(anyhow!("tx_conf.chains[{}]: tx_freq_min above tx_freq_max", i));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for GlobalConf {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let conf: GlobalConf = serde_json::from_str(s).context("invalid JSON configuration")?;
        conf.validate()?;
        Ok(conf)
    }
}


mod eui_serde {
    use std::fmt;

    use serde::de;
    use serde::{Deserializer, Serializer};

    use crate::fwd::GatewayId;

    pub fn serialize<S>(value: &GatewayId, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<GatewayId, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EuiVisitor;

        impl<'de> de::Visitor<'de> for EuiVisitor {
            type Value = GatewayId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a 16 hex digit gateway EUI")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                GatewayId::from_hex(value)
                    .ok_or_else(|| de::Error::custom(format!("Invalid gateway EUI: {}", value)))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(GatewayId(value.to_be_bytes()))
            }
        }

        deserializer.deserialize_any(EuiVisitor)
    }
}
