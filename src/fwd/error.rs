/// Transmit parameter that failed validation against the TX chain limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamFault {
    Freq,
    Power,
    Modulation,
    RfChain,
    Size,
}

impl ParamFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamFault::Freq => "TX_FREQ",
            ParamFault::Power => "TX_POWER",
            ParamFault::Modulation | ParamFault::RfChain | ParamFault::Size => "TX_PARAMS",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed datagram: {0}")]
    Malformed(&'static str),

    #[error("rejected parameters: {}", .0.as_str())]
    RejectedParameters(ParamFault),

    #[error("rejected: collides with a scheduled transmission")]
    RejectedCollision,

    #[error("rejected: too late to transmit")]
    RejectedLate,

    #[error("rejected: too early to schedule")]
    RejectedEarly,

    #[error("rejected: no GPS time reference")]
    GpsUnlocked,

    #[error("radio refused the frame")]
    TxFailed,

    #[error("no PUSH_ACK for token {token:#06x} after {attempts} attempts")]
    DeliveryTimeout { token: u16, attempts: u32 },

    #[error("socket failure: {0}")]
    SocketFailure(#[from] std::io::Error),
}

impl Error {
    /// Value of the `txpk_ack.error` field reported for a downlink outcome.
    pub fn tx_ack_code(&self) -> Option<&'static str> {
        match self {
            Error::RejectedParameters(fault) => Some(fault.as_str()),
            Error::RejectedCollision => Some("COLLISION_PACKET"),
            Error::RejectedLate => Some("TOO_LATE"),
            Error::RejectedEarly => Some("TOO_EARLY"),
            Error::GpsUnlocked => Some("GPS_UNLOCKED"),
            Error::TxFailed => Some("TX_FAILED"),
            _ => None,
        }
    }
}
