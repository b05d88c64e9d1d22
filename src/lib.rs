//! LoRa gateway packet forwarder speaking the Semtech UDP protocol.

pub mod fwd;
pub mod hal;
