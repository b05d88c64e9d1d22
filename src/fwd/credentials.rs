use std::collections::HashMap;
use std::sync::RwLock;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    pub app_s_key: [u8; 16],
    pub nwk_s_key: [u8; 16],
}

/// Lookup of the session keys of activated devices.
pub trait CredentialStore: Send + Sync {
    fn lookup_session_keys(&self, dev_addr: u32) -> Option<SessionKeys>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    sessions: RwLock<HashMap<u32, SessionKeys>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dev_addr: u32, keys: SessionKeys) {
        self.sessions.write().unwrap().insert(dev_addr, keys);
    }

    pub fn remove(&self, dev_addr: u32) -> Option<SessionKeys> {
        self.sessions.write().unwrap().remove(&dev_addr)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn lookup_session_keys(&self, dev_addr: u32) -> Option<SessionKeys> {
        self.sessions.read().unwrap().get(&dev_addr).copied()
    }
}

/// DevAddr of a LoRaWAN data frame, None for join and proprietary frames.
pub fn dev_addr(payload: &[u8]) -> Option<u32> {
    if payload.len() < 5 {
        return None;
    }
    /* MType 010..101: unconfirmed/confirmed data up/down */
    match payload[0] >> 5 {
        0b010..=0b101 => Some(u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]])),
        _ => None,
    }
}
