//! Semtech UDP gateway protocol framing.
//!
//! Every datagram starts with `[version][token_lo][token_hi][type]`. Uplink
//! requests from the gateway carry its 8-byte EUI right after the header,
//! and PUSH_DATA / PULL_RESP / TX_ACK may end with a JSON object.

use serde_json::{Map, Value};
use tracing::warn;

use super::error::Error;
use super::GatewayId;


pub const PROTOCOL_VERSION:u8 =  2;

pub const PKT_PUSH_DATA:u8 =     0;
pub const PKT_PUSH_ACK:u8 =      1;
pub const PKT_PULL_DATA:u8 =     2;
pub const PKT_PULL_RESP:u8 =     3;
pub const PKT_PULL_ACK:u8 =      4;
pub const PKT_TX_ACK:u8 =        5;

pub const HEADER_LEN:usize =     4;
pub const EUI_LEN:usize =        8;


#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    PushData { token: u16, gateway_id: GatewayId, body: Value },
    PushAck { token: u16 },
    PullData { token: u16, gateway_id: GatewayId },
    PullResp { token: u16, body: Value },
    PullAck { token: u16 },
    TxAck { token: u16, gateway_id: GatewayId, body: Option<Value> },
}

impl Message {
    pub fn token(&self) -> u16 {
        match *self {
            Message::PushData { token, .. }
            | Message::PushAck { token }
            | Message::PullData { token, .. }
            | Message::PullResp { token, .. }
            | Message::PullAck { token }
            | Message::TxAck { token, .. } => token,
        }
    }

    pub fn kind(&self) -> u8 {
        match self {
            Message::PushData { .. } => PKT_PUSH_DATA,
            Message::PushAck { .. } => PKT_PUSH_ACK,
            Message::PullData { .. } => PKT_PULL_DATA,
            Message::PullResp { .. } => PKT_PULL_RESP,
            Message::PullAck { .. } => PKT_PULL_ACK,
            Message::TxAck { .. } => PKT_TX_ACK,
        }
    }
}

pub fn encode(msg: &Message) -> Vec<u8> {
    let mut buff = Vec::with_capacity(HEADER_LEN + EUI_LEN);
    buff.push(PROTOCOL_VERSION);
    buff.extend_from_slice(&msg.token().to_le_bytes());
    buff.push(msg.kind());

    match msg {
        Message::PushData { gateway_id, body, .. } => {
            buff.extend_from_slice(&gateway_id.0);
            buff.extend_from_slice(body.to_string().as_bytes());
        }
        Message::PullData { gateway_id, .. } => {
            buff.extend_from_slice(&gateway_id.0);
        }
        Message::PullResp { body, .. } => {
            buff.extend_from_slice(body.to_string().as_bytes());
        }
        Message::TxAck { gateway_id, body, .. } => {
            buff.extend_from_slice(&gateway_id.0);
            if let Some(body) = body {
                buff.extend_from_slice(body.to_string().as_bytes());
            }
        }
        Message::PushAck { .. } | Message::PullAck { .. } => {}
    }

    buff
}

pub fn decode(buff: &[u8]) -> Result<Message, Error> {
    if buff.len() < HEADER_LEN {
        return Err(Error::Malformed("datagram shorter than header"));
    }
    if buff[0] != PROTOCOL_VERSION {
        return Err(Error::Malformed("unsupported protocol version"));
    }
    let token = u16::from_le_bytes([buff[1], buff[2]]);
    let rest = &buff[HEADER_LEN..];

    let msg = match buff[3] {
        PKT_PUSH_DATA => {
            let (gateway_id, body) = split_eui(rest)?;
            Message::PushData { token, gateway_id, body: parse_body(body) }
        }
        PKT_PUSH_ACK => Message::PushAck { token },
        PKT_PULL_DATA => {
            let (gateway_id, _) = split_eui(rest)?;
            Message::PullData { token, gateway_id }
        }
        PKT_PULL_RESP => Message::PullResp { token, body: parse_body(rest) },
        PKT_PULL_ACK => Message::PullAck { token },
        PKT_TX_ACK => {
            let (gateway_id, body) = split_eui(rest)?;
            let body = if trim_nul(body).is_empty() { None } else { Some(parse_body(body)) };
            Message::TxAck { token, gateway_id, body }
        }
        _ => return Err(Error::Malformed("unknown message type")),
    };
    Ok(msg)
}

fn split_eui(rest: &[u8]) -> Result<(GatewayId, &[u8]), Error> {
    if rest.len() < EUI_LEN {
        return Err(Error::Malformed("datagram too short for gateway EUI"));
    }
    let mut eui = [0u8; EUI_LEN];
    eui.copy_from_slice(&rest[..EUI_LEN]);
    Ok((GatewayId(eui), &rest[EUI_LEN..]))
}

fn trim_nul(body: &[u8]) -> &[u8] {
    let end = body.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &body[..end]
}

/* the JSON part is parsed loosely, a broken body never rejects the datagram */
fn parse_body(body: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(trim_nul(body)) {
        Ok(value) => value,
        Err(e) => {
            warn!(e=?e, "WARNING: invalid JSON body ({} bytes), using empty object", body.len());
            Value::Object(Map::new())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GW: GatewayId = GatewayId([0xAA, 0x55, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x01]);

    fn all_messages() -> Vec<Message> {
        vec![
            Message::PushData { token: 0x1234, gateway_id: GW, body: json!({"rxpk":[{"tmst":1,"data":"AQID"}]}) },
            Message::PushAck { token: 0x1234 },
            Message::PullData { token: 0xBEEF, gateway_id: GW },
            Message::PullResp { token: 0, body: json!({"txpk":{"imme":true,"freq":869.525}}) },
            Message::PullAck { token: 0xBEEF },
            Message::TxAck { token: 7, gateway_id: GW, body: None },
            Message::TxAck { token: 8, gateway_id: GW, body: Some(json!({"txpk_ack":{"error":"TOO_LATE"}})) },
        ]
    }

    #[test]
    fn test_round_trip() {
        for msg in all_messages() {
            assert_eq!(decode(&encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn test_header_layout() {
        let buff = encode(&Message::PullData { token: 0xBEEF, gateway_id: GW });
        assert_eq!(buff.len(), 12);
        assert_eq!(&buff[..4], &[PROTOCOL_VERSION, 0xEF, 0xBE, PKT_PULL_DATA]);
        assert_eq!(&buff[4..], &GW.0);

        let buff = encode(&Message::PushAck { token: 0x0102 });
        assert_eq!(buff, vec![2, 0x02, 0x01, PKT_PUSH_ACK]);
    }

    #[test]
    fn test_rejects_short_input() {
        for len in 0..HEADER_LEN {
            let buff = vec![PROTOCOL_VERSION; len];
            assert!(matches!(decode(&buff), Err(Error::Malformed(_))), "len={}", len);
        }
    }

    #[test]
    fn test_rejects_other_versions() {
        for version in 0..=255u8 {
            if version == PROTOCOL_VERSION {
                continue;
            }
            let buff = [version, 0, 0, PKT_PUSH_ACK];
            assert!(matches!(decode(&buff), Err(Error::Malformed(_))), "version={}", version);
        }
    }

    #[test]
    fn test_rejects_unknown_type_and_missing_eui() {
        assert!(matches!(decode(&[2, 0, 0, 6]), Err(Error::Malformed(_))));
        assert!(matches!(decode(&[2, 0, 0, PKT_PULL_DATA, 1, 2, 3]), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_loose_json() {
        let mut buff = vec![2, 1, 0, PKT_PULL_RESP];
        buff.extend_from_slice(b"{\"txpk\": {broken");
        assert_eq!(decode(&buff).unwrap(), Message::PullResp { token: 1, body: json!({}) });

        /* NUL terminated body, as some servers send it */
        let mut buff = vec![2, 1, 0, PKT_PULL_RESP];
        buff.extend_from_slice(b"{\"txpk\":{}}\0");
        assert_eq!(decode(&buff).unwrap(), Message::PullResp { token: 1, body: json!({"txpk":{}}) });
    }
}
