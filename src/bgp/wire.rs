//! Minimal BGP-4 wire framing: the 19-byte header (16-byte marker + 2-byte
//! length + 1-byte type) and just enough of OPEN/UPDATE/NOTIFICATION to let
//! the pipeline carry and re-marshal messages. Full attribute-level UPDATE
//! semantics are out of scope; see `bgp::mod`.

use anyhow::{anyhow, bail, Result};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const HEADER_LEN: usize = 19;
pub const MARKER_LEN: usize = 16;
pub const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Open,
    Update,
    Notification,
    Keepalive,
    #[serde(other)]
    Invalid,
}

impl MessageType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => MessageType::Open,
            2 => MessageType::Update,
            3 => MessageType::Notification,
            4 => MessageType::Keepalive,
            _ => MessageType::Invalid,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            MessageType::Open => 1,
            MessageType::Update => 2,
            MessageType::Notification => 3,
            MessageType::Keepalive => 4,
            MessageType::Invalid => 0,
        }
    }
}

/// The structured body populated when a message is decoded from JSON, or
/// synthesised by a producer stage (e.g. `speaker`). Raw bytes remain the
/// authoritative form for anything already carrying a wire-valid `raw`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgpBody {
    pub open: Option<OpenBody>,
    pub update: Option<serde_json::Value>,
    pub notification: Option<NotificationBody>,
}

impl BgpBody {
    pub fn empty() -> Self {
        Self {
            open: None,
            update: None,
            notification: None,
        }
    }

    pub fn from_update_value(v: serde_json::Value) -> Self {
        Self {
            open: None,
            update: Some(v),
            notification: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenBody {
    pub version: u8,
    pub asn: u32,
    pub hold_time: u16,
    pub router_id: u32,
    pub four_byte_asn: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationBody {
    pub code: u8,
    pub subcode: u8,
    pub data: Bytes,
}

/// Parse exactly one wire-framed BGP message from the front of `buf`.
/// Returns the message and the number of bytes consumed. `UnexpectedEof`
/// is signalled by returning `Ok(None)` — callers await more bytes.
pub fn decode_one(buf: &[u8]) -> Result<Option<(MessageType, Bytes, usize)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buf[MARKER_LEN], buf[MARKER_LEN + 1]]) as usize;
    if len < HEADER_LEN || len > MAX_MESSAGE_LEN {
        bail!("invalid BGP message length {len}");
    }
    if buf.len() < len {
        return Ok(None);
    }
    let typ = MessageType::from_code(buf[MARKER_LEN + 2]);
    let raw = Bytes::copy_from_slice(&buf[..len]);
    Ok(Some((typ, raw, len)))
}

/// Re-marshal a message into wire bytes. If `raw` is already authoritative
/// it is returned verbatim; otherwise a minimal frame is synthesised from
/// `body` (sufficient for KEEPALIVE and the handful of body kinds this
/// crate models).
pub fn encode(typ: MessageType, raw: Option<&Bytes>, body: Option<&BgpBody>) -> Result<Bytes> {
    if let Some(raw) = raw {
        return Ok(raw.clone());
    }
    let mut payload = BytesMut::new();
    match typ {
        MessageType::Keepalive => {}
        MessageType::Open => {
            let open = body
                .and_then(|b| b.open.as_ref())
                .ok_or_else(|| anyhow!("OPEN body missing"))?;
            payload.extend_from_slice(&[open.version]);
            payload.extend_from_slice(&(open.asn as u16).to_be_bytes());
            payload.extend_from_slice(&open.hold_time.to_be_bytes());
            payload.extend_from_slice(&open.router_id.to_be_bytes());
            payload.extend_from_slice(&[0u8]); // opt param len, capabilities omitted
        }
        MessageType::Notification => {
            let n = body
                .and_then(|b| b.notification.as_ref())
                .ok_or_else(|| anyhow!("NOTIFICATION body missing"))?;
            payload.extend_from_slice(&[n.code, n.subcode]);
            payload.extend_from_slice(&n.data);
        }
        MessageType::Update | MessageType::Invalid => {
            // Minimal UPDATE encoding: withdrawn/nlri lengths of zero, no
            // path attributes. Sufficient for KEEPALIVE-equivalent framing
            // of a body this crate doesn't otherwise interpret.
            payload.extend_from_slice(&[0u8, 0u8, 0u8, 0u8]);
        }
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[0xffu8; MARKER_LEN]);
    let total_len = (HEADER_LEN + payload.len()) as u16;
    out.extend_from_slice(&total_len.to_be_bytes());
    out.extend_from_slice(&[typ.code()]);
    out.extend_from_slice(&payload);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_round_trips() {
        let raw = encode(MessageType::Keepalive, None, None).unwrap();
        assert_eq!(raw.len(), HEADER_LEN);
        let (typ, decoded, consumed) = decode_one(&raw).unwrap().unwrap();
        assert_eq!(typ, MessageType::Keepalive);
        assert_eq!(consumed, HEADER_LEN);
        assert_eq!(decoded, raw);
    }

    #[test]
    fn decode_one_awaits_more_bytes() {
        let raw = encode(MessageType::Keepalive, None, None).unwrap();
        assert!(decode_one(&raw[..HEADER_LEN - 1]).unwrap().is_none());
    }

    #[test]
    fn open_round_trips() {
        let body = BgpBody {
            open: Some(OpenBody {
                version: 4,
                asn: 65000,
                hold_time: 90,
                router_id: 0x0a000001,
                four_byte_asn: false,
            }),
            update: None,
            notification: None,
        };
        let raw = encode(MessageType::Open, None, Some(&body)).unwrap();
        let (typ, _, consumed) = decode_one(&raw).unwrap().unwrap();
        assert_eq!(typ, MessageType::Open);
        assert_eq!(consumed, raw.len());
    }
}
