//! Wire formats Extio understands on ingress/egress.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};

use crate::bgp::wire::MessageType;
use crate::core::message::{Message, MsgDirection, Side};

/// Serialises a message as the envelope form `[seq, ts, dir, type, …body]`
/// bgpipe writes on stage output.
pub fn encode_envelope(msg: &Message) -> Result<String> {
    let dir = match msg.direction {
        MsgDirection::Side(Side::L) => "L",
        MsgDirection::Side(Side::R) => "R",
        MsgDirection::Both => "both",
        MsgDirection::None => "none",
    };
    let ts = msg
        .time
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let type_name = serde_json::to_value(msg.typ)?;
    let body = msg
        .body
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?
        .unwrap_or(Value::Null);
    let envelope = json!([msg.seq, ts, dir, type_name, body]);
    Ok(serde_json::to_string(&envelope)?)
}

/// Parses the envelope form back into a `Message`. The sequence/timestamp
/// carried in the envelope are informational only — `Direction::write`
/// re-stamps them unless the caller has already set `msg.seq`/`msg.time`.
pub fn decode_envelope(line: &str) -> Result<Message> {
    let v: Value = serde_json::from_str(line).context("invalid JSON envelope")?;
    let arr = v.as_array().ok_or_else(|| anyhow!("envelope is not a JSON array"))?;
    if arr.len() < 4 {
        return Err(anyhow!("envelope needs at least [seq, ts, dir, type]"));
    }
    let typ: MessageType = serde_json::from_value(arr[3].clone()).unwrap_or(MessageType::Invalid);
    let typ = if typ == MessageType::Invalid {
        MessageType::Keepalive
    } else {
        typ
    };
    let mut msg = Message::new(typ);
    if let Some(dir) = arr[2].as_str() {
        msg.direction = match dir {
            "L" => MsgDirection::Side(Side::L),
            "R" => MsgDirection::Side(Side::R),
            "both" => MsgDirection::Both,
            _ => MsgDirection::None,
        };
    }
    if arr.len() > 4 {
        if let Ok(body) = serde_json::from_value(arr[4].clone()) {
            msg.body = Some(body);
        }
    }
    Ok(msg)
}

/// Parses a bare `{…}` line as a standalone UPDATE body.
pub fn decode_update_body(line: &str) -> Result<Message> {
    let v: Value = serde_json::from_str(line).context("invalid JSON UPDATE body")?;
    let mut msg = Message::new(MessageType::Update);
    msg.body = Some(crate::bgp::wire::BgpBody::from_update_value(v));
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_type_and_direction() {
        let mut msg = Message::new(MessageType::Update);
        msg.direction = MsgDirection::Side(Side::L);
        let line = encode_envelope(&msg).unwrap();
        let decoded = decode_envelope(&line).unwrap();
        assert_eq!(decoded.typ, MessageType::Update);
        assert_eq!(decoded.direction, MsgDirection::Side(Side::L));
    }

    #[test]
    fn invalid_envelope_type_coerces_to_keepalive() {
        let line = r#"[1, 0.0, "L", "BOGUS", null]"#;
        let decoded = decode_envelope(line).unwrap();
        assert_eq!(decoded.typ, MessageType::Keepalive);
    }

    #[test]
    fn bare_object_decodes_as_update() {
        let msg = decode_update_body(r#"{"nlri": ["198.51.100.0/24"]}"#).unwrap();
        assert_eq!(msg.typ, MessageType::Update);
        assert!(msg.body.unwrap().update.is_some());
    }
}
