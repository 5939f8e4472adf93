//! Minimal MRT/BGP4MP record framing, enough to stream a `.mrt` file's BGP
//! messages into the pipeline. Only the BGP4MP and BGP4MP_ET record
//! subtypes are understood; everything else is skipped silently.

use anyhow::{bail, Result};
use bytes::Bytes;
use std::io::Read;

use super::wire::{MessageType, HEADER_LEN};

const MRT_HEADER_LEN: usize = 12;
const TYPE_BGP4MP: u16 = 16;
const TYPE_BGP4MP_ET: u16 = 17;
const SUBTYPE_MESSAGE: u16 = 1;
const SUBTYPE_MESSAGE_AS4: u16 = 4;

/// A single decoded BGP4MP record: the embedded BGP message plus how many
/// bytes of the input buffer the whole MRT record consumed.
pub struct MrtRecord {
    pub typ: MessageType,
    pub raw: Bytes,
    pub consumed: usize,
}

/// Consume one MRT record from the front of `buf`. Returns `Ok(None)` when
/// more bytes are needed ("await more"). A non-BGP4MP record is skipped and
/// represented as a `None` body (`typ == Invalid`) with `consumed` set so
/// the caller advances past it without emitting anything downstream.
pub fn decode_one(buf: &[u8]) -> Result<Option<MrtRecord>> {
    if buf.len() < MRT_HEADER_LEN {
        return Ok(None);
    }
    let rec_type = u16::from_be_bytes([buf[4], buf[5]]);
    let subtype = u16::from_be_bytes([buf[6], buf[7]]);
    let length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    let total = MRT_HEADER_LEN + length;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = &buf[MRT_HEADER_LEN..total];

    if rec_type != TYPE_BGP4MP && rec_type != TYPE_BGP4MP_ET {
        return Ok(Some(MrtRecord {
            typ: MessageType::Invalid,
            raw: Bytes::new(),
            consumed: total,
        }));
    }
    if subtype != SUBTYPE_MESSAGE && subtype != SUBTYPE_MESSAGE_AS4 {
        return Ok(Some(MrtRecord {
            typ: MessageType::Invalid,
            raw: Bytes::new(),
            consumed: total,
        }));
    }

    // BGP4MP_MESSAGE[_AS4]: peer AS, local AS, ifindex, AFI, peer addr,
    // local addr, then the embedded BGP message. AS width and address
    // width vary; we only need to find where the embedded message starts.
    let as_width = if subtype == SUBTYPE_MESSAGE_AS4 { 4 } else { 2 };
    let mut off = 2 * as_width + 2; // peer AS + local AS + interface index
    if payload.len() < off + 2 {
        bail!("truncated BGP4MP record");
    }
    let afi = u16::from_be_bytes([payload[off], payload[off + 1]]);
    off += 2;
    let addr_width = match afi {
        1 => 4,  // IPv4
        2 => 16, // IPv6
        _ => bail!("unsupported BGP4MP AFI {afi}"),
    };
    off += addr_width * 2; // peer addr + local addr

    if payload.len() < off + HEADER_LEN {
        bail!("truncated BGP4MP record: no room for embedded message");
    }
    let embedded = &payload[off..];
    let msg_len = u16::from_be_bytes([embedded[16], embedded[17]]) as usize;
    if embedded.len() < msg_len {
        bail!("truncated embedded BGP message in MRT record");
    }
    let typ = MessageType::from_code(embedded[18]);
    let raw = Bytes::copy_from_slice(&embedded[..msg_len]);

    Ok(Some(MrtRecord {
        typ,
        raw,
        consumed: total,
    }))
}

/// Sniff a gzip magic number and transparently decompress if present.
/// bzip2-compressed MRT dumps are recognised by magic but not decompressed
/// — see DESIGN.md for why only gzip is wired up.
pub fn maybe_decompress(bytes: Vec<u8>) -> Result<Vec<u8>> {
    if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        let mut decoder = flate2::read::GzDecoder::new(&bytes[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        return Ok(out);
    }
    if bytes.len() >= 3 && &bytes[0..3] == b"BZh" {
        bail!("bzip2-compressed MRT files are not supported in this build");
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_bgp4mp_record(msg: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&65001u16.to_be_bytes()); // peer AS
        payload.extend_from_slice(&65002u16.to_be_bytes()); // local AS
        payload.extend_from_slice(&0u16.to_be_bytes()); // ifindex
        payload.extend_from_slice(&1u16.to_be_bytes()); // AFI = IPv4
        payload.extend_from_slice(&[192, 0, 2, 1]); // peer addr
        payload.extend_from_slice(&[192, 0, 2, 2]); // local addr
        payload.extend_from_slice(msg);

        let mut rec = Vec::new();
        rec.extend_from_slice(&0u32.to_be_bytes()); // timestamp
        rec.extend_from_slice(&TYPE_BGP4MP.to_be_bytes());
        rec.extend_from_slice(&SUBTYPE_MESSAGE.to_be_bytes());
        rec.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        rec.extend_from_slice(&payload);
        rec
    }

    #[test]
    fn decodes_embedded_keepalive() {
        let keepalive = crate::bgp::wire::encode(MessageType::Keepalive, None, None).unwrap();
        let rec = build_bgp4mp_record(&keepalive);
        let decoded = decode_one(&rec).unwrap().unwrap();
        assert_eq!(decoded.typ, MessageType::Keepalive);
        assert_eq!(decoded.consumed, rec.len());
    }

    #[test]
    fn skips_non_bgp4mp_record_type() {
        let mut rec = Vec::new();
        rec.extend_from_slice(&0u32.to_be_bytes());
        rec.extend_from_slice(&99u16.to_be_bytes()); // unknown type
        rec.extend_from_slice(&0u16.to_be_bytes());
        rec.extend_from_slice(&4u32.to_be_bytes());
        rec.extend_from_slice(&[1, 2, 3, 4]);
        let decoded = decode_one(&rec).unwrap().unwrap();
        assert_eq!(decoded.typ, MessageType::Invalid);
        assert_eq!(decoded.consumed, rec.len());
    }

    #[test]
    fn awaits_more_bytes_on_partial_record() {
        let keepalive = crate::bgp::wire::encode(MessageType::Keepalive, None, None).unwrap();
        let rec = build_bgp4mp_record(&keepalive);
        assert!(decode_one(&rec[..rec.len() - 1]).unwrap().is_none());
    }
}
