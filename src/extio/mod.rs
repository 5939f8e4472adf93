//! External I/O Adapter: bridges a byte-oriented external endpoint (TCP
//! socket, subprocess pipe, stdin/stdout, MRT file) to the pipeline. One
//! reusable adapter shared by every byte-shuttling stage, instead of each
//! stage hand-rolling its own ingress/egress framing.

pub mod framing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};

use crate::bgp::wire::MessageType;
use crate::config::extraction::{extract_bool_flag, extract_flag_opt};
use crate::config::{StageConfig, StageParams};
use crate::core::callback::CallbackHandle;
use crate::core::direction::InputHandle;
use crate::core::message::{Action, Message, MsgDirection, Side};
use crate::core::pipeline::Pipeline;
use crate::core::pool::BufferPool;

/// Recognised Extio options.
#[derive(Debug, Clone, Default)]
pub struct ExtioConfig {
    pub raw: bool,
    pub mrt: bool,
    pub read: bool,
    pub write: bool,
    pub copy: bool,
    pub seq: bool,
    pub time: bool,
    pub types: Vec<MessageType>,
    pub pardon: bool,
}

impl StageParams for ExtioConfig {
    fn from_stage_config(config: &StageConfig) -> Result<Self> {
        let raw = extract_bool_flag(config, "raw");
        let mrt = extract_bool_flag(config, "mrt");
        let mut read = extract_bool_flag(config, "read");
        let mut write = extract_bool_flag(config, "write");
        let mut copy = extract_bool_flag(config, "copy");
        if read || write {
            copy = true;
        }
        if read && write {
            bail!("'read' and 'write' are mutually exclusive");
        }
        if !read && !write {
            // neither given: full duplex, both implied false (attach both sides)
            read = false;
            write = false;
        }
        let types = extract_flag_opt::<String>(config, "type")
            .map(|s| {
                s.split(',')
                    .filter_map(|t| serde_json::from_value(serde_json::Value::String(t.to_uppercase())).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            raw,
            mrt,
            read,
            write,
            copy,
            seq: extract_bool_flag(config, "seq"),
            time: extract_bool_flag(config, "time"),
            types,
            pardon: extract_bool_flag(config, "pardon"),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.raw && self.mrt {
            bail!("'raw' and 'mrt' framing are mutually exclusive");
        }
        Ok(())
    }
}

/// Egress-side state, shared (via `Arc`) with the pipeline callback closure
/// so `Extio` itself doesn't need to be `'static`/cloneable.
struct Egress {
    copy: bool,
    raw: bool,
    types: Vec<MessageType>,
    out_tx: flume::Sender<Bytes>,
    closed: AtomicBool,
    /// The attaching stage's own index. A message whose
    /// `ctx.source_stage` equals this is one this same Extio just
    /// ingressed — skip it so a stage doesn't echo back what it just
    /// decoded from its own peer.
    stage_index: std::sync::atomic::AtomicUsize,
}

pub struct Extio {
    config: ExtioConfig,
    side: Side,
    is_last: bool,
    l_input: Option<InputHandle>,
    r_input: Option<InputHandle>,
    default_input: Option<InputHandle>,
    egress: Arc<Egress>,
    out_rx: Option<flume::Receiver<Bytes>>,
    callback_handle: Option<CallbackHandle>,
    line_buf: BytesMut,
    pool: Arc<BufferPool>,
    stage_index: usize,
}

const OUTPUT_CHANNEL_CAPACITY: usize = 100;

impl Extio {
    pub fn new(config: ExtioConfig, side: Side) -> Self {
        let (out_tx, out_rx) = flume::bounded(OUTPUT_CHANNEL_CAPACITY);
        Self {
            egress: Arc::new(Egress {
                copy: config.copy,
                raw: config.raw || config.mrt,
                types: config.types.clone(),
                out_tx,
                closed: AtomicBool::new(false),
                stage_index: std::sync::atomic::AtomicUsize::new(usize::MAX),
            }),
            config,
            side,
            is_last: false,
            l_input: None,
            r_input: None,
            default_input: None,
            out_rx: Some(out_rx),
            callback_handle: None,
            line_buf: BytesMut::new(),
            pool: Arc::new(BufferPool::new(4096)),
            stage_index: usize::MAX,
        }
    }

    /// Registers pipeline inputs and, unless `read`-only, an egress
    /// callback.
    pub fn attach(&mut self, pipeline: &Arc<Pipeline>, is_left: bool, is_right: bool, is_last: bool, stage_index: usize) {
        self.is_last = is_last;
        self.stage_index = stage_index;
        self.egress.stage_index.store(stage_index, Ordering::Release);
        if !self.config.write {
            match (is_left, is_right) {
                (true, false) => self.l_input = Some(pipeline.add_input(Side::L)),
                (false, true) => self.r_input = Some(pipeline.add_input(Side::R)),
                (true, true) => {
                    self.l_input = Some(pipeline.add_input(Side::L));
                    self.r_input = Some(pipeline.add_input(Side::R));
                    self.default_input = Some(if is_last {
                        pipeline.add_input(Side::L)
                    } else {
                        pipeline.add_input(Side::R)
                    });
                }
                (false, false) => {}
            }
        }

        if !self.config.read {
            let egress = self.egress.clone();
            let dir = if is_left && !is_right {
                MsgDirection::Side(Side::L)
            } else if is_right && !is_left {
                MsgDirection::Side(Side::R)
            } else {
                MsgDirection::Both
            };
            let handle = pipeline.on_msg(
                Arc::new(move |msg: &mut Message| egress_callback(&egress, msg)),
                dir,
                self.config.types.clone(),
                stage_index,
                None,
            );
            self.callback_handle = Some(handle);
        }
    }

    pub fn take_output_receiver(&mut self) -> Option<flume::Receiver<Bytes>> {
        self.out_rx.take()
    }

    /// Parses and routes exactly one ingress unit.
    pub async fn read_single(&self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() || buf[0] == b'#' {
            return Ok(());
        }
        let parsed = if self.config.raw {
            match crate::bgp::wire::decode_one(buf)? {
                Some((typ, raw, consumed)) if consumed == buf.len() => Some(Message::from_raw(typ, raw)),
                Some(_) => bail!("trailing bytes after raw BGP message"),
                None => bail!("incomplete raw BGP message"),
            }
        } else if self.config.mrt {
            match crate::bgp::mrt::decode_one(buf)? {
                Some(rec) if rec.consumed == buf.len() => {
                    if rec.typ == MessageType::Invalid {
                        None
                    } else {
                        Some(Message::from_raw(rec.typ, rec.raw))
                    }
                }
                Some(_) => bail!("trailing bytes after MRT record"),
                None => bail!("incomplete MRT record"),
            }
        } else if buf[0] == b'[' {
            let text = std::str::from_utf8(buf)?;
            let mut m = framing::decode_envelope(text)?;
            Some({
                if m.typ == MessageType::Invalid {
                    m.typ = MessageType::Keepalive;
                }
                m
            })
        } else if buf[0] == b'{' {
            let text = std::str::from_utf8(buf)?;
            Some(framing::decode_update_body(text)?)
        } else {
            bail!("unrecognised ingress format");
        };

        let Some(mut msg) = parsed else { return Ok(()) };

        if !self.config.types.is_empty() && !self.config.types.contains(&msg.typ) {
            return Ok(());
        }
        if self.config.seq {
            msg.seq = 0;
        }
        if self.config.time {
            msg.time = std::time::UNIX_EPOCH;
        }
        msg.action = Action::Continue;
        msg.ctx.source_stage = self.stage_index;

        match msg.direction {
            MsgDirection::Side(Side::L) if self.l_input.is_some() => {
                self.l_input.as_ref().unwrap().write(msg).await?
            }
            MsgDirection::Side(Side::R) if self.r_input.is_some() => {
                self.r_input.as_ref().unwrap().write(msg).await?
            }
            _ => {
                let input = self
                    .default_input
                    .as_ref()
                    .or(self.l_input.as_ref())
                    .or(self.r_input.as_ref());
                match input {
                    Some(input) => input.write(msg).await?,
                    None => bail!("no input attached to route message to"),
                }
            }
        }
        Ok(())
    }

    /// Streams JSON lines out of `data`, dispatching each complete line
    /// through [`Self::read_single`].
    pub async fn read_json_buf(&mut self, data: &[u8]) -> Result<()> {
        self.line_buf.extend_from_slice(data);
        loop {
            let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line = self.line_buf.split_to(pos + 1);
            let line = &line[..line.len() - 1];
            let line = if line.last() == Some(&b'\r') { &line[..line.len() - 1] } else { line };
            let result = self.read_single(line).await;
            if let Err(e) = result {
                if self.config.pardon {
                    tracing::debug!(error = %e, "ignoring pardoned ingress parse error");
                } else {
                    tracing::warn!(error = %e, "ingress parse error");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Decodes as many complete raw/MRT frames as `data` contains,
    /// returning once it needs more bytes than remain.
    pub async fn read_framed_buf(&self, data: &mut BytesMut) -> Result<()> {
        loop {
            let consumed = if self.config.mrt {
                match crate::bgp::mrt::decode_one(data)? {
                    Some(rec) => {
                        if rec.typ != MessageType::Invalid {
                            self.route_framed(Message::from_raw(rec.typ, rec.raw)).await?;
                        }
                        rec.consumed
                    }
                    None => break,
                }
            } else {
                match crate::bgp::wire::decode_one(data)? {
                    Some((typ, raw, consumed)) => {
                        self.route_framed(Message::from_raw(typ, raw)).await?;
                        consumed
                    }
                    None => break,
                }
            };
            let _ = data.split_to(consumed);
        }
        Ok(())
    }

    async fn route_framed(&self, mut msg: Message) -> Result<()> {
        if !self.config.types.is_empty() && !self.config.types.contains(&msg.typ) {
            return Ok(());
        }
        msg.action = Action::Continue;
        msg.ctx.source_stage = self.stage_index;
        let input = self
            .l_input
            .as_ref()
            .filter(|_| self.r_input.is_none())
            .or(self.r_input.as_ref().filter(|_| self.l_input.is_none()))
            .or(if self.is_last { self.l_input.as_ref() } else { self.r_input.as_ref() })
            .or(self.l_input.as_ref())
            .or(self.r_input.as_ref());
        match input {
            Some(input) => input.write(msg).await,
            None => bail!("no input attached to route message to"),
        }
    }

    /// Deregisters the egress callback, closes the output channel, and
    /// marks the adapter read-only. Idempotent.
    pub fn close_output(&self) {
        if self.egress.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(h) = &self.callback_handle {
            h.drop_handle();
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }
}

/// The pipeline-level egress callback: serialises `msg` per framing and
/// pushes the bytes to the bounded output channel, or drops the message on
/// `copy=false`.
fn egress_callback(egress: &Egress, msg: &mut Message) -> bool {
    if egress.closed.load(Ordering::Acquire) {
        return true;
    }
    if msg.ctx.source_stage == egress.stage_index.load(Ordering::Acquire) {
        return true;
    }
    if !egress.types.is_empty() && !egress.types.contains(&msg.typ) {
        return true;
    }
    let encoded = if egress.raw {
        crate::bgp::wire::encode(msg.typ, msg.raw.as_ref(), msg.body.as_ref())
    } else {
        framing::encode_envelope(msg).map(|s| Bytes::from(s + "\n"))
    };
    match encoded {
        Ok(bytes) => {
            if egress.out_tx.send(bytes).is_err() {
                msg.action = Action::Drop;
                return true;
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "egress encode failed");
        }
    }
    if !egress.copy {
        msg.action = Action::Borrow;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_single_rejects_unknown_format() {
        let extio = Extio::new(ExtioConfig::default(), Side::L);
        let err = extio.read_single(b"not json or raw").await.unwrap_err();
        assert!(err.to_string().contains("unrecognised"));
    }

    #[tokio::test]
    async fn read_single_ignores_comments_and_blank() {
        let extio = Extio::new(ExtioConfig::default(), Side::L);
        extio.read_single(b"").await.unwrap();
        extio.read_single(b"# a comment").await.unwrap();
    }

    #[test]
    fn config_rejects_raw_and_mrt_together() {
        let mut cfg = StageConfig::new("tcp");
        cfg.flags.insert("raw".into(), String::new());
        cfg.flags.insert("mrt".into(), String::new());
        let parsed = ExtioConfig::from_stage_config(&cfg).unwrap();
        assert!(parsed.validate().is_err());
    }
}
