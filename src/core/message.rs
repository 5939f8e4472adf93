//! The message value and its per-dispatch context.
//!
//! A BGP message flowing through the pipeline: direction, sequence, type,
//! and *both* a structured body and raw wire bytes, exactly one of which
//! is authoritative at any time.

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bgp::wire::{BgpBody, MessageType};

/// One of the two pipeline endpoints, or a sentinel meaning "unset"/"both".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    L,
    R,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::L => Side::R,
            Side::R => Side::L,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::L => "L",
            Side::R => "R",
        }
    }
}

/// A message's declared direction, including the two sentinels `both`/`none`
/// used before the pipeline has routed it to a concrete side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgDirection {
    Side(Side),
    Both,
    None,
}

impl Default for MsgDirection {
    fn default() -> Self {
        MsgDirection::None
    }
}

/// Per-message action flags a callback may set to affect dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Continue,
    Drop,
    /// The callback has taken ownership of the message (e.g. Extio's egress
    /// callback, which serialises and forwards it out of band) and the
    /// dispatcher must not deliver it to the direction's output reader.
    Borrow,
}

/// Where in the callback chain a freshly-injected message should enter.
///
/// Sentinel values avoid a special "inject here" entry point: `First` ==
/// index 0 (earliest callback), `SkipAll` == bypass the chain entirely
/// (direct-to-sink injection), `At(n)` starts at stage index `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    First,
    SkipAll,
    At(usize),
}

impl StartAt {
    pub fn from_raw(v: i64) -> Self {
        match v {
            0 => StartAt::First,
            -1 => StartAt::SkipAll,
            n if n > 0 => StartAt::At(n as usize),
            _ => StartAt::First,
        }
    }
}

/// Per-message dispatch context.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub start_at: StartAt,
    pub source_stage: usize,
    /// Set by a callback that wants to consume the message without it
    /// proceeding to the direction's output (mirrors the `Action::Drop`
    /// path but tracked here for stages that need to know which callback
    /// did the dropping, for diagnostics).
    pub dropped_by: Option<usize>,
}

impl Default for MessageContext {
    fn default() -> Self {
        Self {
            start_at: StartAt::First,
            source_stage: 0,
            dropped_by: None,
        }
    }
}

/// A BGP message plus routing metadata, flowing through the pipeline.
///
/// Exactly one of `body`/`raw` is authoritative; the codec populates the
/// other lazily on demand. Sequence `0` means "unassigned."
#[derive(Debug, Clone)]
pub struct Message {
    pub direction: MsgDirection,
    pub seq: u64,
    pub time: SystemTime,
    pub typ: MessageType,
    pub body: Option<BgpBody>,
    pub raw: Option<Bytes>,
    pub tags: Vec<String>,
    pub action: Action,
    pub ctx: MessageContext,
}

impl Message {
    pub fn new(typ: MessageType) -> Self {
        Self {
            direction: MsgDirection::None,
            seq: 0,
            time: UNIX_EPOCH,
            typ,
            body: None,
            raw: None,
            tags: Vec::new(),
            action: Action::Continue,
            ctx: MessageContext::default(),
        }
    }

    pub fn from_raw(typ: MessageType, raw: Bytes) -> Self {
        let mut m = Self::new(typ);
        m.raw = Some(raw);
        m
    }

    pub fn from_body(typ: MessageType, body: BgpBody) -> Self {
        let mut m = Self::new(typ);
        m.body = Some(body);
        m
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self.action, Action::Drop | Action::Borrow)
    }

    /// True iff `seq`/`time` have not yet been assigned by the pipeline.
    pub fn needs_stamp(&self) -> bool {
        self.seq == 0 || self.time == UNIX_EPOCH
    }
}

pub fn now() -> SystemTime {
    SystemTime::now()
}
