//! One pipeline endpoint: input queue, ordered callback chain, output
//! reader.
//!
//! Two purpose-built queues: a bounded `mpsc` input (for write-side
//! back-pressure) and a bounded `mpsc` output consumed by exactly one
//! reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::bgp::wire::MessageType;
use crate::core::callback::{Callback, CallbackFn, CallbackHandle};
use crate::core::message::{Message, MsgDirection, Side};

pub const INPUT_CAPACITY: usize = 256;
pub const OUTPUT_CAPACITY: usize = 256;

/// A writer endpoint for a Direction's input, returned by `AddInput`/
/// `AddProc`.
#[derive(Clone)]
pub struct InputHandle {
    side: Side,
    is_proc: bool,
    tx: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
    seq: Arc<AtomicU64>,
}

impl InputHandle {
    pub fn is_proc(&self) -> bool {
        self.is_proc
    }

    pub async fn write(&self, mut msg: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("PipelineClosed: input for {:?} is closed", self.side);
        }
        if msg.needs_stamp() {
            if msg.seq == 0 {
                msg.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            }
            if msg.time == std::time::UNIX_EPOCH {
                msg.time = crate::core::message::now();
            }
        }
        msg.direction = MsgDirection::Side(self.side);
        self.tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("PipelineClosed: input receiver dropped"))?;
        Ok(())
    }
}

/// The single consumer of a Direction's output.
pub struct OutputReader {
    rx: AsyncMutex<mpsc::Receiver<Message>>,
    closed: Arc<AtomicBool>,
    closed_notify: Arc<tokio::sync::Notify>,
}

impl OutputReader {
    /// Returns `None` once the output has been closed, even if messages
    /// remain buffered.
    pub async fn recv(&self) -> Option<Message> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = self.closed_notify.notified() => None,
        }
    }
}

pub struct Direction {
    pub side: Side,
    input_tx: mpsc::Sender<Message>,
    input_rx: AsyncMutex<Option<mpsc::Receiver<Message>>>,
    output_tx: mpsc::Sender<Message>,
    output_rx: AsyncMutex<Option<mpsc::Receiver<Message>>>,
    callbacks: std::sync::Mutex<Vec<Callback>>,
    next_callback_id: AtomicU64,
    seq: Arc<AtomicU64>,
    input_closed: Arc<AtomicBool>,
    output_closed: Arc<AtomicBool>,
    /// `Direction` keeps its own `input_tx` clone alive for the lifetime of
    /// the pipeline (so late-attaching stages can still call `add_input`),
    /// which means the channel itself never closes on its own. The
    /// dispatch loop instead wakes on this notification when `close_input`
    /// fires.
    input_closed_notify: tokio::sync::Notify,
    output_closed_notify: Arc<tokio::sync::Notify>,
}

impl Direction {
    pub fn new(side: Side) -> Self {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        Self {
            side,
            input_tx,
            input_rx: AsyncMutex::new(Some(input_rx)),
            output_tx,
            output_rx: AsyncMutex::new(Some(output_rx)),
            callbacks: std::sync::Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            seq: Arc::new(AtomicU64::new(0)),
            input_closed: Arc::new(AtomicBool::new(false)),
            output_closed: Arc::new(AtomicBool::new(false)),
            input_closed_notify: tokio::sync::Notify::new(),
            output_closed_notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn add_input(&self) -> InputHandle {
        InputHandle {
            side: self.side,
            is_proc: false,
            tx: self.input_tx.clone(),
            closed: self.input_closed.clone(),
            seq: self.seq.clone(),
        }
    }

    pub fn add_proc(&self) -> InputHandle {
        let mut h = self.add_input();
        h.is_proc = true;
        h
    }

    /// Takes the output reader. May only be called once; subsequent calls
    /// return `None`.
    pub async fn take_output_reader(&self) -> Option<OutputReader> {
        let rx = self.output_rx.lock().await.take()?;
        Some(OutputReader {
            rx: AsyncMutex::new(rx),
            closed: self.output_closed.clone(),
            closed_notify: self.output_closed_notify.clone(),
        })
    }

    pub(crate) async fn take_input_receiver(&self) -> Option<mpsc::Receiver<Message>> {
        self.input_rx.lock().await.take()
    }

    pub(crate) fn output_sender(&self) -> mpsc::Sender<Message> {
        self.output_tx.clone()
    }

    pub fn close_input(&self) {
        self.input_closed.store(true, Ordering::Release);
        self.input_closed_notify.notify_waiters();
    }

    /// Resolves once `close_input` has been called: once every write-side
    /// wait-group participant for this side has exited, no further writes
    /// will arrive, so the dispatch loop can drain what remains and stop
    /// waiting on the channel.
    pub(crate) async fn input_closed_notified(&self) {
        if self.is_input_closed() {
            return;
        }
        self.input_closed_notify.notified().await;
    }

    pub fn close_output(&self) {
        self.output_closed.store(true, Ordering::Release);
        self.output_closed_notify.notify_waiters();
    }

    pub fn is_input_closed(&self) -> bool {
        self.input_closed.load(Ordering::Acquire)
    }

    pub fn is_output_closed(&self) -> bool {
        self.output_closed.load(Ordering::Acquire)
    }

    /// Registers a callback; order defaults to the current callback count
    /// unless `order` is given explicitly.
    pub fn on_msg(
        &self,
        func: CallbackFn,
        direction: MsgDirection,
        types: Vec<MessageType>,
        stage_index: usize,
        order: Option<i64>,
    ) -> CallbackHandle {
        let enabled = Arc::new(AtomicBool::new(true));
        self.register(func, direction, types, stage_index, order, enabled.clone());
        CallbackHandle {
            enabled: vec![enabled],
        }
    }

    /// Lower-level registration sharing a caller-supplied enabled flag, so
    /// a Pipeline-level registration can register the same callback on both
    /// L and R while keeping one `CallbackHandle` that gates both.
    pub fn register(
        &self,
        func: CallbackFn,
        direction: MsgDirection,
        types: Vec<MessageType>,
        stage_index: usize,
        order: Option<i64>,
        enabled: Arc<AtomicBool>,
    ) {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.callbacks.lock().unwrap();
        let order = order.unwrap_or(guard.len() as i64);
        guard.push(Callback {
            id,
            func,
            direction,
            types,
            order,
            stage_index,
            enabled,
        });
        guard.sort_by(|a, b| a.stage_index.cmp(&b.stage_index).then(a.order.cmp(&b.order)));
    }

    pub fn callbacks_snapshot(&self) -> Vec<Callback> {
        self.callbacks.lock().unwrap().clone()
    }
}
