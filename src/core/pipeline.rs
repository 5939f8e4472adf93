//! The pipeline: two Directions, an event bus, a KV store, and the
//! negotiated capability set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::bgp::wire::MessageType;
use crate::core::callback::{CallbackFn, CallbackHandle};
use crate::core::capabilities::Capabilities;
use crate::core::direction::{Direction, InputHandle, OutputReader};
use crate::core::event::{EventBus, HandlerFn, HandlerHandle, HandlerPhase};
use crate::core::kv::KvStore;
use crate::core::message::{Action, Message, MsgDirection, Side};

pub struct Pipeline {
    pub l: Direction,
    pub r: Direction,
    pub events: EventBus,
    pub kv: KvStore,
    pub capabilities: Mutex<Capabilities>,
    started: AtomicBool,
    dispatch_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            l: Direction::new(Side::L),
            r: Direction::new(Side::R),
            events: EventBus::new(),
            kv: KvStore::new(),
            capabilities: Mutex::new(Capabilities::default()),
            started: AtomicBool::new(false),
            dispatch_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn direction(&self, side: Side) -> &Direction {
        match side {
            Side::L => &self.l,
            Side::R => &self.r,
        }
    }

    pub fn add_input(&self, side: Side) -> InputHandle {
        self.direction(side).add_input()
    }

    pub fn add_proc(&self, side: Side) -> InputHandle {
        self.direction(side).add_proc()
    }

    pub async fn write(&self, side: Side, msg: Message) -> Result<()> {
        self.add_input(side).write(msg).await
    }

    pub fn take_output_reader(&self, side: Side) -> impl std::future::Future<Output = Option<OutputReader>> + '_ {
        self.direction(side).take_output_reader()
    }

    /// Registers a callback on whichever Direction(s) `dir` selects,
    /// sharing one enabled flag across both when `dir` is `Both`/`None`.
    pub fn on_msg(
        &self,
        func: CallbackFn,
        dir: MsgDirection,
        types: Vec<MessageType>,
        stage_index: usize,
        order: Option<i64>,
    ) -> CallbackHandle {
        use std::sync::atomic::AtomicBool as AB;
        use std::sync::Arc;
        let enabled = Arc::new(AB::new(true));
        let register_l = matches!(dir, MsgDirection::Side(Side::L) | MsgDirection::Both | MsgDirection::None);
        let register_r = matches!(dir, MsgDirection::Side(Side::R) | MsgDirection::Both | MsgDirection::None);
        if register_l {
            self.l
                .register(func.clone(), dir, types.clone(), stage_index, order, enabled.clone());
        }
        if register_r {
            self.r
                .register(func.clone(), dir, types.clone(), stage_index, order, enabled.clone());
        }
        CallbackHandle {
            enabled: vec![enabled],
        }
    }

    pub fn on_event(
        &self,
        names: Vec<String>,
        phase: HandlerPhase,
        order: i64,
        one_shot: bool,
        func: HandlerFn,
    ) -> HandlerHandle {
        self.events.on(names, phase, order, one_shot, func)
    }

    pub fn emit(&self, name: &str, msg: Option<&Message>, args: &[String]) -> bool {
        self.events.emit(name, msg, args)
    }

    /// Emits `pipe.START` and launches the per-direction dispatch loops.
    /// May be called once; subsequent calls are a no-op.
    pub fn start(self: &std::sync::Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.emit("START", None, &[]);
        let mut tasks = self.dispatch_tasks.lock().unwrap();
        for side in [Side::L, Side::R] {
            let pipeline = self.clone();
            tasks.push(tokio::spawn(async move {
                pipeline.dispatch_loop(side).await;
            }));
        }
    }

    /// Blocks until both directions' dispatch loops have exited (which
    /// happens once their input channel is drained and closed).
    pub async fn wait(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut self.dispatch_tasks.lock().unwrap());
        for h in handles {
            let _ = h.await;
        }
    }

    async fn dispatch_loop(self: std::sync::Arc<Self>, side: Side) {
        let direction = self.direction(side);
        let mut rx = match direction.take_input_receiver().await {
            Some(rx) => rx,
            None => return,
        };
        let output_tx = direction.output_sender();
        loop {
            let msg = tokio::select! {
                biased;
                msg = rx.recv() => msg,
                _ = direction.input_closed_notified() => {
                    match rx.try_recv() {
                        Ok(msg) => Some(msg),
                        Err(_) => None,
                    }
                }
            };
            let Some(mut msg) = msg else { break };
            self.dispatch_one(side, &mut msg);
            if !msg.is_dropped() {
                if output_tx.send(msg).await.is_err() {
                    tracing::debug!(side = side.as_str(), "output receiver dropped, message discarded");
                }
            }
        }
        direction.close_output();
        tracing::debug!(side = side.as_str(), "dispatch loop exiting: input drained");
    }

    /// Runs one message through its Direction's callback chain. No callback
    /// of a stage with index below the message's start-at cursor ever sees
    /// the message.
    fn dispatch_one(&self, side: Side, msg: &mut Message) {
        use crate::core::message::StartAt;
        if matches!(msg.ctx.start_at, StartAt::SkipAll) {
            return;
        }
        let min_index = match msg.ctx.start_at {
            StartAt::First => 0,
            StartAt::SkipAll => usize::MAX,
            StartAt::At(n) => n,
        };
        let callbacks = self.direction(side).callbacks_snapshot();
        for cb in callbacks.iter() {
            if cb.stage_index < min_index {
                continue;
            }
            if !cb.matches(side, msg.typ) {
                continue;
            }
            let keep_going = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (cb.func)(msg)));
            match keep_going {
                Ok(true) => {}
                Ok(false) => {
                    msg.action = Action::Drop;
                    msg.ctx.dropped_by = Some(cb.stage_index);
                }
                Err(_) => {
                    tracing::error!(stage = cb.stage_index, "callback panicked, message dropped");
                    msg.action = Action::Drop;
                    msg.ctx.dropped_by = Some(cb.stage_index);
                    self.emit("PARSE", None, &[]);
                }
            }
            if msg.is_dropped() {
                return;
            }
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn keepalive() -> Message {
        Message::new(MessageType::Keepalive)
    }

    #[tokio::test]
    async fn dispatch_honours_start_at() {
        let pipeline = Arc::new(Pipeline::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for idx in 0..3 {
            let seen = seen.clone();
            pipeline.on_msg(
                Arc::new(move |_m: &mut Message| {
                    seen.lock().unwrap().push(idx);
                    true
                }),
                MsgDirection::Both,
                vec![],
                idx,
                None,
            );
        }

        pipeline.start();
        let mut msg = keepalive();
        msg.ctx.start_at = crate::core::message::StartAt::At(1);
        pipeline.write(Side::L, msg).await.unwrap();

        let reader = pipeline.direction(Side::L).take_output_reader().await.unwrap();
        let _ = reader.recv().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn type_filter_excludes_other_types() {
        let pipeline = Arc::new(Pipeline::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pipeline.on_msg(
            Arc::new(move |_m: &mut Message| {
                h.fetch_add(1, Ordering::SeqCst);
                true
            }),
            MsgDirection::Both,
            vec![MessageType::Update],
            0,
            None,
        );
        pipeline.start();
        pipeline.write(Side::L, keepalive()).await.unwrap();
        let reader = pipeline.direction(Side::L).take_output_reader().await.unwrap();
        let _ = reader.recv().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drop_action_stops_chain_and_output() {
        let pipeline = Arc::new(Pipeline::new());
        pipeline.on_msg(
            Arc::new(|_m: &mut Message| false),
            MsgDirection::Both,
            vec![],
            0,
            None,
        );
        let hit_second = Arc::new(AtomicUsize::new(0));
        let h2 = hit_second.clone();
        pipeline.on_msg(
            Arc::new(move |_m: &mut Message| {
                h2.fetch_add(1, Ordering::SeqCst);
                true
            }),
            MsgDirection::Both,
            vec![],
            1,
            None,
        );
        pipeline.start();
        pipeline.write(Side::L, keepalive()).await.unwrap();
        pipeline.direction(Side::L).close_input();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(hit_second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sequence_numbers_are_monotonic_per_direction() {
        let pipeline = Arc::new(Pipeline::new());
        pipeline.start();
        pipeline.write(Side::L, keepalive()).await.unwrap();
        pipeline.write(Side::L, keepalive()).await.unwrap();
        let reader = pipeline.direction(Side::L).take_output_reader().await.unwrap();
        let m1 = reader.recv().await.unwrap();
        let m2 = reader.recv().await.unwrap();
        assert!(m1.seq > 0 && m2.seq > m1.seq);
    }
}
