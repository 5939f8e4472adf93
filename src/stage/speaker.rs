//! A minimal BGP speaker FSM: issues OPEN, completes the KEEPALIVE exchange,
//! and emits `ESTABLISHED` once both sides have confirmed. Full session
//! semantics (route selection, attribute-level UPDATE validation, timers
//! beyond a periodic KEEPALIVE) are out of scope; this stage only drives
//! enough of the OPEN/KEEPALIVE dance to reach `ESTABLISHED`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::bgp::wire::{BgpBody, MessageType, NotificationBody, OpenBody};
use crate::config::extraction::{extract_bool_flag, extract_flag};
use crate::config::{StageConfig, StageParams};
use crate::core::message::{Action, Message, Side};
use crate::core::pipeline::Pipeline;
use crate::stage::{Stage, StageBase};

#[derive(Debug, Clone)]
pub struct SpeakerParams {
    pub active: bool,
    pub asn: u32,
    pub hold_time: u16,
    pub router_id: u32,
}

impl StageParams for SpeakerParams {
    fn from_stage_config(config: &StageConfig) -> Result<Self> {
        Ok(Self {
            active: extract_bool_flag(config, "active"),
            asn: extract_flag(config, "asn", 65000u32),
            hold_time: extract_flag(config, "hold", 90u16),
            router_id: extract_flag(config, "router-id", 0x0a000001u32),
        })
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FsmState {
    Idle = 0,
    OpenSent = 1,
    OpenConfirm = 2,
    Established = 3,
}

impl FsmState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => FsmState::OpenSent,
            2 => FsmState::OpenConfirm,
            3 => FsmState::Established,
            _ => FsmState::Idle,
        }
    }
}

pub struct SpeakerStage {
    base: StageBase,
    params: SpeakerParams,
    side: Side,
    state: AtomicU8,
}

impl SpeakerStage {
    pub fn new(base: StageBase, params: SpeakerParams) -> Self {
        Self {
            base,
            params,
            side: Side::L,
            state: AtomicU8::new(FsmState::Idle as u8),
        }
    }

    /// Stamps every message this stage constructs with its own stage index,
    /// so the self-echo guard in `run`'s read loop recognizes and skips
    /// traffic this speaker injected itself on the same direction it also
    /// reads from.
    fn stamp(&self, mut msg: Message) -> Message {
        msg.ctx.source_stage = self.base.index;
        msg
    }

    fn open_message(&self) -> Message {
        let body = BgpBody {
            open: Some(OpenBody {
                version: 4,
                asn: self.params.asn,
                hold_time: self.params.hold_time,
                router_id: self.params.router_id,
                four_byte_asn: false,
            }),
            update: None,
            notification: None,
        };
        self.stamp(Message::from_body(MessageType::Open, body))
    }

    fn keepalive_message(&self) -> Message {
        self.stamp(Message::new(MessageType::Keepalive))
    }

    fn state(&self) -> FsmState {
        FsmState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: FsmState) {
        self.state.store(s as u8, Ordering::Release);
    }
}

#[async_trait]
impl Stage for SpeakerStage {
    fn stage_base(&self) -> &StageBase {
        &self.base
    }

    fn stage_base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }

    async fn prepare(&mut self, _pipeline: &Arc<Pipeline>) -> Result<()> {
        self.params.validate()?;
        self.base.caps.is_producer = true;
        self.base.caps.is_consumer = true;
        self.side = if self.base.is_left { Side::L } else { Side::R };
        self.base.prepared.store(true, Ordering::Release);
        Ok(())
    }

    async fn run(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        let input = pipeline.add_input(self.side);
        let reader = pipeline
            .take_output_reader(self.side)
            .await
            .ok_or_else(|| anyhow::anyhow!("speaker: output reader for {:?} already taken", self.side))?;

        if self.params.active {
            tracing::info!(asn = self.params.asn, "speaker: sending active OPEN");
            input.write(self.open_message()).await?;
            self.set_state(FsmState::OpenSent);
        } else {
            tracing::debug!("speaker: passive, waiting for peer OPEN");
        }

        let mut keepalive_timer = tokio::time::interval(Duration::from_secs((self.params.hold_time / 3).max(1) as u64));
        keepalive_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = reader.recv() => {
                    let Some(mut msg) = msg else {
                        tracing::info!("speaker: upstream direction closed");
                        return Err(crate::controller::errors::BgpipeError::StageStopped.into());
                    };
                    if msg.ctx.source_stage == self.base.index {
                        continue;
                    }
                    match msg.typ {
                        MessageType::Open => {
                            match self.state() {
                                FsmState::Idle => {
                                    input.write(self.open_message()).await?;
                                    input.write(self.keepalive_message()).await?;
                                    self.set_state(FsmState::OpenConfirm);
                                }
                                FsmState::OpenSent => {
                                    input.write(self.keepalive_message()).await?;
                                    self.set_state(FsmState::OpenConfirm);
                                }
                                _ => {}
                            }
                        }
                        MessageType::Keepalive => {
                            if self.state() == FsmState::OpenConfirm {
                                self.set_state(FsmState::Established);
                                tracing::info!("speaker: session established");
                                pipeline.emit("ESTABLISHED", None, &[]);
                            }
                        }
                        MessageType::Notification => {
                            tracing::warn!("speaker: received NOTIFICATION, session closing");
                            return Err(crate::controller::errors::BgpipeError::StageStopped.into());
                        }
                        MessageType::Invalid => {}
                    }
                    msg.action = Action::Drop;
                }
                _ = keepalive_timer.tick() => {
                    if self.state() == FsmState::Established {
                        input.write(self.keepalive_message()).await?;
                    }
                }
                _ = self.base.cancel.cancelled() => {
                    let _ = input
                        .write(self.stamp(Message::from_body(
                            MessageType::Notification,
                            BgpBody {
                                open: None,
                                update: None,
                                notification: Some(NotificationBody { code: 6, subcode: 0, data: bytes::Bytes::new() }),
                            },
                        )))
                        .await;
                    return Err(crate::controller::errors::BgpipeError::StageStopped.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::CancelToken;

    #[test]
    fn params_default_active_false() {
        let cfg = StageConfig::new("speaker");
        let p = SpeakerParams::from_stage_config(&cfg).unwrap();
        assert!(!p.active);
        assert_eq!(p.asn, 65000);
    }

    #[test]
    fn params_parses_active_flag() {
        let mut cfg = StageConfig::new("speaker");
        cfg.flags.insert("active".into(), String::new());
        let p = SpeakerParams::from_stage_config(&cfg).unwrap();
        assert!(p.active);
    }

    #[tokio::test]
    async fn active_speaker_never_reaches_established_from_its_own_traffic() {
        let pipeline = Arc::new(Pipeline::new());
        pipeline.start();

        let root = CancelToken::new();
        let mut cfg = StageConfig::new("speaker");
        cfg.flags.insert("active".into(), String::new());
        let params = SpeakerParams::from_stage_config(&cfg).unwrap();
        // Non-zero index: a zero `source_stage` default would otherwise
        // coincidentally match a zero stage index and mask the bug.
        let base = StageBase::new(1, "speaker".into(), cfg, &root);
        let mut stage = SpeakerStage::new(base, params);
        stage.prepare(&pipeline).await.unwrap();

        let teardown = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            root.cancel(anyhow::anyhow!("test teardown"));
        };

        let (result, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(stage.run(&pipeline), teardown)
        })
        .await
        .expect("run should exit once cancelled");

        assert!(result.is_err(), "run should exit with an error once cancelled");
        assert_ne!(
            stage.state(),
            FsmState::Established,
            "an unpaired speaker must not reach Established from reading back its own OPEN/KEEPALIVE"
        );
    }
}
