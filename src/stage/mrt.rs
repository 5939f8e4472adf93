//! Reads an MRT/BGP4MP file from disk (optionally gzip-compressed),
//! streaming its BGP messages into the pipeline, using a buffered-I/O
//! reader shape.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;

use crate::bgp::mrt;
use crate::config::{StageConfig, StageParams};
use crate::core::message::{Action, Message, Side};
use crate::core::pipeline::Pipeline;
use crate::stage::{Stage, StageBase};

#[derive(Debug, Clone)]
pub struct MrtParams {
    pub path: String,
}

impl StageParams for MrtParams {
    fn from_stage_config(config: &StageConfig) -> Result<Self> {
        let path = config
            .positionals
            .first()
            .cloned()
            .unwrap_or_else(|| config.command.clone());
        Ok(Self { path })
    }

    fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            anyhow::bail!("mrt stage needs a file path");
        }
        Ok(())
    }
}

pub struct MrtStage {
    base: StageBase,
    params: MrtParams,
}

impl MrtStage {
    pub fn new(base: StageBase, params: MrtParams) -> Self {
        Self { base, params }
    }
}

#[async_trait]
impl Stage for MrtStage {
    fn stage_base(&self) -> &StageBase {
        &self.base
    }

    fn stage_base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }

    async fn prepare(&mut self, _pipeline: &Arc<Pipeline>) -> Result<()> {
        self.params.validate()?;
        self.base.caps.is_producer = true;
        self.base.caps.is_raw_reader = true;
        self.base.check_raw_endpoint_invariant()?;
        self.base.prepared.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn run(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        let mut file = tokio::fs::File::open(&self.params.path)
            .await
            .with_context(|| format!("mrt: failed to open {}", self.params.path))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .await
            .with_context(|| format!("mrt: failed to read {}", self.params.path))?;
        let decompressed = mrt::maybe_decompress(raw)?;

        let side = if self.base.is_left { Side::L } else { Side::R };
        let input = pipeline.add_input(side);

        let mut buf = BytesMut::from(&decompressed[..]);
        let mut count = 0u64;
        loop {
            if self.base.cancel.is_cancelled() {
                return Err(crate::controller::errors::BgpipeError::StageStopped.into());
            }
            match mrt::decode_one(&buf)? {
                Some(rec) => {
                    if !matches!(rec.typ, crate::bgp::wire::MessageType::Invalid) {
                        let mut msg = Message::from_raw(rec.typ, rec.raw);
                        msg.action = Action::Continue;
                        input.write(msg).await?;
                        count += 1;
                    }
                    let _ = buf.split_to(rec.consumed);
                }
                None => break,
            }
        }
        tracing::info!(path = %self.params.path, records = count, "mrt: file fully consumed");
        Err(crate::controller::errors::BgpipeError::StageStopped.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_defaults_to_command_when_no_positional() {
        let cfg = StageConfig::new("./dump.mrt");
        let p = MrtParams::from_stage_config(&cfg).unwrap();
        assert_eq!(p.path, "./dump.mrt");
    }
}
