//! `stdin`/`stdout`: Extio over the process's own standard streams.
//! Auto-inserted by the controller when the pipeline lacks an explicit
//! `stdout` (unless `--quiet`), and pre-configured to inject at `first` and
//! wait on `ESTABLISHED` for auto-inserted `stdin`. A line-buffered stdout
//! writer and the simplest producer loop shape, built on Extio's line
//! framing.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::extraction::extract_bool_flag;
use crate::config::{StageConfig, StageParams};
use crate::core::message::Side;
use crate::core::pipeline::Pipeline;
use crate::extio::{Extio, ExtioConfig};
use crate::stage::{Stage, StageBase};

#[derive(Debug, Clone, Default)]
pub struct StdioParams {
    pub raw: bool,
    pub pardon: bool,
}

impl StageParams for StdioParams {
    fn from_stage_config(config: &StageConfig) -> Result<Self> {
        Ok(Self {
            raw: extract_bool_flag(config, "raw"),
            pardon: extract_bool_flag(config, "pardon"),
        })
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

pub struct StdinStage {
    base: StageBase,
    extio: Option<Extio>,
}

impl StdinStage {
    pub fn new(base: StageBase) -> Self {
        Self { base, extio: None }
    }
}

#[async_trait]
impl Stage for StdinStage {
    fn stage_base(&self) -> &StageBase {
        &self.base
    }

    fn stage_base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }

    async fn prepare(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        let params = StdioParams::from_stage_config(&self.base.config)?;
        self.base.caps.is_producer = true;
        self.base.caps.is_stdin = true;
        let mut extio_config = ExtioConfig::from_stage_config(&self.base.config)?;
        extio_config.raw = params.raw;
        extio_config.read = true;
        extio_config.pardon = params.pardon;
        extio_config.validate()?;
        let mut extio = Extio::new(extio_config, Side::L);
        extio.attach(pipeline, self.base.is_left, self.base.is_right, self.base.is_last, self.base.index);
        self.extio = Some(extio);
        self.base.prepared.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn run(&mut self, _pipeline: &Arc<Pipeline>) -> Result<()> {
        let extio = self.extio.as_mut().expect("prepare must run before run");
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        loop {
            let next = tokio::select! {
                line = lines.next_line() => line,
                _ = self.base.cancel.cancelled() => {
                    return Err(crate::controller::errors::BgpipeError::StageStopped.into())
                }
            };
            let Some(line) = next? else {
                tracing::info!("stdin: EOF");
                return Err(crate::controller::errors::BgpipeError::StageStopped.into());
            };
            if let Err(e) = extio.read_single(line.as_bytes()).await {
                tracing::warn!(error = %e, "stdin: ingress parse error");
            }
        }
    }
}

pub struct StdoutStage {
    base: StageBase,
    extio: Option<Extio>,
}

impl StdoutStage {
    pub fn new(base: StageBase) -> Self {
        Self { base, extio: None }
    }
}

#[async_trait]
impl Stage for StdoutStage {
    fn stage_base(&self) -> &StageBase {
        &self.base
    }

    fn stage_base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }

    async fn prepare(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        let params = StdioParams::from_stage_config(&self.base.config)?;
        self.base.caps.is_consumer = true;
        self.base.caps.is_stdout = true;
        let mut extio_config = ExtioConfig::from_stage_config(&self.base.config)?;
        extio_config.raw = params.raw;
        extio_config.write = true;
        extio_config.copy = true;
        extio_config.validate()?;
        let mut extio = Extio::new(extio_config, Side::L);
        extio.attach(pipeline, self.base.is_left, self.base.is_right, self.base.is_last, self.base.index);
        self.extio = Some(extio);
        self.base.prepared.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn run(&mut self, _pipeline: &Arc<Pipeline>) -> Result<()> {
        let extio = self.extio.as_mut().expect("prepare must run before run");
        let out_rx = extio.take_output_receiver().expect("output receiver taken twice");
        let mut stdout = tokio::io::stdout();
        loop {
            tokio::select! {
                bytes = out_rx.recv_async() => {
                    match bytes {
                        Ok(bytes) => {
                            if stdout.write_all(&bytes).await.is_err() || stdout.flush().await.is_err() {
                                return Err(crate::controller::errors::BgpipeError::StageStopped.into());
                            }
                        }
                        Err(_) => return Err(crate::controller::errors::BgpipeError::StageStopped.into()),
                    }
                }
                _ = self.base.cancel.cancelled() => {
                    return Err(crate::controller::errors::BgpipeError::StageStopped.into())
                }
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(extio) = &self.extio {
            extio.close_output();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_default_text_mode() {
        let cfg = StageConfig::new("stdin");
        let p = StdioParams::from_stage_config(&cfg).unwrap();
        assert!(!p.raw);
        assert!(!p.pardon);
    }
}
