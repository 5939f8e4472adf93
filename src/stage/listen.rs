//! TCP server stage: binds, accepts exactly one connection (point-to-point),
//! then hands off to the same connection loop `tcp` uses.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;

use crate::config::{StageConfig, StageParams};
use crate::core::message::Side;
use crate::core::pipeline::Pipeline;
use crate::extio::{Extio, ExtioConfig};
use crate::stage::tcp::shuttle_connection;
use crate::stage::{Stage, StageBase};

#[derive(Debug, Clone)]
pub struct ListenParams {
    pub bind_addr: String,
}

impl StageParams for ListenParams {
    fn from_stage_config(config: &StageConfig) -> Result<Self> {
        let addr = config
            .positionals
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("listen stage needs a bind address argument"))?;
        let addr = if addr.contains(':') { addr } else { format!("{addr}:179") };
        Ok(Self { bind_addr: addr })
    }

    fn validate(&self) -> Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("listen bind address must not be empty");
        }
        Ok(())
    }
}

pub struct ListenStage {
    base: StageBase,
    params: ListenParams,
    extio: Option<Extio>,
}

impl ListenStage {
    pub fn new(base: StageBase, params: ListenParams) -> Self {
        Self {
            base,
            params,
            extio: None,
        }
    }
}

#[async_trait]
impl Stage for ListenStage {
    fn stage_base(&self) -> &StageBase {
        &self.base
    }

    fn stage_base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }

    async fn prepare(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        self.params.validate()?;
        self.base.caps.is_raw_reader = true;
        self.base.caps.is_raw_writer = true;
        self.base.caps.is_producer = true;
        self.base.caps.is_consumer = true;
        self.base.check_raw_endpoint_invariant()?;
        let mut extio_config = ExtioConfig::from_stage_config(&self.base.config)?;
        extio_config.raw = true;
        extio_config.validate()?;
        let mut extio = Extio::new(extio_config, Side::L);
        extio.attach(pipeline, self.base.is_left, self.base.is_right, self.base.is_last, self.base.index);
        self.extio = Some(extio);
        self.base.prepared.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn run(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        let listener = TcpListener::bind(&self.params.bind_addr)
            .await
            .with_context(|| format!("listen: failed to bind {}", self.params.bind_addr))?;
        tracing::info!(addr = %self.params.bind_addr, "listen: waiting for a peer");

        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted.context("listen: accept failed")?,
            _ = self.base.cancel.cancelled() => {
                return Err(crate::controller::errors::BgpipeError::StageStopped.into())
            }
        };
        tracing::info!(%peer, "listen: accepted connection");

        let side = if self.base.is_left { "L" } else { "R" };
        if let Ok(local) = stream.local_addr() {
            pipeline.kv.set_conn(side, "LOCAL", &local.to_string());
        }
        pipeline.kv.set_conn(side, "REMOTE", &peer.to_string());

        let extio = self.extio.as_mut().expect("prepare must run before run");
        shuttle_connection(stream, extio, &self.base.cancel, &peer.to_string()).await
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(extio) = &self.extio {
            extio.close_output();
        }
        Ok(())
    }
}
