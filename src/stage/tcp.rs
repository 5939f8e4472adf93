//! Dial (or, via `listen.rs`, accept) a TCP peer and shuttle raw BGP bytes
//! between the socket and the pipeline, with a reconnect loop using bounded
//! exponential backoff plus jitter, and half-close handling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::extraction::{extract_bool_flag, extract_flag};
use crate::config::{StageConfig, StageParams};
use crate::core::message::Side;
use crate::core::pipeline::Pipeline;
use crate::extio::{Extio, ExtioConfig};
use crate::stage::{Stage, StageBase};

const RETRY_BACKOFF_CAP_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct TcpParams {
    pub addr: String,
    pub timeout_secs: u64,
    pub md5: bool,
    pub retry: bool,
    pub retry_max: u32,
    pub bind: Option<String>,
}

impl StageParams for TcpParams {
    fn from_stage_config(config: &StageConfig) -> Result<Self> {
        let addr = config
            .positionals
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("tcp stage needs a host:port argument"))?;
        let addr = if addr.contains(':') { addr } else { format!("{addr}:179") };
        Ok(Self {
            addr,
            timeout_secs: extract_flag(config, "timeout", 10),
            md5: extract_bool_flag(config, "md5"),
            retry: extract_bool_flag(config, "retry"),
            retry_max: extract_flag(config, "retry-max", 0),
            bind: config.flags.get("bind").cloned(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            anyhow::bail!("tcp address must not be empty");
        }
        Ok(())
    }
}

pub struct TcpStage {
    base: StageBase,
    params: TcpParams,
    extio: Option<Extio>,
}

impl TcpStage {
    pub fn new(base: StageBase, params: TcpParams) -> Self {
        Self {
            base,
            params,
            extio: None,
        }
    }

    async fn dial_with_retry(&self) -> Result<TcpStream> {
        let mut attempt: u32 = 0;
        loop {
            let connect = TcpStream::connect(&self.params.addr);
            let dialed = tokio::time::timeout(Duration::from_secs(self.params.timeout_secs), connect).await;
            match dialed {
                Ok(Ok(stream)) => {
                    if self.params.md5 {
                        tracing::debug!(addr = %self.params.addr, "TCP-MD5 requested (socket option wiring is external)");
                    }
                    tracing::info!(addr = %self.params.addr, "tcp: connected");
                    return Ok(stream);
                }
                Ok(Err(e)) if self.params.retry && (self.params.retry_max == 0 || attempt < self.params.retry_max) => {
                    attempt += 1;
                    let delay = backoff_with_jitter(attempt);
                    tracing::warn!(addr = %self.params.addr, error = %e, attempt, delay_ms = delay.as_millis() as u64, "tcp: dial failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(e)) => return Err(e).context("tcp dial failed"),
                Err(_) => {
                    if self.params.retry && (self.params.retry_max == 0 || attempt < self.params.retry_max) {
                        attempt += 1;
                        let delay = backoff_with_jitter(attempt);
                        tracing::warn!(addr = %self.params.addr, attempt, "tcp: dial timed out, retrying");
                        tokio::time::sleep(delay).await;
                    } else {
                        return Err(anyhow!("tcp dial to {} timed out", self.params.addr));
                    }
                }
            }
        }
    }
}

/// Shared half-duplex connection loop: spawns a writer task draining
/// `extio`'s output channel to the socket, reads the socket into `extio`'s
/// framed ingress on the calling task, and returns once either half hits
/// EOF or `cancel` fires. Shared by `tcp` (dial) and `listen` (accept).
pub(crate) async fn shuttle_connection(
    stream: TcpStream,
    extio: &mut Extio,
    cancel: &crate::stage::CancelToken,
    addr_display: &str,
) -> Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let out_rx = extio.take_output_receiver().expect("output receiver taken twice");

    let cancel_writer = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                bytes = out_rx.recv_async() => {
                    match bytes {
                        Ok(bytes) => {
                            if write_half.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                _ = cancel_writer.cancelled() => break,
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut buf = BytesMut::with_capacity(8192);
    loop {
        tokio::select! {
            n = read_half.read_buf(&mut buf) => {
                let n = n.context("tcp read failed")?;
                if n == 0 {
                    break;
                }
                extio.read_framed_buf(&mut buf).await?;
            }
            _ = cancel.cancelled() => break,
        }
    }
    writer.abort();
    tracing::info!(addr = %addr_display, "tcp: connection closed");
    Err(crate::controller::errors::BgpipeError::StageStopped.into())
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 1u64.checked_shl(attempt.min(6)).unwrap_or(64).min(RETRY_BACKOFF_CAP_SECS);
    let jitter_ms = rand::rng().random_range(0..500);
    Duration::from_secs(base) + Duration::from_millis(jitter_ms)
}

#[async_trait]
impl Stage for TcpStage {
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
        let stream = tokio::select! {
            dialed = self.dial_with_retry() => dialed?,
            _ = self.base.cancel.cancelled() => return Err(crate::controller::errors::BgpipeError::StageStopped.into()),
        };
        let side = if self.base.is_left { "L" } else { "R" };
        if let Ok(local) = stream.local_addr() {
            pipeline.kv.set_conn(side, "LOCAL", &local.to_string());
        }
        if let Ok(peer) = stream.peer_addr() {
            pipeline.kv.set_conn(side, "REMOTE", &peer.to_string());
        }
        let extio = self.extio.as_mut().expect("prepare must run before run");
        shuttle_connection(stream, extio, &self.base.cancel, &self.params.addr).await
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
    fn params_default_port_179() {
        let mut cfg = StageConfig::new("tcp");
        cfg.positionals.push("192.0.2.1".into());
        let p = TcpParams::from_stage_config(&cfg).unwrap();
        assert_eq!(p.addr, "192.0.2.1:179");
    }

    #[test]
    fn params_keeps_explicit_port() {
        let mut cfg = StageConfig::new("tcp");
        cfg.positionals.push("192.0.2.1:1790".into());
        let p = TcpParams::from_stage_config(&cfg).unwrap();
        assert_eq!(p.addr, "192.0.2.1:1790");
    }

    #[test]
    fn backoff_is_capped() {
        let d = backoff_with_jitter(10);
        assert!(d.as_secs() <= RETRY_BACKOFF_CAP_SECS + 1);
    }
}
