//! Spawns a subprocess and pipes messages through its stdin/stdout as JSON
//! lines, using the same half-duplex shuttle shape as `tcp` (a writer task
//! draining Extio's output channel, a reader loop feeding Extio's ingress),
//! substituting a child process's pipes for a socket. Stderr is logged
//! line-by-line rather than fed back into the pipeline.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::{StageConfig, StageParams};
use crate::core::message::Side;
use crate::core::pipeline::Pipeline;
use crate::extio::{Extio, ExtioConfig};
use crate::stage::{Stage, StageBase};

/// How long to let a spawned child wind down on its own before the stage
/// gives up waiting on it.
const WAIT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub command: String,
    pub args: Vec<String>,
}

impl StageParams for ExecParams {
    fn from_stage_config(config: &StageConfig) -> Result<Self> {
        let mut positionals = config.positionals.iter();
        let command = positionals
            .next()
            .cloned()
            .ok_or_else(|| anyhow!("exec stage needs a command to run"))?;
        Ok(Self {
            command,
            args: positionals.cloned().collect(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            anyhow::bail!("exec command must not be empty");
        }
        Ok(())
    }
}

pub struct ExecStage {
    base: StageBase,
    params: ExecParams,
    extio: Option<Extio>,
}

impl ExecStage {
    pub fn new(base: StageBase, params: ExecParams) -> Self {
        Self {
            base,
            params,
            extio: None,
        }
    }
}

#[async_trait]
impl Stage for ExecStage {
    fn stage_base(&self) -> &StageBase {
        &self.base
    }

    fn stage_base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }

    async fn prepare(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        self.params.validate()?;
        self.base.caps.is_producer = true;
        self.base.caps.is_consumer = true;
        self.base.caps.allow_lr = true;
        self.base.check_lr_invariant()?;
        let mut extio_config = ExtioConfig::from_stage_config(&self.base.config)?;
        extio_config.validate()?;
        let mut extio = Extio::new(extio_config, Side::L);
        extio.attach(pipeline, self.base.is_left, self.base.is_right, self.base.is_last, self.base.index);
        self.extio = Some(extio);
        self.base.prepared.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn run(&mut self, _pipeline: &Arc<Pipeline>) -> Result<()> {
        let mut child = Command::new(&self.params.command)
            .args(&self.params.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("exec: failed to spawn '{}'", self.params.command))?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let extio = self.extio.as_mut().expect("prepare must run before run");
        let out_rx = extio.take_output_receiver().expect("output receiver taken twice");

        let cancel_writer = self.base.cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    bytes = out_rx.recv_async() => {
                        match bytes {
                            Ok(bytes) => {
                                if stdin.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    _ = cancel_writer.cancelled() => break,
                }
            }
            let _ = stdin.shutdown().await;
        });

        let command_name = self.params.command.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(command = %command_name, "exec stderr: {line}");
            }
        });

        let mut stdout = stdout;
        let mut buf = BytesMut::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        let run_result: Result<()> = loop {
            tokio::select! {
                n = stdout.read(&mut chunk) => {
                    let n = n.context("exec: reading child stdout failed")?;
                    if n == 0 {
                        break Ok(());
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Err(e) = extio.read_json_buf(&buf).await {
                        break Err(e);
                    }
                    buf.clear();
                }
                _ = self.base.cancel.cancelled() => break Ok(()),
            }
        };

        writer.abort();
        stderr_task.abort();

        let _ = tokio::time::timeout(WAIT_DELAY, child.wait()).await;
        let _ = child.start_kill();

        run_result?;
        tracing::info!(command = %self.params.command, "exec: subprocess exited");
        Err(crate::controller::errors::BgpipeError::StageStopped.into())
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
    fn params_splits_command_and_args() {
        let mut cfg = StageConfig::new("exec");
        cfg.positionals.push("./filter.sh".into());
        cfg.positionals.push("--verbose".into());
        let p = ExecParams::from_stage_config(&cfg).unwrap();
        assert_eq!(p.command, "./filter.sh");
        assert_eq!(p.args, vec!["--verbose".to_string()]);
    }

    #[test]
    fn params_requires_a_command() {
        let cfg = StageConfig::new("exec");
        assert!(ExecParams::from_stage_config(&cfg).is_err());
    }
}
