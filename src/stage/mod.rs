//! Stage lifecycle: the `Stage` trait, `StageBase`, the factory registry,
//! and the concrete stage catalogue.

pub mod base;
pub mod exec;
pub mod factory;
pub mod listen;
pub mod mrt;
pub mod speaker;
pub mod stdio;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::pipeline::Pipeline;
pub use base::{CancelToken, Capabilities, StageBase};

/// One pipeline stage's lifecycle: channel wiring happens in `prepare` (a
/// stage attaches its own pipeline inputs/callbacks there), and
/// `stage_base`/`stage_base_mut` expose the control block the controller
/// uses for direction assignment and wait-group bookkeeping.
#[async_trait]
pub trait Stage: Send + Sync {
    fn stage_base(&self) -> &StageBase;
    fn stage_base_mut(&mut self) -> &mut StageBase;

    /// Attaches callbacks/handlers and validates configuration. Invoked
    /// exactly once, before the stage can be enabled.
    async fn prepare(&mut self, pipeline: &Arc<Pipeline>) -> anyhow::Result<()>;

    /// Runs the stage's I/O loop until EOF, a fatal error, or cancellation.
    /// Invoked at most once; a stage is not restartable.
    async fn run(&mut self, pipeline: &Arc<Pipeline>) -> anyhow::Result<()>;

    /// Releases stage-local resources. Called by the controller's Run
    /// wrapper after `run` returns or is forced by cancellation.
    async fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
