//! Error types the controller and stages raise while wiring and running a
//! pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BgpipeError {
    #[error("unknown stage command: {0}")]
    StageUnknown(String),

    #[error("stage command already present in this pipeline: {0}")]
    StageDuplicate(String),

    #[error("stage {0} does not allow --dir=lr / both-direction attachment")]
    LRNotAllowed(String),

    #[error("stage {0} must be the first or last stage in the pipeline")]
    FirstOrLastRequired(String),

    #[error("--start target {0} is not a valid injection point")]
    InjectionTarget(String),

    /// Sentinel: a stage's `run()` returns this to signal a clean, expected
    /// exit (EOF, file exhausted, peer closed) rather than a real failure.
    /// The controller normalises it away and does not log it as an error.
    #[error("stage stopped")]
    StageStopped,
}
