//! Configuration: the clap-derived global options and the per-stage flag
//! maps the argv tokenizer builds.

pub mod extraction;
pub mod traits;
pub mod types;

pub use extraction::{extract_flag, extract_flag_opt};
pub use traits::StageParams;
pub use types::{GlobalOpts, StageConfig, StdioMode};
