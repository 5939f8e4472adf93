//! A typed stage configuration parsed from and validated against an
//! argv-sourced `StageConfig`.

use super::types::StageConfig;

pub trait StageParams: Sized {
    fn from_stage_config(config: &StageConfig) -> anyhow::Result<Self>;
    fn validate(&self) -> anyhow::Result<()>;
}
