//! The stage-command registry: known command names (consulted by
//! `controller::argv`'s stage-start heuristic), each command's intrinsic
//! capability flags (needed for direction assignment *before* a stage's own
//! `prepare()` runs), and the constructor that turns a parsed
//! [`StageConfig`] into a boxed [`Stage`]. A plain match over a fixed,
//! compile-time-known set of stage names, since bgpipe's stage catalogue
//! isn't user-extensible at runtime.

use anyhow::Result;

use crate::config::{StageConfig, StageParams};
use crate::stage::base::{CancelToken, Capabilities, StageBase};
use crate::stage::{exec, listen, mrt, speaker, stdio, tcp};
use crate::stage::Stage;

/// All command names the argv tokenizer treats as stage-starts (a
/// registered command name starts a new stage unconditionally).
pub const KNOWN_COMMANDS: &[&str] = &["tcp", "listen", "mrt", "speaker", "stdin", "stdout", "exec"];

/// The capability flags intrinsic to a stage *kind*, independent of any
/// per-instance configuration. The controller needs these to assign L/R
/// defaults before a stage's own `prepare()` has run, since `prepare()`
/// itself depends on knowing which side it was assigned.
pub fn static_capabilities(command: &str) -> Capabilities {
    match command {
        "tcp" | "listen" => Capabilities {
            is_producer: true,
            is_consumer: true,
            is_raw_reader: true,
            is_raw_writer: true,
            is_stdin: false,
            is_stdout: false,
            allow_lr: false,
        },
        "mrt" => Capabilities {
            is_producer: true,
            is_consumer: false,
            is_raw_reader: true,
            is_raw_writer: false,
            is_stdin: false,
            is_stdout: false,
            allow_lr: false,
        },
        "speaker" => Capabilities {
            is_producer: true,
            is_consumer: true,
            is_raw_reader: false,
            is_raw_writer: false,
            is_stdin: false,
            is_stdout: false,
            allow_lr: false,
        },
        "stdin" => Capabilities {
            is_producer: true,
            is_consumer: false,
            is_raw_reader: false,
            is_raw_writer: false,
            is_stdin: true,
            is_stdout: false,
            allow_lr: false,
        },
        "stdout" => Capabilities {
            is_producer: false,
            is_consumer: true,
            is_raw_reader: false,
            is_raw_writer: false,
            is_stdin: false,
            is_stdout: true,
            allow_lr: false,
        },
        "exec" => Capabilities {
            is_producer: true,
            is_consumer: true,
            is_raw_reader: false,
            is_raw_writer: false,
            is_stdin: false,
            is_stdout: false,
            allow_lr: true,
        },
        _ => Capabilities::default(),
    }
}

/// Constructs the boxed [`Stage`] for `base.command`, parsing its
/// stage-specific parameters out of `base.config`. `base`'s direction
/// flags must already be assigned: direction assignment runs before
/// Prepare.
pub fn build_stage(base: StageBase) -> Result<Box<dyn Stage>> {
    let config = base.config.clone();
    match base.command.as_str() {
        "tcp" => Ok(Box::new(tcp::TcpStage::new(base, tcp::TcpParams::from_stage_config(&config)?))),
        "listen" => Ok(Box::new(listen::ListenStage::new(
            base,
            listen::ListenParams::from_stage_config(&config)?,
        ))),
        "mrt" => Ok(Box::new(mrt::MrtStage::new(base, mrt::MrtParams::from_stage_config(&config)?))),
        "speaker" => Ok(Box::new(speaker::SpeakerStage::new(
            base,
            speaker::SpeakerParams::from_stage_config(&config)?,
        ))),
        "stdin" => Ok(Box::new(stdio::StdinStage::new(base))),
        "stdout" => Ok(Box::new(stdio::StdoutStage::new(base))),
        "exec" => Ok(Box::new(exec::ExecStage::new(base, exec::ExecParams::from_stage_config(&config)?))),
        other => Err(crate::controller::errors::BgpipeError::StageUnknown(other.to_string()).into()),
    }
}

/// Convenience constructor used by the controller when it needs a fresh
/// [`StageBase`] alongside the boxed stage, right after argv parsing.
pub fn new_stage_base(index: usize, command: String, config: StageConfig, parent_cancel: &CancelToken) -> StageBase {
    let mut base = StageBase::new(index, command.clone(), config, parent_cancel);
    base.caps = static_capabilities(&command);
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_cover_the_catalogue() {
        for cmd in ["tcp", "listen", "mrt", "speaker", "stdin", "stdout", "exec"] {
            assert!(KNOWN_COMMANDS.contains(&cmd));
        }
    }

    #[test]
    fn tcp_is_a_raw_reader_and_writer() {
        let caps = static_capabilities("tcp");
        assert!(caps.is_raw_reader && caps.is_raw_writer);
    }

    #[test]
    fn mrt_is_producer_only() {
        let caps = static_capabilities("mrt");
        assert!(caps.is_producer && !caps.is_consumer);
    }
}
