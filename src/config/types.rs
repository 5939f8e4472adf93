//! Global CLI options and the per-stage configuration map the controller
//! builds from argv. There is no config file: each stage's flags are
//! parsed into a flat string map by `controller::argv`.

use std::collections::HashMap;

use clap::Parser;

/// Top-level CLI flags, parsed once before the stage argv is tokenized.
#[derive(Parser, Debug, Clone)]
#[command(name = "bgpipe")]
#[command(author = "Keith Bugeja <keith.bugeja@um.edu.mt>")]
#[command(version = "0.1.0")]
#[command(about = "bgpipe: a composable BGP message pipeline")]
pub struct GlobalOpts {
    /// Log level (trace, debug, info, warn, error), overridable via RUST_LOG
    #[arg(long, default_value = "info")]
    pub log: String,

    /// Auto-inserted stdin/stdout policy
    #[arg(long, value_enum, default_value = "auto")]
    pub stdio: StdioMode,

    /// Reverse the stage list and swap L/R assignments
    #[arg(short = 'R', long)]
    pub reverse: bool,

    /// Suppress auto-inserted stdout
    #[arg(short = 'N', long)]
    pub quiet: bool,

    /// Do not log ingress parse errors, drop silently
    #[arg(short = 'E', long = "no-parse-error")]
    pub no_parse_error: bool,

    /// Ban the 4-byte-ASN capability outright
    #[arg(short = '2', long = "short-asn")]
    pub short_asn: bool,

    /// Comma-separated list of event names to trace at pre-phase, lowest order
    #[arg(long, value_delimiter = ',')]
    pub events: Vec<String>,

    /// Stage argv: `STAGE [STAGE-OPTS] [STAGE-ARGS] [--] STAGE …`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StdioMode {
    None,
    Auto,
    In,
    Out,
}

/// A single stage's parsed argv slice: a `--flag value` / `--flag` map plus
/// whatever positional arguments remained.
#[derive(Debug, Clone, Default)]
pub struct StageConfig {
    pub command: String,
    pub flags: HashMap<String, String>,
    pub positionals: Vec<String>,
}

impl StageConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            flags: HashMap::new(),
            positionals: Vec::new(),
        }
    }
}
