//! Tracing setup. Writes to stderr so stdout stays free for the `stdout`
//! stage's JSON envelopes.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
