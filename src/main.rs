//! `bgpipe`: a composable BGP message pipeline.
//!
//! Wires together a CLI parse (`config::GlobalOpts`), the controller
//! (`controller::Bgpipe`) that resolves argv into a running pipeline, and a
//! process exit code: `0` on clean shutdown, `1` on any fatal error.

mod bgp;
mod config;
mod controller;
mod core;
mod extio;
mod logging;
mod stage;

use clap::Parser;

use config::GlobalOpts;
use controller::Bgpipe;

#[tokio::main]
async fn main() {
    let opts = GlobalOpts::parse();
    logging::init_logging(&opts.log);

    tracing::info!(stages = ?opts.stages, "bgpipe starting");

    let bgpipe = match Bgpipe::build(&opts).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to build pipeline");
            std::process::exit(1);
        }
    };

    match bgpipe.run().await {
        Ok(()) => {
            tracing::info!("bgpipe: clean shutdown");
        }
        Err(e) => {
            tracing::error!(error = %e, "bgpipe: fatal error");
            std::process::exit(1);
        }
    }
}
