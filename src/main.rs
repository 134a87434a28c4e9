mod backend;
mod cli;
mod client;
mod config;
mod error;
mod geometry;
mod metrics;
mod model;
mod orchestrator;
#[cfg(test)]
mod test_support;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so stdout stays clean for results. `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: u8, silent: bool) {
    let default = match (silent, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, _) => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose > 1)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    init_tracing(args.verbose, is_silent);

    match cli::run(args).await {
        Ok(()) => {
            // Exit explicitly so lingering output-drain tasks cannot hold the process open.
            std::process::exit(0);
        }
        Err(e) => {
            if is_silent {
                println!("{:#}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
