/*!
 * convoy - parallel rsync wrapper
 *
 * Thin shell around the library: parse arguments, wire signals to the
 * cancellation token, run the pipeline, and translate the summary into an
 * exit code. All user-facing output during the run belongs to the monitor.
 */

use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use convoy::cli::Cli;
use convoy::core::cancel::{self, CancelToken};
use convoy::{core, logging, ConvoyError};

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("convoy: {err:#}");
            process::exit(exit_code_for(&err));
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = cli.into_config().context("invalid command line")?;
    let source = config.source.display().to_string();

    let token = CancelToken::new();
    if let Err(err) = cancel::install_signal_handlers(&token) {
        // a run without ctrl-c handling still works; children just outlive us
        tracing::warn!("{err}; continuing without signal handling");
    }

    let summary = core::run_with_token(config, token)
        .with_context(|| format!("could not replicate {source}"))?;
    Ok(summary.exit_code())
}

/// The taxonomy code of the underlying error, regardless of how much
/// context has been layered on top of it.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ConvoyError>()
        .map_or(70, ConvoyError::exit_code)
}
