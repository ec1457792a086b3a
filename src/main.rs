// Entrypoint for the `nimbu` command.
// - Parses arguments, sets up logging and hands over to `cli::run`.
// - Every failure ends up here: one `ERROR:` line, an optional hint, exit 1.

use clap::Parser;
use crossterm::style::Stylize;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use nimbu_toolbelt::cli::{self, Cli};
use nimbu_toolbelt::error::{ApiError, ToolbeltError};

fn init_logging(debug: bool) {
    let default = if debug {
        "nimbu_toolbelt=debug"
    } else {
        "nimbu_toolbelt=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// A follow-up command for errors the user can fix themselves.
fn hint(err: &anyhow::Error) -> Option<&'static str> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<ToolbeltError>() {
            return e.hint();
        }
        match cause.downcast_ref::<ApiError>() {
            Some(ApiError::Unauthorized) => Some("Run \"nimbu login\" to start a session."),
            _ => None,
        }
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", "ERROR:".red().bold(), err);
            if let Some(hint) = hint(&err) {
                eprintln!("{hint}");
            }
            ExitCode::FAILURE
        }
    }
}
