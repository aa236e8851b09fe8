//! echoline: a line-oriented TCP echo client and server
//!
//! The server accepts connections one at a time, reads newline-delimited
//! messages, and echoes each first line back with a `:OK` acknowledgment.
//! The client connects, multiplexes standard input and the socket with a
//! bounded poll, and forwards each typed line.
//!
//! Application data flows on stdout; all diagnostics go to stderr.

mod buffer;
mod client;
mod config;
mod net;
mod server;

use config::{CliCommand, Config};
use server::ServerOptions;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Setup failure (resolution, connect, bind, listen): sysexits EX_UNAVAILABLE.
const EXIT_UNAVAILABLE: u8 = 69;
/// Configuration file failure: sysexits EX_CONFIG.
const EXIT_CONFIG: u8 = 78;

fn main() -> ExitCode {
    // Load configuration; clap handles usage errors itself.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // Initialize logging on stderr so diagnostics never mix with the
    // client's display of received data on stdout.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.command.clone() {
        CliCommand::Serve { port, .. } => run_server(&port, &config),
        CliCommand::Connect { host, port } => run_client(&host, &port, &config),
    }
}

/// Resolve, bind, listen, and accept forever.
fn run_server(port: &str, config: &Config) -> ExitCode {
    let resolved = match net::resolve(None, port) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!(error = %e, "server setup failed");
            return ExitCode::from(EXIT_UNAVAILABLE);
        }
    };
    info!(port = %resolved.numeric_port(), "resolved listen address");

    let listener = match net::listen(&resolved) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "server setup failed");
            return ExitCode::from(EXIT_UNAVAILABLE);
        }
    };

    server::accept_loop(
        listener,
        ServerOptions {
            buffer_size: config.buffer_size,
            concurrent: config.concurrent,
        },
    );

    // The accept loop only returns by process termination.
    ExitCode::SUCCESS
}

/// Resolve, connect, and run the send/receive loop.
///
/// A per-connection I/O error ends the loop but still exits with success,
/// matching normal termination on EOF; only setup failures are fatal.
fn run_client(host: &str, port: &str, config: &Config) -> ExitCode {
    let resolved = match net::resolve(Some(host), port) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!(error = %e, "client setup failed");
            return ExitCode::from(EXIT_UNAVAILABLE);
        }
    };
    info!(
        addr = %resolved.numeric_host(),
        port = %resolved.numeric_port(),
        "resolved server address"
    );

    let stream = match net::connect(&resolved) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "client setup failed");
            return ExitCode::from(EXIT_UNAVAILABLE);
        }
    };

    // The stream is owned by the loop and closed when it returns.
    if let Err(e) = client::run(stream, config.buffer_size) {
        error!(error = %e, "client failed");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
