//! `hts` — server half of httptunnel.
//!
//! Parses arguments, wires up logging/signals/PID file, then loops:
//! accept a peer, bridge its tunnel to the configured downstream, repeat.

use std::fs::File;
use std::io::Write;
use std::process::ExitCode;

use httunnel::bridge::{run_session, SessionEnd};
use httunnel::cli::{self, Action, Config, Destination};
use httunnel::logging::{Logger, StderrLogger};
use httunnel::platform::{self, Downstream};
use httunnel::signals::SelfPipe;
use httunnel::tunnel::{Options, TunnelEndpoint};
use httunnel::{log_debug, log_error, log_notice};

fn main() -> ExitCode {
    let mut argv = std::env::args();
    let program = argv.next().unwrap_or_else(|| cli::PROGRAM_NAME.to_string());
    let args: Vec<String> = argv.collect();

    let config = match cli::parse(&program, &args) {
        Ok(Action::Run(config)) => config,
        Ok(Action::PrintedAndExit0) => return ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{program}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_file = match &config.log_file {
        Some(path) => match File::create(path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("{program}: couldn't open file {path} for writing: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };
    let logger = StderrLogger::new(config.log_level, log_file);

    log_notice!(logger, "hts ({}) {} started with arguments:", cli::PROGRAM_NAME, cli::VERSION);
    log_notice!(logger, "  port = {}", config.listen_port);
    log_notice!(logger, "  content_length = {}", config.content_length);
    log_notice!(logger, "  destination = {:?}", config.destination);
    log_notice!(logger, "  pid_file = {:?}", config.pid_file);

    if let Some(path) = &config.pid_file {
        write_pid_file(path, &logger);
    }

    let shutdown = match SelfPipe::install() {
        Ok(pipe) => pipe,
        Err(e) => {
            log_error!(logger, "couldn't install signal handlers: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&config, &logger, &shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}

fn write_pid_file(path: &str, logger: &dyn Logger) {
    match File::create(path) {
        Ok(mut f) => {
            if let Err(e) = writeln!(f, "{}", std::process::id()) {
                log_error!(logger, "error writing pid file: {e}");
            }
        }
        Err(e) => {
            log_error!(logger, "couldn't open pid file {path}: {e}");
        }
    }
}

/// The accept/bridge/close outer loop. Returns `Err` only for a
/// process-fatal condition (unrecoverable downstream device failure, or a
/// listener that can no longer accept); a peer-level protocol error or a
/// single bad session never reaches here — it's logged and the loop
/// continues with a fresh `accept()`.
fn run(config: &Config, logger: &dyn Logger, shutdown: &SelfPipe) -> Result<(), ExitCode> {
    let listener = platform::listen_tcp(config.listen_port).map_err(|e| {
        log_error!(logger, "couldn't bind port {}: {e}", config.listen_port);
        ExitCode::FAILURE
    })?;

    let options = Options {
        content_length: config.content_length,
        strict_content_length: config.strict_content_length,
        keep_alive: config.keep_alive,
        max_connection_age: config.max_connection_age,
    };
    let mut tunnel = TunnelEndpoint::new(listener, options);

    loop {
        if shutdown.shutdown_requested() {
            log_notice!(logger, "shutdown requested, exiting");
            break;
        }

        log_debug!(logger, "waiting for tunnel connection");
        if let Err(e) = tunnel.accept() {
            log_notice!(logger, "couldn't accept connection: {e}");
            continue;
        }
        log_notice!(logger, "peer connected");

        let mut downstream = match open_downstream(&config.destination) {
            Ok(d) => d,
            Err(e) => {
                log_error!(logger, "couldn't open downstream: {e}");
                return Err(ExitCode::FAILURE);
            }
        };

        match run_session(&mut tunnel, &mut downstream, shutdown, logger) {
            Ok(SessionEnd::DownstreamClosed) => {
                log_debug!(logger, "closing tunnel");
                let _ = tunnel.close();
                log_notice!(logger, "disconnected from peer");
            }
            Ok(SessionEnd::ShutdownRequested) => {
                let _ = tunnel.close();
                log_notice!(logger, "shutdown requested, exiting");
                break;
            }
            Err(e) => {
                log_error!(logger, "session error: {e}");
                let _ = tunnel.close();
            }
        }
    }

    Ok(())
}

fn open_downstream(destination: &Destination) -> std::io::Result<Downstream> {
    match destination {
        Destination::Device(path) => platform::open_device(path).map(Downstream::Device),
        Destination::Forward { host, port } => {
            platform::connect_tcp(host, *port).map(Downstream::Forward)
        }
    }
}
