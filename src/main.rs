//! evreplay console
//!
//! Headless operator console: reads commands from stdin and prints status
//! changes and history published by the session.

use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use evreplay::logging::{get_log_dir, init_logging};
use evreplay::session::COMMAND_HELP;
use evreplay::{create_session_channels, Config, Session, SessionCommand, SessionEvent};

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    port: Option<u16>,
    record_file: Option<PathBuf>,
    response_file: Option<PathBuf>,
    help: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "--config" => parsed.config = Some(PathBuf::from(value_of(&mut args, &arg)?)),
            "--port" => {
                let value = value_of(&mut args, &arg)?;
                parsed.port = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid port: {}", value))?,
                );
            }
            "--record-file" => parsed.record_file = Some(PathBuf::from(value_of(&mut args, &arg)?)),
            "--response-file" => {
                parsed.response_file = Some(PathBuf::from(value_of(&mut args, &arg)?))
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }
    Ok(parsed)
}

fn value_of(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .with_context(|| format!("{} needs a value", flag))
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }

    let _log_guard = init_logging()?;
    info!("evreplay console starting...");
    if let Ok(log_dir) = get_log_dir() {
        info!("Log directory: {:?}", log_dir);
    }

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(port) = args.port {
        config.transport.port = port;
    }
    info!("Configuration loaded from {:?}", config.config_path().ok());

    let runtime = Arc::new(tokio::runtime::Runtime::new()?);
    let (cmd_tx, cmd_rx, events_tx, events_rx) = create_session_channels();

    if let Some(path) = args.record_file {
        cmd_tx.try_send(SessionCommand::SelectRecordFile(path))?;
    }
    if let Some(path) = args.response_file {
        cmd_tx.try_send(SessionCommand::SelectResponseFile(Some(path)))?;
    }

    let mut session = Session::new(config, cmd_rx, events_tx);
    let session_runtime = runtime.clone();
    let session_handle = std::thread::spawn(move || {
        session_runtime.block_on(async move { session.run().await });
    });

    // Ctrl+C sends the same shutdown as `quit`
    let ctrl_c_tx = cmd_tx.clone();
    let ctrl_c_runtime = runtime.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let tx = ctrl_c_tx.clone();
        ctrl_c_runtime.spawn(async move {
            let _ = tx.send(SessionCommand::Shutdown).await;
        });
    })?;

    spawn_stdin_reader(cmd_tx)?;

    println!("Type a command, or `help`:");
    runtime.block_on(print_events(events_rx));

    if session_handle.join().is_err() {
        error!("Session thread panicked");
    }
    info!("Shutdown complete");
    Ok(())
}

/// Forward stdin lines as commands. EOF shuts the session down.
fn spawn_stdin_reader(cmd_tx: mpsc::Sender<SessionCommand>) -> Result<()> {
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.trim() == "help" {
                    println!("{}", COMMAND_HELP);
                    continue;
                }
                match line.parse::<SessionCommand>() {
                    Ok(command) => {
                        let shutdown = command == SessionCommand::Shutdown;
                        if cmd_tx.blocking_send(command).is_err() || shutdown {
                            return;
                        }
                    }
                    Err(e) => eprintln!("{} (try `help`)", e),
                }
            }
            let _ = cmd_tx.blocking_send(SessionCommand::Shutdown);
        })
        .context("Failed to spawn stdin reader")?;
    Ok(())
}

/// Print session events until the session drops its senders
async fn print_events(mut events_rx: broadcast::Receiver<SessionEvent>) {
    let mut last_status = String::new();
    loop {
        match events_rx.recv().await {
            Ok(SessionEvent::Status(status)) => {
                let line = status.to_string();
                if line != last_status {
                    println!("[status] {}", line);
                    last_status = line;
                }
            }
            Ok(SessionEvent::Snapshot(status)) => match serde_json::to_string_pretty(&status) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to format status: {}", e),
            },
            Ok(SessionEvent::History(lines)) => {
                for line in lines {
                    println!("{}", line);
                }
            }
            Ok(SessionEvent::Error(message)) => eprintln!("error: {}", message),
            Err(RecvError::Lagged(missed)) => warn!("Console missed {} session updates", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_help() {
    println!("evreplay - record and replay device input events");
    println!();
    println!("USAGE:");
    println!("    evreplay [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>         Load configuration from PATH");
    println!("    --port <N>              Device service port (overrides config)");
    println!("    --record-file <PATH>    Select the trace file on startup");
    println!("    --response-file <PATH>  Select the response file on startup");
    println!("    -h, --help              Print this help message");
    println!();
    println!("COMMANDS:");
    println!("{}", COMMAND_HELP);
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG            Set log level (e.g., debug, info, warn)");
    println!("    EVREPLAY_LOG_PATH   Override the log directory");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args() {
        let parsed = args(&["--port", "4000", "--record-file", "/tmp/a.trace"]).unwrap();
        assert_eq!(parsed.port, Some(4000));
        assert_eq!(parsed.record_file, Some(PathBuf::from("/tmp/a.trace")));
        assert!(parsed.config.is_none());
        assert!(!parsed.help);

        assert!(args(&["-h"]).unwrap().help);
        assert!(args(&["--port"]).is_err());
        assert!(args(&["--port", "http"]).is_err());
        assert!(args(&["--verbose"]).is_err());
    }
}
