//! Session context - owns the transport and the controller and runs the
//! operator command loop

mod controller;
mod history;
mod state;

pub use controller::SessionController;
pub use history::{HistoryKind, HistoryLine, HistoryLog};
pub use state::ControllerState;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CommandParseError, SessionError};
use crate::protocol::ServiceState;
use crate::transport::{run_blocking, Transport};

/// Commands accepted by the session loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    SelectRecordFile(PathBuf),
    /// `None` disables the response report
    SelectResponseFile(Option<PathBuf>),
    ToggleRecord,
    ToggleReplay,
    SkipWaiting,
    ClearHistory,
    /// Publish a full status snapshot
    Status,
    /// Publish the whole history
    History,
    Shutdown,
}

/// Console syntax, one command per line
pub const COMMAND_HELP: &str = "\
    file <path>          select the record/replay trace file
    response <path|off>  select or disable the response file
    record               start or stop recording
    replay               start or stop replaying
    skip                 skip waiting in replay
    clear                clear the history
    status               show the session status
    history              show the whole history
    quit                 shut down";

impl FromStr for SessionCommand {
    type Err = CommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word {
            "" => Err(CommandParseError::Empty),
            "file" | "record-file" => {
                if rest.is_empty() {
                    Err(CommandParseError::MissingPath("file"))
                } else {
                    Ok(SessionCommand::SelectRecordFile(PathBuf::from(rest)))
                }
            }
            "response" | "response-file" => match rest {
                "" => Err(CommandParseError::MissingPath("response")),
                "off" | "none" => Ok(SessionCommand::SelectResponseFile(None)),
                path => Ok(SessionCommand::SelectResponseFile(Some(PathBuf::from(path)))),
            },
            "record" => Ok(SessionCommand::ToggleRecord),
            "replay" => Ok(SessionCommand::ToggleReplay),
            "skip" => Ok(SessionCommand::SkipWaiting),
            "clear" => Ok(SessionCommand::ClearHistory),
            "status" => Ok(SessionCommand::Status),
            "history" => Ok(SessionCommand::History),
            "quit" | "exit" | "shutdown" => Ok(SessionCommand::Shutdown),
            other => Err(CommandParseError::Unknown(other.to_string())),
        }
    }
}

/// Snapshot of what the operator sees
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub controller_state: ControllerState,
    pub service_state: Option<ServiceState>,
    pub record_file: Option<PathBuf>,
    pub response_file: Option<PathBuf>,
    /// The trace file is open for recording
    pub recording: bool,
    /// The trace file is open for replay
    pub replaying: bool,
    /// The device reported the same replay position twice in a row
    pub replay_stalled: bool,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "controller {}, service ", self.controller_state)?;
        match self.service_state {
            Some(state) => write!(f, "{}", state.kind())?,
            None => write!(f, "unknown")?,
        }
        if self.recording {
            write!(f, ", recording")?;
        }
        if self.replaying {
            write!(f, ", replaying")?;
        }
        if self.replay_stalled {
            write!(f, " (stalled, skip waiting?)")?;
        }
        Ok(())
    }
}

/// Updates published to renderers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The status changed
    Status(SessionStatus),
    /// Status requested explicitly
    Snapshot(SessionStatus),
    /// History lines, oldest first
    History(Vec<HistoryLine>),
    /// A command failed
    Error(String),
}

pub fn create_session_channels() -> (
    mpsc::Sender<SessionCommand>,
    mpsc::Receiver<SessionCommand>,
    broadcast::Sender<SessionEvent>,
    broadcast::Receiver<SessionEvent>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (events_tx, events_rx) = broadcast::channel(256);
    (cmd_tx, cmd_rx, events_tx, events_rx)
}

/// One controller session: a client transport to the device and the
/// controller listening on it
pub struct Session {
    id: Uuid,
    config: Config,
    transport: Arc<Transport>,
    controller: Arc<SessionController>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub fn new(
        config: Config,
        cmd_rx: mpsc::Receiver<SessionCommand>,
        events_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let transport = Arc::new(Transport::client(&config.transport));
        let controller = Arc::new(SessionController::new(
            transport.clone(),
            &config,
            events_tx.clone(),
        ));
        transport.add_listener(&controller);

        Self {
            id: Uuid::new_v4(),
            config,
            transport,
            controller,
            cmd_rx,
            events_tx,
        }
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub async fn start(&self) {
        info!(
            "Session {} polling {}:{} every {}ms",
            self.id,
            self.config.transport.host,
            self.config.transport.port,
            self.config.transport.poll_interval_ms
        );
        self.transport.start().await;
    }

    /// Stop the transport, then close any open file
    pub async fn shutdown(&self) {
        info!("Session {} shutting down", self.id);
        self.transport.stop().await;
        self.controller.close_files();
    }

    /// Start the transport and handle commands until `Shutdown` or until
    /// every command sender is dropped
    pub async fn run(&mut self) {
        let span = info_span!("session", id = %self.id);
        self.run_loop().instrument(span).await;
    }

    async fn run_loop(&mut self) {
        self.start().await;

        let tick = self.config.transport.poll_interval().max(Duration::from_millis(10));
        let mut history_timer = tokio::time::interval(tick);
        let mut history_mark = 0;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("Command channel closed");
                        break;
                    };
                    if cmd == SessionCommand::Shutdown {
                        info!("Shutdown command received");
                        break;
                    }
                    if let Err(e) = run_blocking(|| self.execute(cmd)) {
                        warn!("Command failed: {}", e);
                        self.controller.history().warning(e.to_string());
                        let _ = self.events_tx.send(SessionEvent::Error(e.to_string()));
                    }
                }
                _ = history_timer.tick() => self.flush_history(&mut history_mark),
            }
        }

        self.shutdown().await;
        self.flush_history(&mut history_mark);
    }

    /// Apply one operator command. `Shutdown` is handled by the run loop and
    /// is a no-op here.
    pub fn execute(&self, command: SessionCommand) -> Result<(), SessionError> {
        match command {
            SessionCommand::SelectRecordFile(path) => self.controller.select_record_file(path)?,
            SessionCommand::SelectResponseFile(path) => self.controller.select_response_file(path)?,
            SessionCommand::ToggleRecord => self.controller.toggle_record()?,
            SessionCommand::ToggleReplay => self.controller.toggle_replay()?,
            SessionCommand::SkipWaiting => {
                if !self.controller.skip_waiting_in_replay() {
                    self.controller
                        .history()
                        .warning("Skip waiting is only available while replaying");
                }
            }
            SessionCommand::ClearHistory => self.controller.clear_history(),
            SessionCommand::Status => {
                let _ = self
                    .events_tx
                    .send(SessionEvent::Snapshot(self.controller.status()));
            }
            SessionCommand::History => {
                let _ = self
                    .events_tx
                    .send(SessionEvent::History(self.controller.history().lines()));
            }
            SessionCommand::Shutdown => {}
        }
        Ok(())
    }

    /// Publish history lines added since `mark`
    fn flush_history(&self, mark: &mut u64) {
        let history = self.controller.history();
        if !history.take_dirty() {
            return;
        }
        let lines = history.lines_since(*mark);
        if let Some(last) = lines.last() {
            *mark = last.seq + 1;
            let _ = self.events_tx.send(SessionEvent::History(lines));
        }
    }
}
