//! Record/replay coordination between the operator, the trace files and the
//! device-side service

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::history::HistoryLog;
use super::state::ControllerState;
use super::{SessionEvent, SessionStatus};
use crate::config::{Config, ReplayConfig};
use crate::data::Event;
use crate::error::{FileError, FileRole, SessionError};
use crate::protocol::{Command, Message, ReplayProgress, ServiceState, ServiceStateKind};
use crate::response::ResponseFile;
use crate::trace::{PreloadLimits, ReplayFeed, TraceFile};
use crate::transport::{MessageSink, TransportListener};

/// A chunk the device asked for, taken once the state lock is released
struct FillRequest {
    feed: ReplayFeed,
    sn: i64,
}

struct Inner {
    state: ControllerState,
    /// Last service state reported by the device; `None` until the first
    /// report after each (re)connect
    mirrored: Option<ServiceState>,
    trace: TraceFile,
    response: ResponseFile,
    /// Close the trace writer once the current batch is handled
    close_trace_pending: bool,
    close_response_pending: bool,
    prev_running_sn: i64,
    prev_buffer_index: i32,
    replay_stalled: bool,
    published: Option<SessionStatus>,
}

/// Mirrors the device's service state and drives record/replay.
///
/// Registered as a [`TransportListener`]; operator calls come from any
/// thread and are serialized with inbound batches by one lock.
pub struct SessionController {
    sink: Arc<dyn MessageSink>,
    replay: ReplayConfig,
    history: HistoryLog,
    events_tx: broadcast::Sender<SessionEvent>,
    inner: Mutex<Inner>,
}

impl SessionController {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        config: &Config,
        events_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let limits = PreloadLimits::from(&config.replay);
        Self {
            sink,
            replay: config.replay.clone(),
            history: HistoryLog::new(config.history.text_limit),
            events_tx,
            inner: Mutex::new(Inner {
                state: ControllerState::Initial,
                mirrored: None,
                trace: TraceFile::new(limits),
                response: ResponseFile::new(),
                close_trace_pending: false,
                close_response_pending: false,
                prev_running_sn: -1,
                prev_buffer_index: -1,
                replay_stalled: false,
                published: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    pub fn status(&self) -> SessionStatus {
        Self::snapshot(&self.lock())
    }

    fn snapshot(inner: &Inner) -> SessionStatus {
        SessionStatus {
            controller_state: inner.state,
            service_state: inner.mirrored,
            record_file: inner.trace.path().map(Path::to_path_buf),
            response_file: inner.response.path().map(Path::to_path_buf),
            recording: inner.trace.is_writing(),
            replaying: inner.trace.is_reading(),
            replay_stalled: inner.replay_stalled,
        }
    }

    /// Broadcast the status if it changed since the last broadcast
    fn publish(&self, inner: &mut Inner) {
        let status = Self::snapshot(inner);
        if inner.published.as_ref() == Some(&status) {
            return;
        }
        inner.published = Some(status.clone());
        let _ = self.events_tx.send(SessionEvent::Status(status));
    }

    /// Select the trace file, creating it if missing
    pub fn select_record_file(&self, path: impl Into<PathBuf>) -> Result<(), SessionError> {
        let path = path.into();
        ensure_accessible(&path)?;

        let mut inner = self.lock();
        self.history.info(format!("Record file: {}", path.display()));
        inner.trace.set_path(Some(path));
        self.publish(&mut inner);
        Ok(())
    }

    /// Select the response file, creating it if missing. `None` disables it.
    pub fn select_response_file(&self, path: Option<PathBuf>) -> Result<(), SessionError> {
        if let Some(path) = &path {
            ensure_accessible(path)?;
        }

        let mut inner = self.lock();
        match &path {
            Some(path) => self.history.info(format!("Response file: {}", path.display())),
            None => self.history.info("Response file disabled"),
        }
        inner.response.set_path(path);
        self.publish(&mut inner);
        Ok(())
    }

    /// Start recording from idle, or stop an active recording
    pub fn toggle_record(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        require_connected(&inner, "toggle recording")?;

        match inner.mirrored.map(|s| s.kind()) {
            Some(ServiceStateKind::Idle) => self.record_on(&mut inner)?,
            Some(ServiceStateKind::Recording) => self.record_off(&mut inner),
            other => self.history.warning(format!(
                "Cannot toggle recording while service is {}",
                describe(other)
            )),
        }
        self.publish(&mut inner);
        Ok(())
    }

    /// Start replaying from idle, or stop an active replay
    pub fn toggle_replay(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        require_connected(&inner, "toggle replay")?;

        match inner.mirrored.map(|s| s.kind()) {
            Some(ServiceStateKind::Idle) => self.replay_on(&mut inner)?,
            Some(ServiceStateKind::Replaying) => self.replay_off(&mut inner),
            other => self.history.warning(format!(
                "Cannot toggle replay while service is {}",
                describe(other)
            )),
        }
        self.publish(&mut inner);
        Ok(())
    }

    pub fn turn_on_record(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        self.record_on(&mut inner)?;
        self.publish(&mut inner);
        Ok(())
    }

    /// Ask the device to stop recording. The trace is closed once the device
    /// reports idle, so events still in flight are kept.
    pub fn turn_off_record(&self) {
        let mut inner = self.lock();
        self.record_off(&mut inner);
        self.publish(&mut inner);
    }

    pub fn turn_on_replay(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        self.replay_on(&mut inner)?;
        self.publish(&mut inner);
        Ok(())
    }

    pub fn turn_off_replay(&self) {
        let mut inner = self.lock();
        self.replay_off(&mut inner);
        self.publish(&mut inner);
    }

    /// Tell a replaying device to stop waiting for the app. Returns whether
    /// the command was sent.
    pub fn skip_waiting_in_replay(&self) -> bool {
        let inner = self.lock();
        let replaying = inner.state.accepts_commands()
            && matches!(inner.mirrored, Some(ServiceState::Replaying(_)));
        if !replaying {
            debug!("Skip waiting ignored while {}", inner.state);
            return false;
        }

        self.sink.send(Command::SkipWaitingInReplay.into());
        self.history.command("Skip waiting");
        true
    }

    pub fn clear_history(&self) {
        self.history.clear();
    }

    /// Close any open trace or response file
    pub fn close_files(&self) {
        let mut inner = self.lock();
        if inner.trace.is_writing() || inner.trace.is_reading() {
            warn!("Closing files while the device may still be active");
        }
        inner.close_trace_pending = false;
        inner.close_response_pending = false;
        self.close_trace(&mut inner);
        self.close_response(&mut inner);
        self.publish(&mut inner);
    }

    fn record_on(&self, inner: &mut Inner) -> Result<(), SessionError> {
        if inner.trace.path().is_none() {
            return Err(SessionError::NoFileSelected(FileRole::Record));
        }
        inner.trace.open_writing()?;

        inner.state = ControllerState::WaitingForStateChange;
        self.sink.send(Command::RecordingOn.into());
        self.history.command("Record ON");
        Ok(())
    }

    fn record_off(&self, inner: &mut Inner) {
        inner.state = ControllerState::WaitingForStateChange;
        self.sink.send(Command::RecordingOff.into());
        self.history.command("Record OFF");
    }

    fn replay_on(&self, inner: &mut Inner) -> Result<(), SessionError> {
        if inner.trace.path().is_none() {
            return Err(SessionError::NoFileSelected(FileRole::Record));
        }

        inner.prev_running_sn = -1;
        inner.prev_buffer_index = -1;
        inner.replay_stalled = false;

        inner.trace.set_limits(PreloadLimits::from(&self.replay));
        inner.trace.open_reading()?;

        if inner.response.path().is_some() {
            if let Err(e) = inner.response.open_writing() {
                self.close_trace(inner);
                return Err(e.into());
            }
        }

        inner.state = ControllerState::WaitingForStateChange;
        self.sink.send(
            Command::ReplayingOn {
                min_preload_size: self.replay.minimum_preload_size,
                max_sleep_ms: self.replay.maximum_sleep_ms,
            }
            .into(),
        );
        self.history.command("Replay ON");
        Ok(())
    }

    /// The reader is closed right away: nothing more is written to it
    fn replay_off(&self, inner: &mut Inner) {
        inner.state = ControllerState::WaitingForStateChange;
        self.close_trace(inner);
        self.sink.send(Command::ReplayingOff.into());
        self.history.command("Replay OFF");
    }

    fn close_trace(&self, inner: &mut Inner) {
        let saving = inner.trace.is_writing();
        match inner.trace.close() {
            Ok(()) if saving => self.history.info("Record file saved"),
            Ok(()) => {}
            Err(e) => {
                error!("Failed to close record file: {}", e);
                self.history.warning(format!("Failed to close record file: {}", e));
            }
        }
    }

    fn close_response(&self, inner: &mut Inner) {
        match inner.response.close() {
            Ok(Some(report)) => self.history.info(format!(
                "Response report saved: {} events, {} activities",
                report.trace.len(),
                report.activities.len()
            )),
            Ok(None) => {}
            Err(e) => {
                error!("Failed to close response file: {}", e);
                self.history.warning(format!("Failed to close response file: {}", e));
            }
        }
    }

    /// Chunks are taken with the state lock released, since a chunk that is
    /// not preloaded yet blocks until it is read
    fn handle_batch(&self, messages: &[Message]) {
        for message in messages {
            let fill = {
                let mut inner = self.lock();
                match message {
                    Message::Event(event) => {
                        self.store_event(&mut inner, event);
                        None
                    }
                    Message::ServiceState(state) => self.on_service_state(&mut inner, *state),
                    Message::Command(command) => {
                        debug!("Ignoring command from device: {:?}", command);
                        None
                    }
                }
            };
            if let Some(fill) = fill {
                self.fill_replay_buffer(fill);
            }
        }

        let mut inner = self.lock();
        if inner.close_trace_pending {
            inner.close_trace_pending = false;
            self.close_trace(&mut inner);
        }
        if inner.close_response_pending {
            inner.close_response_pending = false;
            self.close_response(&mut inner);
        }
        self.publish(&mut inner);
    }

    fn store_event(&self, inner: &mut Inner, event: &Event) {
        if let Err(e) = inner.trace.write_event(event) {
            error!("Failed to write record file: {}", e);
            self.history.warning(format!("Failed to write record file: {}", e));
        }
        if let Err(e) = inner.response.write_event(event) {
            error!("Failed to write response file: {}", e);
            self.history.warning(format!("Failed to write response file: {}", e));
        }
    }

    fn on_service_state(&self, inner: &mut Inner, new: ServiceState) -> Option<FillRequest> {
        let old = inner.mirrored.map(|s| s.kind());
        inner.mirrored = Some(new);

        let forced_off = old.is_none() && self.recover_dirty_launch(inner, new);

        if old != Some(new.kind()) {
            self.on_service_state_changed(inner, old, new.kind());
        }

        // A forced "off" stays pending until the next report
        if !forced_off {
            inner.state = match new.kind() {
                ServiceStateKind::PreparingToReplay => ControllerState::WaitingForStateChange,
                _ => ControllerState::Connected,
            };
        }

        match new {
            ServiceState::Replaying(progress) => self.on_replaying(inner, progress),
            _ => None,
        }
    }

    /// Turn off a session the device is running without a matching local
    /// session (left over from an earlier or crashed controller)
    fn recover_dirty_launch(&self, inner: &mut Inner, state: ServiceState) -> bool {
        match state.kind() {
            ServiceStateKind::Recording if !inner.trace.is_writing() => {
                warn!("Device already recording, turning it off");
                self.record_off(inner);
                self.history.warning("Device already recording, turned OFF by force");
                true
            }
            ServiceStateKind::PreparingToReplay | ServiceStateKind::Replaying
                if !inner.trace.is_reading() =>
            {
                warn!("Device already replaying, turning it off");
                self.replay_off(inner);
                self.history.warning("Device already replaying, turned OFF by force");
                true
            }
            _ => false,
        }
    }

    fn on_service_state_changed(
        &self,
        inner: &mut Inner,
        old: Option<ServiceStateKind>,
        new: ServiceStateKind,
    ) {
        info!("Service state: {} -> {}", describe(old), new);

        if new == ServiceStateKind::Idle {
            if inner.trace.is_writing() {
                inner.close_trace_pending = true;
            }
            if inner.trace.is_reading() {
                self.close_trace(inner);
            }
            if inner.response.is_open() {
                inner.close_response_pending = true;
            }
        }

        self.history.info(format!("Service: {}", new));
    }

    /// Track replay progress; returns the chunk request if the device needs
    /// one that has not been sent
    fn on_replaying(&self, inner: &mut Inner, progress: ReplayProgress) -> Option<FillRequest> {
        let feed = inner.trace.replay_feed()?;

        if progress.present_buffer_size != 0 {
            self.history.info(format!(
                "Replay: {}/{} (SN: {})",
                progress.present_buffer_index, progress.present_buffer_size, progress.running_sn
            ));
            inner.replay_stalled = inner.prev_running_sn == progress.running_sn
                && inner.prev_buffer_index == progress.present_buffer_index;
            inner.prev_running_sn = progress.running_sn;
            inner.prev_buffer_index = progress.present_buffer_index;
        }

        if progress.required_sn <= feed.last_sent_sn() {
            return None;
        }
        Some(FillRequest {
            feed,
            sn: progress.required_sn,
        })
    }

    fn fill_replay_buffer(&self, fill: FillRequest) {
        let Some(chunk) = fill.feed.require_replay_buffer(fill.sn) else {
            return;
        };
        if fill.feed.is_closed() {
            debug!("Replay closed while loading SN {}, chunk dropped", fill.sn);
            return;
        }

        let num_events = u32::try_from(chunk.len()).unwrap_or(u32::MAX);
        debug!(
            "Filling replay buffer SN {}: {} events, more: {}",
            fill.sn,
            num_events,
            chunk.has_more()
        );
        self.history
            .command(format!("{} events sent (SN: {})", num_events, fill.sn));

        self.sink.send(
            Command::FillReplayBuffer {
                sn: fill.sn,
                num_events,
                has_more: chunk.has_more(),
            }
            .into(),
        );
        for event in chunk.events {
            self.sink.send(event.into());
        }
    }
}

impl TransportListener for SessionController {
    fn on_message_batch(&self, messages: &[Message]) {
        self.handle_batch(messages);
    }

    /// Keep the mirrored state fresh when nothing else is queued
    fn before_routine(&self) {
        if self.sink.pending_count() == 0 {
            self.sink.send(Command::RequestState.into());
        }
    }

    fn on_connect(&self) {
        let mut inner = self.lock();
        inner.state = ControllerState::Connected;
        info!("Device found");
        self.history.info("Device found, waiting for service...");
        self.publish(&mut inner);
    }

    fn on_disconnect(&self) {
        let mut inner = self.lock();
        inner.state = ControllerState::Disconnected;
        inner.mirrored = None;
        inner.replay_stalled = false;
        warn!("Device not reachable");
        self.history.warning("Device not found, waiting for device...");
        self.publish(&mut inner);
    }
}

fn require_connected(inner: &Inner, action: &'static str) -> Result<(), SessionError> {
    if inner.state.accepts_commands() {
        Ok(())
    } else {
        Err(SessionError::InvalidState {
            action,
            state: inner.state,
        })
    }
}

fn describe(kind: Option<ServiceStateKind>) -> String {
    match kind {
        Some(kind) => kind.to_string(),
        None => "unknown".to_string(),
    }
}

/// Create the file if missing and check it can be read and written
fn ensure_accessible(path: &Path) -> Result<(), FileError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map(|_| ())
        .map_err(|e| FileError::from_io(path, e))
}
