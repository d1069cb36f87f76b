//! Trace file engine
//!
//! A trace file is either being recorded (append, then normalize on close) or
//! replayed (chunked preload keyed by sequence number), never both at once.

mod reader;
mod writer;

pub use reader::{ReplayChunk, ReplayFeed};
pub use writer::normalize_trace;

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::ReplayConfig;
use crate::data::Event;
use crate::error::FileError;
use writer::TraceWriter;

/// Thresholds that end a preload chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadLimits {
    pub min_size: u32,
    pub min_interval_us: i64,
}

impl From<&ReplayConfig> for PreloadLimits {
    fn from(config: &ReplayConfig) -> Self {
        Self {
            min_size: config.minimum_preload_size,
            min_interval_us: config.minimum_preload_interval_us,
        }
    }
}

impl Default for PreloadLimits {
    fn default() -> Self {
        Self::from(&ReplayConfig::default())
    }
}

enum Mode {
    Closed,
    Writing(TraceWriter),
    Reading(ReplayFeed),
}

pub struct TraceFile {
    path: Option<PathBuf>,
    limits: PreloadLimits,
    mode: Mode,
}

impl TraceFile {
    pub fn new(limits: PreloadLimits) -> Self {
        Self {
            path: None,
            limits,
            mode: Mode::Closed,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Select the file used by the next open. An open file is unaffected.
    pub fn set_path(&mut self, path: Option<PathBuf>) {
        self.path = path;
    }

    /// Thresholds applied by the next `open_reading`
    pub fn set_limits(&mut self, limits: PreloadLimits) {
        self.limits = limits;
    }

    pub fn is_writing(&self) -> bool {
        matches!(self.mode, Mode::Writing(_))
    }

    pub fn is_reading(&self) -> bool {
        matches!(self.mode, Mode::Reading(_))
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.mode, Mode::Closed)
    }

    /// Truncate the selected file and start recording into it
    pub fn open_writing(&mut self) -> Result<(), FileError> {
        let path = self.path.clone().ok_or(FileError::NotSelected)?;
        self.close()?;
        self.mode = Mode::Writing(TraceWriter::create(&path)?);
        info!("Recording to {:?}", path);
        Ok(())
    }

    /// Open the selected file for replay and start preloading the first chunk
    pub fn open_reading(&mut self) -> Result<(), FileError> {
        let path = self.path.clone().ok_or(FileError::NotSelected)?;
        self.close()?;
        self.mode = Mode::Reading(ReplayFeed::open(&path, self.limits)?);
        info!("Replaying from {:?}", path);
        Ok(())
    }

    /// Append a recorded event. Ignored unless recording.
    pub fn write_event(&mut self, event: &Event) -> Result<(), FileError> {
        match &mut self.mode {
            Mode::Writing(writer) => writer.write_event(event),
            _ => Ok(()),
        }
    }

    /// Chunk for `required_sn`, or `None` if not replaying or already sent
    pub fn require_replay_buffer(&self, required_sn: i64) -> Option<ReplayChunk> {
        self.replay_feed()
            .and_then(|feed| feed.require_replay_buffer(required_sn))
    }

    /// Handle to the open replay, usable without borrowing this file
    pub fn replay_feed(&self) -> Option<ReplayFeed> {
        match &self.mode {
            Mode::Reading(feed) => Some(feed.clone()),
            _ => None,
        }
    }

    /// Close whatever is open. Closing a recording normalizes the file.
    pub fn close(&mut self) -> Result<(), FileError> {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Closed => Ok(()),
            Mode::Writing(writer) => writer.finish().map(|_| ()),
            Mode::Reading(feed) => {
                feed.close();
                Ok(())
            }
        }
    }
}

impl Drop for TraceFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close trace file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_chunks() -> PreloadLimits {
        PreloadLimits {
            min_size: 2,
            min_interval_us: 0,
        }
    }

    #[test]
    fn test_record_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.trace");
        let mut trace = TraceFile::new(small_chunks());
        trace.set_path(Some(path.clone()));

        trace.open_writing().unwrap();
        assert!(trace.is_writing());
        trace.write_event(&Event::input(100, 0, 1, 1, 1)).unwrap();
        trace.write_event(&Event::input(50, 0, 1, 1, 0)).unwrap();
        // Replay requests are meaningless while recording
        assert!(trace.require_replay_buffer(1).is_none());
        trace.close().unwrap();
        assert!(!trace.is_open());

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "K 0 0 1 1 0\nK 50 0 1 1 1\n"
        );

        trace.open_reading().unwrap();
        assert!(trace.is_reading());
        // Writes are ignored while replaying
        trace.write_event(&Event::input(1, 0, 1, 1, 1)).unwrap();

        let chunk = trace.require_replay_buffer(1).unwrap();
        assert_eq!(
            chunk.events,
            vec![Event::input(0, 0, 1, 1, 0), Event::input(50, 0, 1, 1, 1)]
        );
        assert!(trace.require_replay_buffer(1).is_none());
        let feed = trace.replay_feed().unwrap();
        trace.close().unwrap();
        assert!(trace.require_replay_buffer(2).is_none());
        assert!(trace.replay_feed().is_none());
        assert!(feed.require_replay_buffer(2).is_none());
    }

    #[test]
    fn test_open_without_selection() {
        let mut trace = TraceFile::new(small_chunks());
        assert!(matches!(trace.open_writing(), Err(FileError::NotSelected)));
        assert!(matches!(trace.open_reading(), Err(FileError::NotSelected)));
        assert!(!trace.is_open());
    }

    #[test]
    fn test_open_reading_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = TraceFile::new(small_chunks());
        trace.set_path(Some(dir.path().join("missing.trace")));
        assert!(matches!(trace.open_reading(), Err(FileError::NotFound(_))));
    }

    #[test]
    fn test_limits_follow_replay_config() {
        let limits = PreloadLimits::default();
        assert_eq!(limits.min_size, 5000);
        assert_eq!(limits.min_interval_us, 5_000_000);
    }
}
