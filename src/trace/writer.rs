use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::data::{delta_encode, sort_by_timestamp, Event};
use crate::error::FileError;

/// Record-mode half of a trace file
pub(super) struct TraceWriter {
    path: PathBuf,
    out: BufWriter<File>,
    written: usize,
}

impl TraceWriter {
    /// Create (or truncate) the file at `path`
    pub fn create(path: &Path) -> Result<Self, FileError> {
        let file = File::create(path).map_err(|e| FileError::from_io(path, e))?;
        debug!("Trace opened for writing: {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            written: 0,
        })
    }

    /// Append one event. Only input events are persisted.
    pub fn write_event(&mut self, event: &Event) -> Result<(), FileError> {
        if !event.is_input() {
            return Ok(());
        }
        writeln!(self.out, "{}", event.to_trace_line())
            .map_err(|e| FileError::from_io(&self.path, e))?;
        self.written += 1;
        Ok(())
    }

    /// Flush, close, then normalize the file in place.
    /// Returns the number of events in the normalized trace.
    pub fn finish(self) -> Result<usize, FileError> {
        let TraceWriter {
            path,
            mut out,
            written,
        } = self;
        out.flush().map_err(|e| FileError::from_io(&path, e))?;
        drop(out);

        debug!("Trace writer closed after {} events: {:?}", written, path);
        normalize_trace(&path)
    }
}

/// Rewrite a recorded trace into canonical form: input events only, stably
/// sorted by timestamp, timestamps delta-encoded with the first at 0.
///
/// Malformed lines are dropped with a warning. A trace without any input
/// events is left untouched.
pub fn normalize_trace(path: &Path) -> Result<usize, FileError> {
    let file = File::open(path).map_err(|e| FileError::from_io(path, e))?;

    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| FileError::from_io(path, e))?;
        match Event::parse_trace_line(&line) {
            Ok(Some(event)) if event.is_input() => events.push(event),
            Ok(_) => {}
            Err(e) => warn!("Skipping line {} of {:?}: {}", index + 1, path, e),
        }
    }

    if events.is_empty() {
        info!("Trace {:?} has no input events, nothing to normalize", path);
        return Ok(0);
    }

    sort_by_timestamp(&mut events);
    delta_encode(&mut events);

    let file = File::create(path).map_err(|e| FileError::from_io(path, e))?;
    let mut out = BufWriter::new(file);
    for event in &events {
        writeln!(out, "{}", event.to_trace_line()).map_err(|e| FileError::from_io(path, e))?;
    }
    out.flush().map_err(|e| FileError::from_io(path, e))?;

    info!("Trace normalized: {} events in {:?}", events.len(), path);
    Ok(events.len())
}
