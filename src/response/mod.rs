//! Response file: platform events collected during a replay, turned into a
//! response-time report when closed

mod aggregate;

pub use aggregate::{ActivityTotals, ResponseReport, TypeTotal};

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::data::Event;
use crate::error::FileError;

struct ResponseWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

#[derive(Default)]
pub struct ResponseFile {
    path: Option<PathBuf>,
    writer: Option<ResponseWriter>,
}

impl ResponseFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Select the file used by the next open. `None` disables the report.
    pub fn set_path(&mut self, path: Option<PathBuf>) {
        self.path = path;
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Truncate the selected file and start collecting platform events
    pub fn open_writing(&mut self) -> Result<(), FileError> {
        let path = self.path.clone().ok_or(FileError::NotSelected)?;
        self.close()?;

        let file = File::create(&path).map_err(|e| FileError::from_io(&path, e))?;
        debug!("Response file opened: {:?}", path);
        self.writer = Some(ResponseWriter {
            path,
            out: BufWriter::new(file),
        });
        Ok(())
    }

    /// Append a platform event. Input events, and any event while closed,
    /// are ignored.
    pub fn write_event(&mut self, event: &Event) -> Result<(), FileError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        if event.is_input() {
            return Ok(());
        }
        writeln!(writer.out, "{}", event.to_trace_line())
            .map_err(|e| FileError::from_io(&writer.path, e))
    }

    /// Close the file and replace its contents with the report.
    ///
    /// Returns the report, or `None` if the file was not open or no platform
    /// events were collected (the file is then left empty).
    pub fn close(&mut self) -> Result<Option<ResponseReport>, FileError> {
        let Some(ResponseWriter { path, mut out }) = self.writer.take() else {
            return Ok(None);
        };
        out.flush().map_err(|e| FileError::from_io(&path, e))?;
        drop(out);

        let report = ResponseReport::aggregate(read_events(&path)?);
        if report.is_empty() {
            info!("No response events collected in {:?}", path);
            return Ok(None);
        }

        std::fs::write(&path, report.render()).map_err(|e| FileError::from_io(&path, e))?;
        info!(
            "Response report written to {:?} ({} events, {} activities)",
            path,
            report.trace.len(),
            report.activities.len()
        );
        Ok(Some(report))
    }
}

impl Drop for ResponseFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close response file: {}", e);
        }
    }
}

fn read_events(path: &Path) -> Result<Vec<Event>, FileError> {
    let file = File::open(path).map_err(|e| FileError::from_io(path, e))?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| FileError::from_io(path, e))?;
        match Event::parse_trace_line(&line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => warn!("Skipping response line {:?}: {}", line, e),
        }
    }
    Ok(events)
}
