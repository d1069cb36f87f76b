use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

use super::PreloadLimits;
use crate::data::Event;
use crate::error::FileError;

/// One chunk of events handed to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayChunk {
    pub events: Vec<Event>,
    /// The file was exhausted while (or before) loading this chunk
    pub all_read_done: bool,
}

impl ReplayChunk {
    pub fn has_more(&self) -> bool {
        !self.all_read_done
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Single-slot handoff between the preload thread and the consumer
#[derive(Default)]
struct Slot {
    /// `None` until a chunk is ready
    events: Option<Vec<Event>>,
    /// Sticky once EOF has been reached
    all_read_done: bool,
    /// A preload pass is running
    loading: bool,
}

struct Preload {
    path: PathBuf,
    limits: PreloadLimits,
    lines: Mutex<Lines<BufReader<File>>>,
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Preload {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the next chunk into the slot unless it is full, exhausted, or
    /// another pass is already running.
    fn fill(&self) {
        {
            let mut slot = self.lock_slot();
            if slot.events.is_some() || slot.all_read_done || slot.loading {
                return;
            }
            slot.loading = true;
        }

        let (events, eof) = self.read_chunk();
        debug!("Preloaded {} events (eof: {})", events.len(), eof);

        let mut slot = self.lock_slot();
        slot.events = Some(events);
        slot.all_read_done |= eof;
        slot.loading = false;
        drop(slot);
        self.ready.notify_all();
    }

    /// Read lines until EOF, or until the chunk holds at least
    /// `min_size` events spanning at least `min_interval_us`.
    ///
    /// Timestamps in a normalized trace are deltas, so the span is the sum of
    /// the deltas after the first event.
    fn read_chunk(&self) -> (Vec<Event>, bool) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let mut events: Vec<Event> = Vec::new();
        let mut span_us: i64 = 0;

        loop {
            if !events.is_empty()
                && events.len() >= self.limits.min_size as usize
                && span_us >= self.limits.min_interval_us
            {
                return (events, false);
            }

            let line = match lines.next() {
                None => return (events, true),
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    error!("Read failed on {:?}, treating as end of trace: {}", self.path, e);
                    return (events, true);
                }
            };

            match Event::parse_trace_line(&line) {
                Ok(Some(event)) => {
                    if !events.is_empty() {
                        span_us = span_us.saturating_add(event.timestamp_us);
                    }
                    events.push(event);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping trace line {:?}: {}", line, e),
            }
        }
    }
}

/// Replay-mode half of a trace file.
///
/// Keeps at most one chunk loaded ahead of demand. Opening starts the first
/// preload; every chunk handed out starts the next one. Clones share the same
/// file and position, so a chunk can be taken without holding whatever lock
/// guards the owner.
#[derive(Clone)]
pub struct ReplayFeed {
    shared: Arc<FeedShared>,
}

struct FeedShared {
    preload: Arc<Preload>,
    cursor: Mutex<Cursor>,
    closed: AtomicBool,
}

struct Cursor {
    last_sent_sn: i64,
    worker: Option<JoinHandle<()>>,
}

impl ReplayFeed {
    pub(super) fn open(path: &Path, limits: PreloadLimits) -> Result<Self, FileError> {
        let feed = Self::open_idle(path, limits)?;
        feed.lock_cursor().spawn_preload(&feed.shared.preload);
        Ok(feed)
    }

    /// Open without starting the first preload
    fn open_idle(path: &Path, limits: PreloadLimits) -> Result<Self, FileError> {
        let file = File::open(path).map_err(|e| FileError::from_io(path, e))?;
        debug!(
            "Trace opened for reading: {:?} (min size {}, min interval {}us)",
            path, limits.min_size, limits.min_interval_us
        );

        Ok(Self {
            shared: Arc::new(FeedShared {
                preload: Arc::new(Preload {
                    path: path.to_path_buf(),
                    limits,
                    lines: Mutex::new(BufReader::new(file).lines()),
                    slot: Mutex::new(Slot::default()),
                    ready: Condvar::new(),
                }),
                cursor: Mutex::new(Cursor {
                    last_sent_sn: 0,
                    worker: None,
                }),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn lock_cursor(&self) -> MutexGuard<'_, Cursor> {
        self.shared.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_sent_sn(&self) -> i64 {
        self.lock_cursor().last_sent_sn
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Hand out the chunk for `required_sn`.
    ///
    /// Returns `None` if that chunk was already sent or the feed is closed.
    /// Otherwise blocks until the preloaded chunk is ready, loading it on the
    /// calling thread if no preload pass is running.
    pub fn require_replay_buffer(&self, required_sn: i64) -> Option<ReplayChunk> {
        let mut cursor = self.lock_cursor();
        if self.is_closed() || required_sn <= cursor.last_sent_sn {
            return None;
        }

        let preload = &self.shared.preload;
        let chunk = {
            let mut slot = preload.lock_slot();
            let mut starved = false;
            loop {
                if let Some(events) = slot.events.take() {
                    break ReplayChunk {
                        events,
                        all_read_done: slot.all_read_done,
                    };
                }
                if slot.all_read_done {
                    break ReplayChunk {
                        events: Vec::new(),
                        all_read_done: true,
                    };
                }

                if !starved {
                    warn!("Preload not ready for SN {}, waiting", required_sn);
                    starved = true;
                }

                if slot.loading {
                    slot = preload.ready.wait(slot).unwrap_or_else(PoisonError::into_inner);
                } else {
                    warn!("No preload running, loading SN {} synchronously", required_sn);
                    drop(slot);
                    preload.fill();
                    slot = preload.lock_slot();
                }
            }
        };

        cursor.last_sent_sn += 1;
        debug!(
            "Chunk SN {} ready: {} events, more: {}",
            cursor.last_sent_sn,
            chunk.len(),
            chunk.has_more()
        );

        cursor.spawn_preload(preload);
        Some(chunk)
    }

    /// Stop handing out chunks and wait for any running preload pass
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.lock_cursor().join_worker();
        debug!("Trace reader closed: {:?}", self.shared.preload.path);
    }
}

impl Cursor {
    fn spawn_preload(&mut self, preload: &Arc<Preload>) {
        self.join_worker();

        let preload = preload.clone();
        match std::thread::Builder::new()
            .name("trace-preload".to_string())
            .spawn(move || preload.fill())
        {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => warn!("Failed to spawn preload thread, chunks load on demand: {}", e),
        }
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Preload thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_with(dir: &tempfile::TempDir, lines: &[&str]) -> PathBuf {
        let path = dir.path().join("replay.trace");
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(&path, content).unwrap();
        path
    }

    fn five_events(dir: &tempfile::TempDir) -> PathBuf {
        trace_with(
            dir,
            &[
                "K 0 0 1 1 1",
                "K 10 0 1 1 0",
                "K 10 0 1 2 1",
                "K 10 0 1 2 0",
                "K 10 0 1 3 1",
            ],
        )
    }

    fn limits(min_size: u32, min_interval_us: i64) -> PreloadLimits {
        PreloadLimits {
            min_size,
            min_interval_us,
        }
    }

    #[test]
    fn test_first_chunk_stops_at_size_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ReplayFeed::open(&five_events(&dir), limits(2, 0)).unwrap();

        let chunk = reader.require_replay_buffer(1).unwrap();
        assert_eq!(chunk.len(), 2);
        assert!(chunk.has_more());
        assert_eq!(chunk.events[0], Event::input(0, 0, 1, 1, 1));
        assert_eq!(chunk.events[1], Event::input(10, 0, 1, 1, 0));
        reader.close();
    }

    #[test]
    fn test_chunk_waits_for_interval_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = trace_with(
            &dir,
            &[
                "K 0 0 1 1 1",
                "K 40 0 1 1 0",
                "K 40 0 1 1 1",
                "K 40 0 1 1 0",
                "K 40 0 1 1 1",
            ],
        );
        let reader = ReplayFeed::open(&path, limits(1, 100)).unwrap();

        // spans 0, 40, 80, 120
        assert_eq!(reader.require_replay_buffer(1).unwrap().len(), 4);
        let last = reader.require_replay_buffer(2).unwrap();
        assert_eq!(last.len(), 1);
        assert!(!last.has_more());
    }

    #[test]
    fn test_repeated_request_returns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ReplayFeed::open(&five_events(&dir), limits(2, 0)).unwrap();

        assert!(reader.require_replay_buffer(1).is_some());
        assert!(reader.require_replay_buffer(1).is_none());
        assert!(reader.require_replay_buffer(0).is_none());
        assert_eq!(reader.last_sent_sn(), 1);
    }

    #[test]
    fn test_sequence_number_advances_by_one_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ReplayFeed::open(&five_events(&dir), limits(2, 0)).unwrap();

        assert_eq!(reader.last_sent_sn(), 0);
        reader.require_replay_buffer(1).unwrap();
        assert_eq!(reader.last_sent_sn(), 1);
        // A jump ahead still only advances by one
        reader.require_replay_buffer(5).unwrap();
        assert_eq!(reader.last_sent_sn(), 2);
    }

    #[test]
    fn test_exhausted_trace_yields_final_and_empty_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ReplayFeed::open(&five_events(&dir), limits(2, 0)).unwrap();

        let sizes: Vec<(usize, bool)> = (1..=4)
            .map(|sn| {
                let chunk = reader.require_replay_buffer(sn).unwrap();
                (chunk.len(), chunk.has_more())
            })
            .collect();

        assert_eq!(sizes, vec![(2, true), (2, true), (1, false), (0, false)]);
        assert_eq!(reader.last_sent_sn(), 4);
    }

    #[test]
    fn test_whole_file_in_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ReplayFeed::open(&five_events(&dir), limits(5000, 5_000_000)).unwrap();

        let chunk = reader.require_replay_buffer(1).unwrap();
        assert_eq!(chunk.len(), 5);
        assert!(!chunk.has_more());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = trace_with(&dir, &["K 0 0 1 1 1", "K x 0 1 1 0", "", "K 5 0 1 1 0"]);
        let reader = ReplayFeed::open(&path, limits(10, 0)).unwrap();

        let chunk = reader.require_replay_buffer(1).unwrap();
        assert_eq!(
            chunk.events,
            vec![Event::input(0, 0, 1, 1, 1), Event::input(5, 0, 1, 1, 0)]
        );
    }

    #[test]
    fn test_chunk_loads_synchronously_without_preload() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ReplayFeed::open_idle(&five_events(&dir), limits(2, 0)).unwrap();
        assert_eq!(reader.last_sent_sn(), 0);

        let chunk = reader.require_replay_buffer(1).unwrap();
        assert_eq!(
            chunk.events,
            vec![Event::input(0, 0, 1, 1, 1), Event::input(10, 0, 1, 1, 0)]
        );
        assert!(chunk.has_more());
        assert_eq!(reader.last_sent_sn(), 1);

        // The next chunk comes from the regular preload again
        assert_eq!(reader.require_replay_buffer(2).unwrap().len(), 2);
        assert_eq!(reader.last_sent_sn(), 2);
        reader.close();
    }

    #[test]
    fn test_closed_feed_hands_out_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ReplayFeed::open(&five_events(&dir), limits(2, 0)).unwrap();
        let handle = reader.clone();

        reader.close();
        assert!(handle.is_closed());
        assert!(handle.require_replay_buffer(1).is_none());
        assert_eq!(handle.last_sent_sn(), 0);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = ReplayFeed::open(&dir.path().join("absent.trace"), limits(1, 0));
        assert!(matches!(result, Err(FileError::NotFound(_))));
    }
}
