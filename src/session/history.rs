//! Operator-visible history, polled by renderers through a dirty flag

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HistoryKind {
    /// A command sent to the device
    Command,
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryLine {
    /// Increases by one per line, across clears
    pub seq: u64,
    pub at: DateTime<Local>,
    pub kind: HistoryKind,
    pub text: String,
}

impl std::fmt::Display for HistoryLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let marker = match self.kind {
            HistoryKind::Command => ">",
            HistoryKind::Info => "-",
            HistoryKind::Warning => "!",
        };
        write!(f, "{} {} {}", self.at.format("%H:%M:%S"), marker, self.text)
    }
}

#[derive(Default)]
struct Lines {
    lines: VecDeque<HistoryLine>,
    next_seq: u64,
}

/// Bounded history. The dirty flag is kept outside the line lock so a
/// renderer can poll it without contending with writers.
pub struct HistoryLog {
    limit: usize,
    inner: Mutex<Lines>,
    dirty: AtomicBool,
}

impl HistoryLog {
    /// Keep at most `limit` lines (at least one)
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            inner: Mutex::new(Lines::default()),
            dirty: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lines> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, kind: HistoryKind, text: impl Into<String>) {
        let text = text.into();
        debug!(?kind, "{}", text);
        {
            let mut inner = self.lock();
            while inner.lines.len() >= self.limit {
                inner.lines.pop_front();
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.lines.push_back(HistoryLine {
                seq,
                at: Local::now(),
                kind,
                text,
            });
        }
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn command(&self, text: impl Into<String>) {
        self.push(HistoryKind::Command, text);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.push(HistoryKind::Info, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.push(HistoryKind::Warning, text);
    }

    pub fn clear(&self) {
        self.lock().lines.clear();
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn lines(&self) -> Vec<HistoryLine> {
        self.lock().lines.iter().cloned().collect()
    }

    /// Lines with `seq >= from`
    pub fn lines_since(&self, from: u64) -> Vec<HistoryLine> {
        self.lock()
            .lines
            .iter()
            .filter(|line| line.seq >= from)
            .cloned()
            .collect()
    }

    /// Sequence number the next line will get
    pub fn next_seq(&self) -> u64 {
        self.lock().next_seq
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return and reset the dirty flag
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}
