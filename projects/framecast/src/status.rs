// Status reporting and display sinks
//
// The core reports progress as `(name, value)` pairs and pushes frames into
// a display sink; what a GUI or terminal does with them is up to the
// embedder.

use crate::frame::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub const TIME_POSITION: &str = "Time position";
pub const FRAME_POSITION: &str = "Frame position";

/// Receives `(name, value)` status updates from worker threads.
pub trait StatusSink: Send + Sync {
    fn status(&self, name: &str, value: &str);
}

impl<F> StatusSink for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn status(&self, name: &str, value: &str) {
        self(name, value)
    }
}

/// Forwards status updates to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn status(&self, name: &str, value: &str) {
        tracing::debug!("{}: {}", name, value);
    }
}

/// Keeps the latest value of every status name.
#[derive(Debug, Default, Clone)]
pub struct StatusBoard {
    values: Arc<Mutex<std::collections::BTreeMap<String, String>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl StatusSink for StatusBoard {
    fn status(&self, name: &str, value: &str) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value.to_string());
    }
}

/// `HH:MM:SS.mmm`
pub fn format_hmsms(secs: f64) -> String {
    let total_ms = (secs.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60,
        ms
    )
}

/// Where the player puts frames.
pub trait FrameSink: Send {
    fn show(&mut self, index: u64, frame: &Frame);
}

#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn show(&mut self, _index: u64, _frame: &Frame) {}
}

/// Counts displayed frames and remembers the last index shown.
#[derive(Debug, Default, Clone)]
pub struct CountingSink {
    shown: Arc<AtomicU64>,
    last_index: Arc<AtomicU64>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> u64 {
        self.shown.load(Ordering::Relaxed)
    }

    /// Last displayed index, 0 before the first frame.
    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::Relaxed)
    }
}

impl FrameSink for CountingSink {
    fn show(&mut self, index: u64, _frame: &Frame) {
        self.shown.fetch_add(1, Ordering::Relaxed);
        self.last_index.store(index, Ordering::Relaxed);
    }
}
