// Wall-clock to frame-index mapping on top of the frame buffer.

use crate::error::Result;
use crate::frame::NumberedFrame;
use crate::pipeline::buffer::FrameBuffer;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Sentinel for "no frame returned yet"; indices are 1-based.
const NONE: u64 = 0;

/// Outcome of a playback lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameLookup {
    /// A stored frame at or below the requested index.
    Frame(NumberedFrame),
    /// Nothing stored at or below the requested index yet.
    Pending { requested: u64 },
    /// The requested index is past the end of the timeline.
    EndOfStream { requested: u64, end: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Clock {
    frame_time: f64,
    start_index: u64,
    end_index: u64,
    anchor: Instant,
    is_started: bool,
}

impl Clock {
    fn index_at(&self, now: Instant) -> u64 {
        if !self.is_started || self.frame_time <= 0.0 {
            return self.start_index;
        }
        let elapsed = now.saturating_duration_since(self.anchor).as_secs_f64();
        (elapsed / self.frame_time).floor() as u64 + self.start_index
    }
}

#[derive(Debug)]
pub struct Timeline {
    buffer: FrameBuffer,
    clock: Mutex<Clock>,
    last_added: AtomicU64,
    last_requested: AtomicU64,
    last_returned: AtomicU64,
}

impl Timeline {
    /// Binds a timeline to the buffer of `(source_id, target_id)`.
    pub fn load(
        temp_dir: &Path,
        source_id: &str,
        target_id: &str,
        frame_time: f64,
        start: u64,
        end: u64,
    ) -> Result<Self> {
        let buffer = FrameBuffer::load(temp_dir, source_id, target_id, end)?;
        let last_added = buffer.max_index().unwrap_or(NONE);
        Ok(Self {
            buffer,
            clock: Mutex::new(Clock {
                frame_time,
                start_index: start,
                end_index: end,
                anchor: Instant::now(),
                is_started: false,
            }),
            last_added: AtomicU64::new(last_added),
            last_requested: AtomicU64::new(start.saturating_sub(1)),
            last_returned: AtomicU64::new(NONE),
        })
    }

    fn clock(&self) -> MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebinds timing parameters, keeping the buffer.
    pub fn reload(&self, frame_time: f64, start: u64, end: u64) {
        let mut clock = self.clock();
        clock.frame_time = frame_time;
        clock.start_index = start;
        clock.end_index = end;
        clock.anchor = Instant::now();
        self.last_requested
            .store(start.saturating_sub(1), Ordering::Relaxed);
        self.last_returned.store(NONE, Ordering::Relaxed);
    }

    pub fn start(&self) {
        let mut clock = self.clock();
        clock.anchor = Instant::now();
        clock.is_started = true;
    }

    pub fn stop(&self) {
        self.clock().is_started = false;
    }

    /// Restarts the wall clock at `index`.
    pub fn rewind(&self, index: u64) {
        {
            let mut clock = self.clock();
            clock.start_index = index;
            clock.anchor = Instant::now();
        }
        self.last_requested
            .store(index.saturating_sub(1), Ordering::Relaxed);
        self.buffer.reset_miss();
    }

    pub fn add(&self, nf: &NumberedFrame) -> Result<()> {
        self.buffer.add(nf)?;
        self.last_added.fetch_max(nf.index, Ordering::AcqRel);
        Ok(())
    }

    /// Frame for the current playback position. With `time_aligned` the
    /// position comes from the wall clock, otherwise it is `last_added`.
    pub fn get_frame(&self, time_aligned: bool) -> FrameLookup {
        let (requested, end) = {
            let clock = self.clock();
            let requested = if time_aligned {
                clock.index_at(Instant::now())
            } else {
                self.last_added.load(Ordering::Acquire)
            };
            (requested, clock.end_index)
        };
        self.last_requested.store(requested, Ordering::Relaxed);

        if requested > end {
            return FrameLookup::EndOfStream { requested, end };
        }

        match self.buffer.get(requested, true) {
            Some(nf) => {
                // The intended position, not the fallback's index.
                self.last_returned.store(requested, Ordering::Relaxed);
                FrameLookup::Frame(nf)
            }
            None => FrameLookup::Pending { requested },
        }
    }

    /// Exact lookup without time alignment or fallback.
    pub fn get_frame_by_index(&self, index: u64) -> Option<NumberedFrame> {
        self.buffer.get(index, false)
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn frame_time(&self) -> f64 {
        self.clock().frame_time
    }

    pub fn start_index(&self) -> u64 {
        self.clock().start_index
    }

    pub fn end_index(&self) -> u64 {
        self.clock().end_index
    }

    pub fn is_started(&self) -> bool {
        self.clock().is_started
    }

    /// Index the wall clock points at right now.
    pub fn current_index(&self) -> u64 {
        self.clock().index_at(Instant::now())
    }

    pub fn last_added(&self) -> u64 {
        self.last_added.load(Ordering::Acquire)
    }

    pub fn last_requested(&self) -> u64 {
        self.last_requested.load(Ordering::Relaxed)
    }

    pub fn last_returned(&self) -> Option<u64> {
        match self.last_returned.load(Ordering::Relaxed) {
            NONE => None,
            index => Some(index),
        }
    }

    /// How far presentation trails the wall clock.
    pub fn frame_lag(&self) -> i64 {
        let returned = self.last_returned().unwrap_or(NONE) as i64;
        self.current_index() as i64 - returned
    }

    /// Negative while presentation outpaces production.
    pub fn display_frame_lag(&self) -> i64 {
        let returned = self.last_returned().unwrap_or(NONE) as i64;
        returned - self.last_added() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::thread;
    use std::time::Duration;

    fn frame(index: u64) -> NumberedFrame {
        NumberedFrame::new(index, RgbImage::new(4, 4))
    }

    fn timeline(dir: &Path, frame_time: f64, end: u64) -> Timeline {
        Timeline::load(dir, "source.jpg", "target.mp4", frame_time, 1, end).unwrap()
    }

    #[test]
    fn test_add_tracks_last_added() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 0.1, 10);
        tl.add(&frame(3)).unwrap();
        tl.add(&frame(2)).unwrap();
        assert_eq!(tl.last_added(), 3);
        assert!(tl.buffer().has(2));
    }

    #[test]
    fn test_unstarted_timeline_points_at_start() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 0.1, 10);
        assert_eq!(tl.get_frame(true), FrameLookup::Pending { requested: 1 });
        assert_eq!(tl.last_requested(), 1);
        assert_eq!(tl.last_returned(), None);
    }

    #[test]
    fn test_time_aligned_lookup_falls_back_and_reports_requested() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 0.01, 1000);
        tl.add(&frame(1)).unwrap();
        tl.start();
        thread::sleep(Duration::from_millis(60));

        match tl.get_frame(true) {
            FrameLookup::Frame(nf) => assert_eq!(nf.index, 1),
            other => panic!("unexpected lookup {other:?}"),
        }
        let requested = tl.last_requested();
        assert!(requested >= 6, "requested {requested}");
        assert_eq!(tl.last_returned(), Some(requested));
        assert_eq!(tl.buffer().miss(), requested - 1);
    }

    #[test]
    fn test_end_of_stream() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 0.001, 2);
        tl.start();
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            tl.get_frame(true),
            FrameLookup::EndOfStream { end: 2, .. }
        ));
    }

    #[test]
    fn test_untimed_lookup_uses_last_added() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 1.0, 10);
        tl.add(&frame(4)).unwrap();
        match tl.get_frame(false) {
            FrameLookup::Frame(nf) => assert_eq!(nf.index, 4),
            other => panic!("unexpected lookup {other:?}"),
        }
        assert_eq!(tl.last_returned(), Some(4));
        assert_eq!(tl.display_frame_lag(), 0);
    }

    #[test]
    fn test_rewind_reanchors_clock() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 0.5, 10);
        tl.start();
        tl.rewind(7);
        assert_eq!(tl.start_index(), 7);
        assert_eq!(tl.last_requested(), 6);
        assert_eq!(tl.current_index(), 7);
    }

    #[test]
    fn test_rewind_to_current_index_is_a_no_op() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 10.0, 10);
        tl.add(&frame(1)).unwrap();
        tl.start();
        let before = tl.get_frame(true);
        tl.rewind(tl.current_index());
        assert_eq!(tl.get_frame(true), before);
    }

    #[test]
    fn test_get_frame_by_index_has_no_fallback() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 0.1, 10);
        tl.add(&frame(1)).unwrap();
        assert!(tl.get_frame_by_index(2).is_none());
        assert_eq!(tl.get_frame_by_index(1).unwrap().index, 1);
    }

    #[test]
    fn test_reload_keeps_buffer_and_resets_positions() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 0.1, 10);
        tl.add(&frame(1)).unwrap();
        tl.get_frame(false);
        tl.reload(0.2, 5, 20);
        assert_eq!(tl.last_returned(), None);
        assert_eq!(tl.last_requested(), 4);
        assert_eq!(tl.end_index(), 20);
        assert!(tl.buffer().has(1));
    }
}
