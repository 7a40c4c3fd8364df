// Playback loop: pulls the frame for the wall-clock position from the
// timeline once per frame time and hands it to the display sink.

use crate::pipeline::events::{Event, TaggedEvent};
use crate::pipeline::timeline::{FrameLookup, Timeline};
use crate::status::{format_hmsms, FrameSink, StatusSink, FRAME_POSITION, TIME_POSITION};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type EndCallback = Box<dyn FnOnce() + Send>;

pub struct Player {
    timeline: Arc<Timeline>,
    running: Arc<Event>,
    rewind: Arc<TaggedEvent<u64>>,
    position: Arc<AtomicU64>,
    status: Arc<dyn StatusSink>,
    sink: Box<dyn FrameSink>,
    frames_count: u64,
    on_end: Option<EndCallback>,
}

impl Player {
    pub fn new(
        timeline: Arc<Timeline>,
        running: Arc<Event>,
        rewind: Arc<TaggedEvent<u64>>,
        position: Arc<AtomicU64>,
        status: Arc<dyn StatusSink>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        let frames_count = timeline.end_index();
        Self {
            timeline,
            running,
            rewind,
            position,
            status,
            sink,
            frames_count,
            on_end: None,
        }
    }

    /// Called once when playback runs past the last frame.
    pub fn on_end(mut self, callback: EndCallback) -> Self {
        self.on_end = Some(callback);
        self
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("framecast-player".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        let frame_time = self.timeline.frame_time();
        let tick = Duration::from_secs_f64(frame_time.max(0.0));
        let mut last_shown: Option<u64> = None;

        tracing::info!(
            "Player: started at frame {} ({:.3}s per frame)",
            self.timeline.start_index(),
            frame_time
        );

        while self.running.is_set() {
            let t0 = Instant::now();

            match self.timeline.get_frame(true) {
                FrameLookup::EndOfStream { requested, end } => {
                    tracing::info!("Player: end of stream at frame {} (last {})", requested, end);
                    if let Some(on_end) = self.on_end.take() {
                        on_end();
                    }
                    break;
                }
                FrameLookup::Pending { requested } => {
                    tracing::debug!("Player: nothing to show for frame {} yet", requested);
                }
                FrameLookup::Frame(nf) => {
                    if last_shown != Some(nf.index) {
                        self.sink.show(nf.index, &nf.frame);
                        last_shown = Some(nf.index);
                        self.report(frame_time);
                    }
                }
            }

            let remaining = tick.saturating_sub(t0.elapsed());
            if !remaining.is_zero() {
                // Wakes early when `running` is cleared.
                self.running.wait_for(false, remaining);
            }
        }

        tracing::info!(
            "Player: exited (last returned {:?}, frame lag {})",
            self.timeline.last_returned(),
            self.timeline.frame_lag()
        );
    }

    fn report(&self, frame_time: f64) {
        let Some(returned) = self.timeline.last_returned() else {
            return;
        };
        if self.rewind.is_set() {
            return;
        }
        self.position.store(returned, Ordering::Relaxed);
        self.status.status(
            TIME_POSITION,
            &format_hmsms((returned - 1) as f64 * frame_time),
        );
        self.status
            .status(FRAME_POSITION, &format!("{}/{}", returned, self.frames_count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::NumberedFrame;
    use crate::status::{CountingSink, StatusBoard};
    use image::RgbImage;

    fn timeline(dir: &std::path::Path, frames: u64) -> Arc<Timeline> {
        let tl = Timeline::load(dir, "_", "clip", 0.02, 1, frames).unwrap();
        for i in 1..=frames {
            tl.add(&NumberedFrame::new(i, RgbImage::new(2, 2))).unwrap();
        }
        Arc::new(tl)
    }

    #[test]
    fn test_plays_to_end_and_reports_position() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 5);
        let running = Arc::new(Event::new());
        running.set();
        let ended = Arc::new(Event::new());
        let position = Arc::new(AtomicU64::new(1));
        let board = StatusBoard::new();
        let sink = CountingSink::new();

        tl.start();
        let player = Player::new(
            tl.clone(),
            running.clone(),
            Arc::new(TaggedEvent::new()),
            position.clone(),
            Arc::new(board.clone()),
            Box::new(sink.clone()),
        )
        .on_end({
            let ended = ended.clone();
            Box::new(move || ended.set())
        });
        player.spawn().unwrap().join().unwrap();

        assert!(ended.is_set());
        assert!(sink.shown() >= 1);
        // A late tick may jump over the last frame straight to the end.
        let last = sink.last_index();
        assert!(last >= 4, "last shown {last}");
        assert_eq!(position.load(Ordering::Relaxed), last);
        let expected_frame = format!("{last}/5");
        assert_eq!(board.get(FRAME_POSITION), Some(expected_frame));
        let expected_time = format_hmsms((last - 1) as f64 * 0.02);
        assert_eq!(board.get(TIME_POSITION), Some(expected_time));
    }

    #[test]
    fn test_position_frozen_while_rewind_pending() {
        let temp = tempfile::tempdir().unwrap();
        let tl = timeline(temp.path(), 3);
        let running = Arc::new(Event::new());
        running.set();
        let rewind = Arc::new(TaggedEvent::new());
        rewind.set(1);
        let position = Arc::new(AtomicU64::new(0));

        tl.start();
        Player::new(
            tl,
            running,
            rewind,
            position.clone(),
            Arc::new(StatusBoard::new()),
            Box::new(CountingSink::new()),
        )
        .run();
        assert_eq!(position.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_stop_ends_loop_without_end_callback() {
        let temp = tempfile::tempdir().unwrap();
        let tl = Arc::new(Timeline::load(temp.path(), "_", "clip", 10.0, 1, 5).unwrap());
        let running = Arc::new(Event::new());
        running.set();
        let ended = Arc::new(Event::new());
        tl.start();
        let handle = Player::new(
            tl,
            running.clone(),
            Arc::new(TaggedEvent::new()),
            Arc::new(AtomicU64::new(1)),
            Arc::new(StatusBoard::new()),
            Box::new(CountingSink::new()),
        )
        .on_end({
            let ended = ended.clone();
            Box::new(move || ended.set())
        })
        .spawn()
        .unwrap();
        thread::sleep(Duration::from_millis(30));
        running.clear();
        handle.join().unwrap();
        assert!(!ended.is_set());
    }
}
