// Frame scheduler
//
// Decides which frame the worker pool computes next so the buffer fills
// ahead of the playback cursor. The stride follows the ratio of playback
// fps to processing fps, corrected by `processing_delta` whenever the
// player outruns production or production runs far ahead. In playback
// mode frames skipped by the stride are only filled in once the player has
// reached the end, so submissions after a start or rewind never go back.

use crate::pipeline::events::{Event, TaggedEvent};
use crate::pipeline::moving_average::MovingAverage;
use crate::pipeline::progress::FrameStatus;
use crate::pipeline::worker_pool::{
    Completion, CompletionStatus, FrameTask, TaskHandle, TaskState, WorkerPool,
};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const AVG_WINDOW: usize = 10;
const EPSILON: f64 = 1e-6;
const IDLE_POLL: Duration = Duration::from_millis(10);
const SUBMISSION_LOG: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    /// Adaptive stride, idles at the end waiting for a rewind or stop.
    Playback,
    /// Every frame in order, exits once the buffer is complete.
    Exhaustive,
}

/// Emitted after a frame has been stored in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameReady {
    pub index: u64,
    /// Seconds from the start of the target.
    pub time: f64,
    /// Current processing throughput.
    pub fps: f64,
}

pub type FrameReadyCallback = Arc<dyn Fn(FrameReady) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub processing_fps: f64,
    /// Mean processing fps over the whole run.
    pub average_fps: f64,
    pub frame_skip: f64,
    pub processing_delta: i64,
    pub biggest_completed: u64,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
    pub busy_workers: usize,
}

#[derive(Debug, Default)]
struct Shared {
    stats: Mutex<SchedulerStats>,
    submissions: Mutex<VecDeque<u64>>,
    finished: Event,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only view of a running scheduler.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMonitor {
    shared: Arc<Shared>,
}

impl SchedulerMonitor {
    pub fn stats(&self) -> SchedulerStats {
        lock(&self.shared.stats).clone()
    }

    /// Indices in submission order (most recent last, bounded).
    pub fn submissions(&self) -> Vec<u64> {
        lock(&self.shared.submissions).iter().copied().collect()
    }

    /// Set once every frame of the current segment is stored, or the
    /// scheduler has exited.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.is_set()
    }

    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.shared.finished.wait_for(true, timeout)
    }

    fn record_submission(&self, index: u64) {
        let mut log = lock(&self.shared.submissions);
        if log.len() == SUBMISSION_LOG {
            log.pop_front();
        }
        log.push_back(index);
    }
}

struct Dispatch {
    pool: WorkerPool,
    in_flight: VecDeque<(u64, TaskHandle<Completion>)>,
    in_flight_set: HashSet<u64>,
    failed: HashSet<u64>,
    avg_process_time: MovingAverage,
    avg_frame_skip: MovingAverage,
    run_fps: MovingAverage,
    processing_fps: f64,
    processing_delta: i64,
    biggest_completed: u64,
    /// Next candidate when backfilling skipped frames.
    gap_cursor: u64,
}

impl Dispatch {
    fn new(threads: usize, target_fps: f64, start: u64) -> Self {
        Self {
            pool: WorkerPool::new(threads),
            in_flight: VecDeque::new(),
            in_flight_set: HashSet::new(),
            failed: HashSet::new(),
            avg_process_time: MovingAverage::new(AVG_WINDOW),
            avg_frame_skip: MovingAverage::new(AVG_WINDOW),
            run_fps: MovingAverage::unbounded(),
            // Stride 1 until the first completion is measured.
            processing_fps: target_fps,
            processing_delta: 0,
            biggest_completed: 0,
            gap_cursor: start,
        }
    }
}

pub struct Scheduler {
    task: Arc<FrameTask>,
    threads: usize,
    mode: ScheduleMode,
    start: u64,
    running: Arc<Event>,
    rewind: Arc<TaggedEvent<u64>>,
    on_ready: Option<FrameReadyCallback>,
    drain_timeout: Duration,
    monitor: SchedulerMonitor,
}

impl Scheduler {
    pub fn new(
        task: Arc<FrameTask>,
        threads: usize,
        running: Arc<Event>,
        rewind: Arc<TaggedEvent<u64>>,
    ) -> Self {
        Self {
            task,
            threads: threads.max(1),
            mode: ScheduleMode::Playback,
            start: 1,
            running,
            rewind,
            on_ready: None,
            drain_timeout: Duration::from_secs(1),
            monitor: SchedulerMonitor::default(),
        }
    }

    pub fn with_mode(mut self, mode: ScheduleMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_start(mut self, start: u64) -> Self {
        self.start = start.max(1);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn on_frame_ready(mut self, callback: FrameReadyCallback) -> Self {
        self.on_ready = Some(callback);
        self
    }

    pub fn monitor(&self) -> SchedulerMonitor {
        self.monitor.clone()
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("framecast-scheduler".into())
            .spawn(move || self.run())
    }

    pub fn run(self) {
        let timeline = self.task.timeline.clone();
        let end = timeline.end_index();
        let frame_time = timeline.frame_time();
        let target_fps = if frame_time > 0.0 { 1.0 / frame_time } else { 1.0 };

        tracing::info!(
            "Scheduler: started at frame {} of {} ({:?}, {} threads, {:.2} fps)",
            self.start,
            end,
            self.mode,
            self.threads,
            target_fps
        );

        let mut d = Dispatch::new(self.threads, target_fps, self.start);
        let mut next = self.start;

        while self.running.is_set() {
            if let Some(tag) = self.rewind.take() {
                let tag = tag.clamp(1, end.max(1));
                tracing::debug!("Scheduler: rewind to frame {} (was at {})", tag, next);
                timeline.rewind(tag);
                next = tag;
                d.gap_cursor = tag;
                d.failed.clear();
                self.monitor.shared.finished.clear();
            }

            self.collect_finished(&mut d);

            if next <= end {
                self.dispatch(&mut d, next);
                if !self.running.is_set() {
                    break;
                }
                let step = match self.mode {
                    ScheduleMode::Exhaustive => 1,
                    ScheduleMode::Playback => {
                        d.avg_frame_skip
                            .update(target_fps / d.processing_fps.max(EPSILON));
                        self.adapt(&mut d);
                        Self::step(&d)
                    }
                };
                next += step;
            } else if let Some(gap) = self.next_gap(&mut d, end) {
                self.dispatch(&mut d, gap);
            } else if !d.in_flight.is_empty() {
                self.wait_oldest(&mut d);
            } else if !self.may_backfill() {
                // Skipped frames wait for the player to reach the end.
                self.running.wait_for(false, IDLE_POLL);
            } else {
                if !self.monitor.is_finished() {
                    tracing::info!(
                        "Scheduler: frames {}..={} stored",
                        d.gap_cursor.min(end),
                        end
                    );
                    self.monitor.shared.finished.set();
                }
                if self.mode == ScheduleMode::Exhaustive {
                    break;
                }
                self.running.wait_for(false, IDLE_POLL);
            }
            self.publish(&d);
        }

        self.shutdown(d);
    }

    fn dispatch(&self, d: &mut Dispatch, index: u64) {
        if d.in_flight_set.contains(&index) || self.task.timeline.buffer().has(index) {
            return;
        }
        let handle = self.task.submit(&d.pool, index);
        d.in_flight.push_back((index, handle));
        d.in_flight_set.insert(index);
        self.monitor.record_submission(index);
        lock(&self.monitor.shared.stats).submitted += 1;
        tracing::debug!("Scheduler: submitted frame {}", index);

        // Back-pressure: never more than one frame per worker outstanding.
        while d.in_flight.len() >= d.pool.size() {
            self.wait_oldest(d);
        }
    }

    fn wait_oldest(&self, d: &mut Dispatch) {
        if let Some((index, handle)) = d.in_flight.pop_front() {
            match handle.wait() {
                Some(completion) => self.complete(d, completion),
                None => self.forget(d, index),
            }
        }
    }

    fn collect_finished(&self, d: &mut Dispatch) {
        let mut pending = VecDeque::with_capacity(d.in_flight.len());
        while let Some((index, handle)) = d.in_flight.pop_front() {
            match handle.try_get() {
                TaskState::Ready(completion) => self.complete(d, completion),
                TaskState::Cancelled => self.forget(d, index),
                TaskState::Pending => pending.push_back((index, handle)),
            }
        }
        d.in_flight = pending;
    }

    fn forget(&self, d: &mut Dispatch, index: u64) {
        d.in_flight_set.remove(&index);
        self.task.progress.clear_frame_status(index);
        tracing::debug!("Scheduler: frame {} was cancelled before it ran", index);
    }

    fn complete(&self, d: &mut Dispatch, completion: Completion) {
        let index = completion.index;
        d.in_flight_set.remove(&index);

        d.avg_process_time
            .update(completion.duration.as_secs_f64() / self.threads as f64);
        let mean = d.avg_process_time.get();
        if mean > 0.0 {
            d.processing_fps = 1.0 / mean;
            d.run_fps.update(d.processing_fps);
            self.task.progress.set_processing_fps(d.processing_fps);
        }

        let mut stats = lock(&self.monitor.shared.stats);
        match completion.status {
            CompletionStatus::Added => {
                stats.completed += 1;
                d.biggest_completed = d.biggest_completed.max(index);
                self.task
                    .progress
                    .set_frame_status(index, FrameStatus::Processed);
                drop(stats);
                if let Some(on_ready) = &self.on_ready {
                    on_ready(FrameReady {
                        index,
                        time: (index - 1) as f64 * self.task.timeline.frame_time(),
                        fps: d.processing_fps,
                    });
                }
            }
            CompletionStatus::OutOfRange => {
                stats.failed += 1;
                d.failed.insert(index);
                self.task.progress.set_frame_status(index, FrameStatus::Failed);
            }
            CompletionStatus::Failed(_) => {
                stats.failed += 1;
                d.failed.insert(index);
                self.task.progress.set_frame_status(index, FrameStatus::Failed);
            }
        }
    }

    fn adapt(&self, d: &mut Dispatch) {
        let timeline = &self.task.timeline;
        let added = timeline.last_added();
        let requested = timeline.last_requested();
        let miss = timeline.buffer().miss();
        let frame_skip = d.avg_frame_skip.get();

        if added > requested + miss && d.processing_delta as f64 > frame_skip {
            d.processing_delta -= 1;
        } else if added < requested {
            d.processing_delta += 1;
        }
    }

    fn step(d: &Dispatch) -> u64 {
        let step = d.avg_frame_skip.get().floor() as i64 + d.processing_delta;
        step.max(1) as u64
    }

    /// Exhaustive runs fill gaps right away, playback only once the
    /// timeline has stopped.
    fn may_backfill(&self) -> bool {
        match self.mode {
            ScheduleMode::Exhaustive => true,
            ScheduleMode::Playback => !self.task.timeline.is_started(),
        }
    }

    /// First frame at or after the gap cursor that is neither stored, in
    /// flight nor known to fail.
    fn next_gap(&self, d: &mut Dispatch, end: u64) -> Option<u64> {
        if !self.may_backfill() {
            return None;
        }
        let buffer = self.task.timeline.buffer();
        while d.gap_cursor <= end {
            let index = d.gap_cursor;
            d.gap_cursor += 1;
            if !buffer.has(index) && !d.in_flight_set.contains(&index) && !d.failed.contains(&index)
            {
                return Some(index);
            }
        }
        None
    }

    fn publish(&self, d: &Dispatch) {
        let mut stats = lock(&self.monitor.shared.stats);
        stats.processing_fps = d.processing_fps;
        stats.average_fps = d.run_fps.get();
        stats.frame_skip = d.avg_frame_skip.get();
        stats.processing_delta = d.processing_delta;
        stats.biggest_completed = d.biggest_completed;
        stats.in_flight = d.in_flight.len();
        stats.busy_workers = d.pool.running();
    }

    fn shutdown(&self, mut d: Dispatch) {
        d.pool.cancel_queued();
        let deadline = Instant::now() + self.drain_timeout;
        while let Some((index, handle)) = d.in_flight.pop_front() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match handle.wait_timeout(remaining) {
                TaskState::Ready(completion) => self.complete(&mut d, completion),
                TaskState::Cancelled => self.forget(&mut d, index),
                TaskState::Pending => {
                    tracing::warn!("Scheduler: frame {} still running at shutdown", index)
                }
            }
        }
        self.publish(&d);
        d.pool.shutdown();
        self.monitor.shared.finished.set();
        tracing::info!(
            "Scheduler: exited (submitted={}, biggest completed={})",
            self.monitor.stats().submitted,
            d.biggest_completed
        );
    }
}
