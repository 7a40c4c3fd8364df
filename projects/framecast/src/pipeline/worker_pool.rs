// Fixed-size pool of OS threads fed through a crossbeam channel.
//
// Each submission gets a one-shot result channel. Queued jobs carry the
// cancellation generation they were submitted under; `cancel_queued` bumps
// the generation so workers drop everything still waiting in the queue,
// while jobs already running finish normally.

use crate::frame::scale_quality;
use crate::pipeline::progress::{
    FrameStatus, ProcessingState, STAGE_BUFFER, STAGE_EXTRACT, STAGE_TRANSFORM,
};
use crate::pipeline::timeline::Timeline;
use crate::transform::TransformChain;
use crate::video::{Extracted, FrameHandler};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queued {
    generation: u64,
    job: Job,
}

/// Result slot of a submitted job.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

#[derive(Debug, PartialEq)]
pub enum TaskState<T> {
    Ready(T),
    Pending,
    /// Dropped from the queue before it ran, or the job panicked.
    Cancelled,
}

impl<T> TaskHandle<T> {
    pub fn try_get(&self) -> TaskState<T> {
        match self.rx.try_recv() {
            Ok(value) => TaskState::Ready(value),
            Err(TryRecvError::Empty) => TaskState::Pending,
            Err(TryRecvError::Disconnected) => TaskState::Cancelled,
        }
    }

    /// Blocks until the job finishes. `None` if it never ran.
    pub fn wait(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> TaskState<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => TaskState::Ready(value),
            Err(RecvTimeoutError::Timeout) => TaskState::Pending,
            Err(RecvTimeoutError::Disconnected) => TaskState::Cancelled,
        }
    }
}

pub struct WorkerPool {
    tx: Option<Sender<Queued>>,
    workers: Vec<JoinHandle<()>>,
    generation: Arc<AtomicU64>,
    running: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = channel::unbounded::<Queued>();
        let generation = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let workers = (0..size)
            .map(|id| {
                let rx = rx.clone();
                let generation = generation.clone();
                let running = running.clone();
                thread::spawn(move || worker_loop(id, rx, generation, running))
            })
            .collect();

        tracing::debug!("WorkerPool: started {} workers", size);
        Self {
            tx: Some(tx),
            workers,
            generation,
            running,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently executing (not counting queued ones).
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    pub fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = channel::bounded(1);
        let job: Job = Box::new(move || {
            let _ = result_tx.send(f());
        });
        let queued = Queued {
            generation: self.generation.load(Ordering::Acquire),
            job,
        };
        if let Some(tx) = &self.tx {
            if tx.send(queued).is_err() {
                tracing::warn!("WorkerPool: submit after shutdown");
            }
        }
        TaskHandle { rx: result_rx }
    }

    /// Drops every job that has not started yet.
    pub fn cancel_queued(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Cancels queued jobs, lets running ones finish and joins the threads.
    pub fn shutdown(&mut self) {
        self.cancel_queued();
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("WorkerPool: worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    id: usize,
    rx: Receiver<Queued>,
    generation: Arc<AtomicU64>,
    running: Arc<AtomicUsize>,
) {
    for queued in rx {
        if queued.generation < generation.load(Ordering::Acquire) {
            // Dropping the job drops its result sender.
            continue;
        }
        running.fetch_add(1, Ordering::Relaxed);
        if catch_unwind(AssertUnwindSafe(queued.job)).is_err() {
            tracing::error!("WorkerPool: job panicked on worker {}", id);
        }
        running.fetch_sub(1, Ordering::Relaxed);
    }
    tracing::debug!("WorkerPool: worker {} finished", id);
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionStatus {
    Added,
    /// The handler has no such frame; nothing was stored.
    OutOfRange,
    Failed(String),
}

/// Outcome of one frame task.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub index: u64,
    pub duration: Duration,
    pub status: CompletionStatus,
}

/// Extract, scale, transform and store a single frame.
pub struct FrameTask {
    pub handler: Arc<dyn FrameHandler>,
    pub chain: Arc<TransformChain>,
    pub timeline: Arc<Timeline>,
    pub quality: Arc<AtomicU8>,
    pub progress: Arc<ProcessingState>,
}

impl FrameTask {
    /// Never fails: errors are logged and reported in the completion.
    pub fn run(&self, index: u64) -> Completion {
        let started = Instant::now();
        let status = match self.process(index) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Frame {} skipped: {}", index, e);
                CompletionStatus::Failed(e.to_string())
            }
        };
        Completion {
            index,
            duration: started.elapsed(),
            status,
        }
    }

    fn process(&self, index: u64) -> crate::error::Result<CompletionStatus> {
        let t0 = Instant::now();
        let nf = match self.handler.extract_frame(index)? {
            Extracted::Frame(nf) => nf,
            Extracted::OutOfRange {
                index,
                frames_count,
            } => {
                tracing::debug!("Frame {} is past the last frame {}", index, frames_count);
                return Ok(CompletionStatus::OutOfRange);
            }
        };
        self.progress
            .update_stage(STAGE_EXTRACT, t0.elapsed().as_secs_f64() * 1000.0);

        let t1 = Instant::now();
        let quality = self.quality.load(Ordering::Relaxed);
        let mut nf = nf.map_frame(|frame| scale_quality(frame, quality));
        nf.frame = self.chain.apply(nf.frame)?;
        self.progress
            .update_stage(STAGE_TRANSFORM, t1.elapsed().as_secs_f64() * 1000.0);

        let t2 = Instant::now();
        self.timeline.add(&nf)?;
        self.progress
            .update_stage(STAGE_BUFFER, t2.elapsed().as_secs_f64() * 1000.0);
        Ok(CompletionStatus::Added)
    }

    pub fn submit(self: &Arc<Self>, pool: &WorkerPool, index: u64) -> TaskHandle<Completion> {
        self.progress.set_frame_status(index, FrameStatus::Processing);
        let task = self.clone();
        pool.submit(move || task.run(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FramecastError;
    use crate::frame::Frame;
    use crate::transform::FrameTransform;
    use crate::video::PatternHandler;
    use std::sync::Barrier;

    #[test]
    fn test_submit_returns_results() {
        let pool = WorkerPool::new(2);
        let handles: Vec<_> = (0..8u64).map(|i| pool.submit(move || i * i)).collect();
        let results: Vec<u64> = handles.iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
    }

    #[test]
    fn test_at_most_size_jobs_run_at_once() {
        let pool = WorkerPool::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let peak = peak.clone();
                let current = current.clone();
                pool.submit(move || {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in &handles {
            h.wait().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_cancel_queued_spares_running_jobs() {
        let pool = WorkerPool::new(1);
        let gate = Arc::new(Barrier::new(2));
        let running = {
            let gate = gate.clone();
            pool.submit(move || {
                gate.wait();
                thread::sleep(Duration::from_millis(20));
                "ran"
            })
        };
        let queued = pool.submit(|| "queued");
        gate.wait();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.running(), 1);
        pool.cancel_queued();
        assert_eq!(running.wait(), Some("ran"));
        assert_eq!(queued.wait(), None);
        assert_eq!(queued.try_get(), TaskState::Cancelled);
        assert_eq!(pool.running(), 0);
    }

    #[test]
    fn test_panicking_job_is_cancelled_not_fatal() {
        let pool = WorkerPool::new(1);
        let bad = pool.submit(|| -> u32 { panic!("boom") });
        let good = pool.submit(|| 7u32);
        assert_eq!(bad.wait(), None);
        assert_eq!(good.wait(), Some(7));
    }

    struct Reject;

    impl FrameTransform for Reject {
        fn name(&self) -> &str {
            "Reject"
        }

        fn apply(&self, _frame: Frame) -> crate::error::Result<Frame> {
            Err(FramecastError::transform("rejected"))
        }
    }

    fn task(dir: &std::path::Path, chain: TransformChain, quality: u8) -> Arc<FrameTask> {
        let handler = Arc::new(PatternHandler::new(64, 32, 10.0, 5));
        let timeline = Arc::new(
            Timeline::load(dir, "_", "pattern.mp4", 0.1, 1, 5).unwrap(),
        );
        Arc::new(FrameTask {
            handler,
            chain: Arc::new(chain),
            timeline,
            quality: Arc::new(AtomicU8::new(quality)),
            progress: Arc::new(ProcessingState::new(5)),
        })
    }

    #[test]
    fn test_frame_task_adds_scaled_frame() {
        let temp = tempfile::tempdir().unwrap();
        let task = task(temp.path(), TransformChain::default(), 50);
        let pool = WorkerPool::new(1);
        let completion = task.submit(&pool, 2).wait().unwrap();
        assert_eq!(completion.index, 2);
        assert_eq!(completion.status, CompletionStatus::Added);
        let nf = task.timeline.get_frame_by_index(2).unwrap();
        assert_eq!(nf.shape(), (16, 32, 3));
        assert_eq!(task.timeline.last_added(), 2);
        assert_eq!(task.progress.stage(STAGE_BUFFER).unwrap().current, 1);
    }

    #[test]
    fn test_frame_task_out_of_range_and_failure_do_not_add() {
        let temp = tempfile::tempdir().unwrap();
        let task = task(temp.path(), TransformChain::new(vec![Box::new(Reject)]), 100);
        let out = task.run(6);
        assert_eq!(out.status, CompletionStatus::OutOfRange);
        let failed = task.run(1);
        assert!(matches!(failed.status, CompletionStatus::Failed(ref m) if m.contains("rejected")));
        assert!(task.timeline.buffer().is_empty());
    }
}
