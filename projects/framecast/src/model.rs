// Processing model
//
// Owns the handler, transform chain, timeline, scheduler and player of one
// (source, target) pair and exposes them as a single object. Components are
// created lazily on the first call that needs a valid target; threads exist
// only between `play` and `stop`.

use crate::audio::{create_backend, AudioBackend};
use crate::config::{Config, PrepareFrames};
use crate::error::{FramecastError, Result};
use crate::frame::{render_resolution, scale_quality, NumberedFrame};
use crate::pipeline::events::{Event, TaggedEvent};
use crate::pipeline::player::Player;
use crate::pipeline::progress::ProcessingState;
use crate::pipeline::scheduler::{FrameReadyCallback, ScheduleMode, Scheduler, SchedulerMonitor};
use crate::pipeline::timeline::Timeline;
use crate::pipeline::worker_pool::FrameTask;
use crate::status::{FrameSink, LogStatus, NullSink, StatusSink};
use crate::transform::{TransformChain, TransformRegistry};
use crate::video::prepare::{prepare_frames, prepared_dir};
use crate::video::{open_handler, FrameHandler, HandlerKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Id used for the buffer directory when no source is set.
pub const NO_SOURCE_ID: &str = "_";

const JOIN_POLL: Duration = Duration::from_millis(5);

pub type HandlerFactory = Arc<dyn Fn(&Path) -> Result<Arc<dyn FrameHandler>> + Send + Sync>;

pub type SharedAudio = Arc<Mutex<Box<dyn AudioBackend>>>;

pub type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

impl FrameSink for SharedSink {
    fn show(&mut self, index: u64, frame: &crate::frame::Frame) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .show(index, frame);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Idle,
    Previewing,
    Playing,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// `[width, height]`
    pub resolution: (u32, u32),
    pub render_resolution: (u32, u32),
    pub fps: f64,
    pub frames_count: u64,
    pub length_s: f64,
    pub frame_time: f64,
}

/// Basename of a path, used as a stable buffer directory id.
pub fn path_id(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Waits for a thread up to `timeout`. Returns whether it was joined.
fn join_with_timeout(name: &str, handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!("{} thread did not stop within {:?}, detaching", name, timeout);
            return false;
        }
        std::thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        tracing::error!("{} thread panicked", name);
    }
    true
}

struct Session {
    scheduler: Option<JoinHandle<()>>,
    player: Option<JoinHandle<()>>,
    monitor: SchedulerMonitor,
}

pub struct ProcessingModel {
    config: Config,
    registry: TransformRegistry,
    handler_factory: HandlerFactory,
    status: Arc<dyn StatusSink>,
    display: SharedSink,
    audio: SharedAudio,

    handler: Option<Arc<dyn FrameHandler>>,
    chain: Option<Arc<TransformChain>>,
    timeline: Option<Arc<Timeline>>,

    quality: Arc<AtomicU8>,
    position: Arc<AtomicU64>,
    running: Arc<Event>,
    rewind: Arc<TaggedEvent<u64>>,
    ended: Arc<Event>,
    progress: Arc<ProcessingState>,
    on_frame_ready: Option<FrameReadyCallback>,
    session: Option<Session>,
    state: ModelState,
}

impl ProcessingModel {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_registry(config, TransformRegistry::default())
    }

    pub fn with_registry(config: Config, registry: TransformRegistry) -> Result<Self> {
        config.validate()?;
        let mut audio = create_backend(config.effective_audio_backend())?;
        audio.set_volume(config.volume)?;
        let quality = Arc::new(AtomicU8::new(config.quality));
        Ok(Self {
            registry,
            handler_factory: Arc::new(|path: &Path| open_handler(path)),
            status: Arc::new(LogStatus),
            display: Arc::new(Mutex::new(Box::new(NullSink))),
            audio: Arc::new(Mutex::new(audio)),
            handler: None,
            chain: None,
            timeline: None,
            quality,
            position: Arc::new(AtomicU64::new(1)),
            running: Arc::new(Event::new()),
            rewind: Arc::new(TaggedEvent::new()),
            ended: Arc::new(Event::new()),
            progress: Arc::new(ProcessingState::new(0)),
            on_frame_ready: None,
            session: None,
            state: ModelState::Idle,
            config,
        })
    }

    pub fn with_handler_factory(mut self, factory: HandlerFactory) -> Self {
        self.handler_factory = factory;
        self
    }

    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn with_display(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.display = Arc::new(Mutex::new(sink));
        self
    }

    pub fn with_audio(mut self, audio: Box<dyn AudioBackend>) -> Self {
        self.audio = Arc::new(Mutex::new(audio));
        self
    }

    /// Called for every frame stored while playing.
    pub fn on_frame_processed(&mut self, callback: FrameReadyCallback) {
        self.on_frame_ready = Some(callback);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    /// True once playback ran past the last frame.
    pub fn has_ended(&self) -> bool {
        self.ended.is_set()
    }

    pub fn wait_ended(&self, timeout: Duration) -> bool {
        self.ended.wait_for(true, timeout)
    }

    pub fn source(&self) -> Option<&Path> {
        self.config.source.as_deref()
    }

    pub fn target(&self) -> Option<&Path> {
        self.config.target.as_deref()
    }

    pub fn quality(&self) -> u8 {
        self.quality.load(Ordering::Relaxed)
    }

    pub fn volume(&self) -> u8 {
        self.config.volume
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> Arc<ProcessingState> {
        self.progress.clone()
    }

    pub fn timeline(&self) -> Option<Arc<Timeline>> {
        self.timeline.clone()
    }

    pub fn scheduler_monitor(&self) -> Option<SchedulerMonitor> {
        self.session.as_ref().map(|s| s.monitor.clone())
    }

    pub fn is_playing(&self) -> bool {
        self.state == ModelState::Playing
    }

    fn source_id(&self) -> String {
        self.config
            .source
            .as_deref()
            .map(path_id)
            .unwrap_or_else(|| NO_SOURCE_ID.to_string())
    }

    fn target_path(&self) -> Result<PathBuf> {
        self.config
            .target
            .clone()
            .ok_or_else(|| FramecastError::invalid("no target set"))
    }

    /// Input handler for the target, created on first use.
    pub fn frame_handler(&mut self) -> Result<Arc<dyn FrameHandler>> {
        if let Some(handler) = &self.handler {
            return Ok(handler.clone());
        }
        let target = self.target_path()?;
        let handler = (self.handler_factory)(&target)?;
        let handler = self.maybe_prepare(handler, &target)?;
        tracing::info!(
            "Model: target {:?} opened as {:?} ({} frames @ {:.2} fps)",
            target,
            handler.kind(),
            handler.frame_count(),
            handler.fps()
        );
        self.handler = Some(handler.clone());
        Ok(handler)
    }

    fn maybe_prepare(
        &self,
        handler: Arc<dyn FrameHandler>,
        target: &Path,
    ) -> Result<Arc<dyn FrameHandler>> {
        let wanted = match self.config.prepare_frames {
            PrepareFrames::Off => false,
            PrepareFrames::On => {
                !matches!(handler.kind(), HandlerKind::Image | HandlerKind::Directory)
            }
            PrepareFrames::Auto => handler.kind() == HandlerKind::Video,
        };
        if !wanted {
            return Ok(handler);
        }
        let dir = prepared_dir(&self.config.temp_dir, &path_id(target));
        let prepared = prepare_frames(handler.as_ref(), &dir)?;
        Ok(Arc::new(prepared))
    }

    fn transform_chain(&mut self) -> Result<Arc<TransformChain>> {
        if let Some(chain) = &self.chain {
            return Ok(chain.clone());
        }
        let chain = Arc::new(self.registry.chain(&self.config)?);
        tracing::info!("Model: transform chain {:?}", chain.names());
        self.chain = Some(chain.clone());
        Ok(chain)
    }

    fn ensure_timeline(&mut self) -> Result<Arc<Timeline>> {
        if let Some(timeline) = &self.timeline {
            return Ok(timeline.clone());
        }
        let handler = self.frame_handler()?;
        let target = self.target_path()?;
        let frames_count = handler.frame_count();
        let start = self.position().clamp(1, frames_count.max(1));
        let timeline = Arc::new(Timeline::load(
            &self.config.temp_dir,
            &self.source_id(),
            &path_id(&target),
            handler.frame_time(),
            start,
            frames_count,
        )?);
        self.timeline = Some(timeline.clone());
        Ok(timeline)
    }

    pub fn metadata(&mut self) -> Result<Metadata> {
        let handler = self.frame_handler()?;
        let resolution = handler.resolution();
        Ok(Metadata {
            resolution,
            render_resolution: render_resolution(resolution, self.quality()),
            fps: handler.fps(),
            frames_count: handler.frame_count(),
            length_s: handler.length_secs(),
            frame_time: handler.frame_time(),
        })
    }

    fn check_index(&mut self, index: u64) -> Result<u64> {
        let frames_count = self.frame_handler()?.frame_count();
        if index == 0 || index > frames_count {
            return Err(FramecastError::OutOfRange {
                index,
                frames_count,
            });
        }
        Ok(frames_count)
    }

    pub fn set_source(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if !path.exists() {
            return Err(FramecastError::invalid(format!(
                "source {:?} does not exist",
                path
            )));
        }
        let resume = self.suspend()?;
        self.config.source = Some(path);
        self.timeline = None;
        if let Some(chain) = &self.chain {
            chain.reload(&self.config)?;
        }
        self.resume(resume)
    }

    pub fn set_target(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let resume = self.suspend()?;
        let previous = self.config.target.replace(path);
        self.handler = None;
        self.timeline = None;
        if let Err(e) = self.frame_handler() {
            self.config.target = previous;
            return Err(e);
        }
        self.resume(resume)
    }

    /// Stops a running session, remembering whether to restart it.
    fn suspend(&mut self) -> Result<Option<u64>> {
        if self.state == ModelState::Playing {
            let position = self.position();
            self.stop(true, false)?;
            Ok(Some(position))
        } else {
            Ok(None)
        }
    }

    fn resume(&mut self, resume: Option<u64>) -> Result<()> {
        match resume {
            Some(position) => {
                let frames_count = self.frame_handler()?.frame_count();
                self.play(position.clamp(1, frames_count.max(1)))
            }
            None => Ok(()),
        }
    }

    /// Only affects the resolution frames are rendered at from now on.
    pub fn set_quality(&mut self, quality: u8) -> Result<()> {
        if !(1..=100).contains(&quality) {
            return Err(FramecastError::invalid(format!(
                "quality must be in 1..=100, got {quality}"
            )));
        }
        self.quality.store(quality, Ordering::Relaxed);
        self.config.quality = quality;
        Ok(())
    }

    pub fn set_volume(&mut self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(FramecastError::invalid(format!(
                "volume must be in 0..=100, got {volume}"
            )));
        }
        self.config.volume = volume;
        lock(&self.audio).set_volume(volume)
    }

    pub fn rewind(&mut self, index: u64) -> Result<()> {
        self.check_index(index)?;
        if self.state == ModelState::Playing && self.has_ended() {
            self.stop(true, false)?;
        }
        self.position.store(index, Ordering::Relaxed);
        if self.state == ModelState::Playing {
            self.rewind.set(index);
            let frame_time = self.frame_handler()?.frame_time();
            let mut audio = lock(&self.audio);
            audio.seek((index - 1) as f64 * frame_time)?;
            return Ok(());
        }
        self.update_preview(false).map(|_| ())
    }

    /// Renders the frame at the current position synchronously, either raw
    /// or through the transform chain. Processed previews are stored.
    pub fn update_preview(&mut self, processed: bool) -> Result<NumberedFrame> {
        let handler = self.frame_handler()?;
        let index = self.position();
        self.check_index(index)?;
        let raw = handler.extract_frame(index)?.into_result()?;
        let nf = if processed {
            let chain = self.transform_chain()?;
            let timeline = self.ensure_timeline()?;
            let quality = self.quality();
            let mut nf = raw.map_frame(|frame| scale_quality(frame, quality));
            nf.frame = chain.apply(nf.frame)?;
            timeline.add(&nf)?;
            nf
        } else {
            raw
        };
        lock(&self.display).show(nf.index, &nf.frame);
        if self.state == ModelState::Idle {
            self.state = ModelState::Previewing;
        }
        Ok(nf)
    }

    pub fn play(&mut self, start: u64) -> Result<()> {
        let frames_count = self.check_index(start)?;
        if self.state == ModelState::Playing {
            self.stop(true, false)?;
        }
        let handler = self.frame_handler()?;
        let chain = self.transform_chain()?;
        let timeline = self.ensure_timeline()?;
        let frame_time = handler.frame_time();

        self.position.store(start, Ordering::Relaxed);
        self.rewind.clear();
        self.ended.clear();
        self.progress.reset(frames_count);
        self.progress.set_active(true);
        timeline.reload(frame_time, start, frames_count);
        timeline.start();

        {
            let mut audio = lock(&self.audio);
            audio.set_volume(self.config.volume)?;
            audio.seek((start - 1) as f64 * frame_time)?;
            audio.play()?;
        }

        self.running.set();
        let task = Arc::new(FrameTask {
            handler,
            chain,
            timeline: timeline.clone(),
            quality: self.quality.clone(),
            progress: self.progress.clone(),
        });
        let mut scheduler = Scheduler::new(
            task,
            self.config.execution_threads,
            self.running.clone(),
            self.rewind.clone(),
        )
        .with_start(start)
        .with_drain_timeout(self.config.join_timeout());
        if let Some(callback) = &self.on_frame_ready {
            scheduler = scheduler.on_frame_ready(callback.clone());
        }
        let monitor = scheduler.monitor();
        let scheduler = scheduler
            .spawn()
            .map_err(|e| FramecastError::io("framecast-scheduler", e))?;

        let player = Player::new(
            timeline.clone(),
            self.running.clone(),
            self.rewind.clone(),
            self.position.clone(),
            self.status.clone(),
            Box::new(self.display.clone()),
        )
        .on_end({
            let audio = self.audio.clone();
            let ended = self.ended.clone();
            let timeline = timeline.clone();
            Box::new(move || {
                if let Err(e) = lock(&audio).stop() {
                    tracing::warn!("Audio stop failed: {}", e);
                }
                timeline.stop();
                ended.set();
            })
        });
        let player = match player.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                self.running.clear();
                join_with_timeout("scheduler", scheduler, self.config.join_timeout());
                return Err(FramecastError::io("framecast-player", e));
            }
        };

        self.session = Some(Session {
            scheduler: Some(scheduler),
            player: Some(player),
            monitor,
        });
        self.state = ModelState::Playing;
        tracing::info!("Model: playing from frame {} of {}", start, frames_count);
        Ok(())
    }

    /// Stops audio and both threads. With `wait` the threads are joined
    /// (bounded by the join timeout); with `shutdown` the handler, chain and
    /// timeline are released too.
    pub fn stop(&mut self, wait: bool, shutdown: bool) -> Result<()> {
        if self.state == ModelState::Playing {
            self.state = ModelState::Stopping;
        }
        if let Err(e) = lock(&self.audio).stop() {
            tracing::warn!("Audio stop failed: {}", e);
        }
        self.running.clear();
        if let Some(timeline) = &self.timeline {
            timeline.stop();
        }

        if let Some(mut session) = self.session.take() {
            if wait {
                let timeout = self.config.join_timeout();
                if let Some(player) = session.player.take() {
                    join_with_timeout("player", player, timeout);
                }
                if let Some(scheduler) = session.scheduler.take() {
                    join_with_timeout("scheduler", scheduler, timeout);
                }
            }
        }
        self.progress.set_active(false);

        if shutdown {
            self.handler = None;
            self.chain = None;
            self.timeline = None;
        }
        self.state = ModelState::Idle;
        Ok(())
    }

    /// Stored frame at `index`, falling back to the closest earlier one.
    pub fn frame(&mut self, index: u64) -> Result<NumberedFrame> {
        self.check_index(index)?;
        let timeline = self.ensure_timeline()?;
        timeline.buffer().get(index, true).ok_or_else(|| {
            FramecastError::invalid(format!("frame {index} is not processed yet"))
        })
    }

    /// Picks up a frame stored by another process sharing the buffer
    /// directory. Returns whether the file was found.
    pub fn mark_frame_processed(&mut self, index: u64) -> Result<bool> {
        self.check_index(index)?;
        let timeline = self.ensure_timeline()?;
        Ok(timeline.buffer().refresh(index))
    }

    pub fn status_json(&self) -> serde_json::Value {
        let mut status = serde_json::json!({
            "state": self.state,
            "position": self.position(),
            "source": self.config.source,
            "target": self.config.target,
            "quality": self.quality(),
            "volume": self.config.volume,
            "ended": self.has_ended(),
            "progress": self.progress.to_progress_json(),
        });
        if let Some(timeline) = &self.timeline {
            status["last_added"] = timeline.last_added().into();
            status["last_requested"] = timeline.last_requested().into();
            status["last_returned"] = timeline.last_returned().into();
            status["frame_lag"] = timeline.frame_lag().into();
            status["display_frame_lag"] = timeline.display_frame_lag().into();
            status["stored"] = timeline.buffer().len().into();
        }
        if let Some(monitor) = self.scheduler_monitor() {
            if let Ok(stats) = serde_json::to_value(monitor.stats()) {
                status["scheduler"] = stats;
            }
        }
        status
    }

    /// Fills the buffer for every frame without playback and blocks until
    /// done or until `running` is cleared from another thread.
    pub fn process_all(&mut self, on_ready: Option<FrameReadyCallback>) -> Result<SchedulerMonitor> {
        if self.state == ModelState::Playing {
            self.stop(true, false)?;
        }
        let handler = self.frame_handler()?;
        let chain = self.transform_chain()?;
        let timeline = self.ensure_timeline()?;
        let frames_count = handler.frame_count();
        timeline.reload(handler.frame_time(), 1, frames_count);
        self.progress.reset(frames_count);
        self.progress.set_active(true);
        self.running.set();

        let task = Arc::new(FrameTask {
            handler,
            chain,
            timeline,
            quality: self.quality.clone(),
            progress: self.progress.clone(),
        });
        let mut scheduler = Scheduler::new(
            task,
            self.config.execution_threads,
            self.running.clone(),
            self.rewind.clone(),
        )
        .with_mode(ScheduleMode::Exhaustive)
        .with_drain_timeout(self.config.join_timeout());
        if let Some(callback) = on_ready.or_else(|| self.on_frame_ready.clone()) {
            scheduler = scheduler.on_frame_ready(callback);
        }
        let monitor = scheduler.monitor();
        scheduler.run();
        self.running.clear();
        self.progress.set_active(false);
        Ok(monitor)
    }

    /// Handle to clear from another thread to interrupt `process_all`.
    pub fn running_flag(&self) -> Arc<Event> {
        self.running.clone()
    }
}

impl Drop for ProcessingModel {
    fn drop(&mut self) {
        if self.session.is_some() {
            let _ = self.stop(true, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioEvent, LogAudio};
    use crate::status::CountingSink;
    use crate::video::PatternHandler;
    use image::{Rgb, RgbImage};
    use std::thread;

    const VIDEO: &str = "pattern:640x360@10:10";

    fn config(temp: &Path, processors: &[&str]) -> Config {
        Config {
            frame_processors: processors.iter().map(|s| s.to_string()).collect(),
            execution_threads: 4,
            temp_dir: temp.to_path_buf(),
            prepare_frames: PrepareFrames::Off,
            join_timeout_ms: 5000,
            ..Config::default()
        }
    }

    fn video_model(temp: &Path) -> ProcessingModel {
        let mut model = ProcessingModel::new(config(temp, &["Identity"])).unwrap();
        model.set_target(VIDEO).unwrap();
        model
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn test_image_to_image() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("source.jpg");
        let target = temp.path().join("target.png");
        RgbImage::from_pixel(861, 1080, Rgb([200, 120, 90]))
            .save(&source)
            .unwrap();
        RgbImage::from_pixel(861, 1080, Rgb([20, 40, 60]))
            .save(&target)
            .unwrap();

        let mut model = ProcessingModel::new(config(temp.path(), &["Identity"])).unwrap();
        model.set_source(&source).unwrap();
        model.set_target(&target).unwrap();
        assert_eq!(model.metadata().unwrap().frames_count, 1);
        assert_eq!(model.metadata().unwrap().fps, 1.0);

        let monitor = model.process_all(None).unwrap();
        assert_eq!(monitor.submissions(), vec![1]);

        let out = temp
            .path()
            .join("preview")
            .join("target.png")
            .join("source.jpg")
            .join("1.png");
        assert!(out.exists());
        let stored = image::open(&out).unwrap().to_rgb8();
        assert_eq!((stored.height(), stored.width()), (1080, 861));
    }

    #[test]
    fn test_preview_scrub_adds_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let sink = CountingSink::new();
        let mut model = ProcessingModel::new(config(temp.path(), &["Identity"]))
            .unwrap()
            .with_display(Box::new(sink.clone()));
        model.set_target(VIDEO).unwrap();

        model.rewind(5).unwrap();
        let nf = model.update_preview(false).unwrap();
        assert_eq!(nf.index, 5);
        assert_eq!(nf.frame, PatternHandler::new(640, 360, 10.0, 10).render(5));
        assert_eq!(sink.last_index(), 5);
        assert_eq!(model.state(), ModelState::Previewing);
        assert!(model.timeline().map(|t| t.buffer().is_empty()).unwrap_or(true));
    }

    #[test]
    fn test_processed_preview_is_stored() {
        let temp = tempfile::tempdir().unwrap();
        let mut model = ProcessingModel::new(config(temp.path(), &["Invert"])).unwrap();
        model.set_target(VIDEO).unwrap();
        model.set_quality(50).unwrap();
        model.rewind(2).unwrap();
        let nf = model.update_preview(true).unwrap();
        assert_eq!(nf.shape(), (180, 320, 3));
        assert_eq!(model.metadata().unwrap().render_resolution, (320, 180));
        assert!(model.timeline().unwrap().buffer().has(2));
    }

    #[test]
    fn test_play_from_start() {
        let temp = tempfile::tempdir().unwrap();
        let mut model = video_model(temp.path());
        model.play(1).unwrap();
        assert_eq!(model.state(), ModelState::Playing);

        thread::sleep(Duration::from_millis(1200));
        let timeline = model.timeline().unwrap();
        assert!(
            timeline.last_returned().unwrap_or(0) >= 10 || model.has_ended(),
            "last returned {:?}",
            timeline.last_returned()
        );
        assert!(wait_until(Duration::from_secs(10), || timeline.buffer().len() == 10));

        model.stop(true, false).unwrap();
        assert_eq!(model.state(), ModelState::Idle);
        assert_eq!(timeline.buffer().indices(), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_rewind_mid_play() {
        let temp = tempfile::tempdir().unwrap();
        let mut model = video_model(temp.path());
        model.play(1).unwrap();
        thread::sleep(Duration::from_millis(500));

        let monitor = model.scheduler_monitor().unwrap();
        let before = monitor.submissions().len();
        model.rewind(3).unwrap();
        let timeline = model.timeline().unwrap();
        assert!(wait_until(Duration::from_millis(400), || {
            timeline.last_requested() == 3
        }));

        thread::sleep(Duration::from_millis(100));
        model.stop(true, false).unwrap();
        let after = &monitor.submissions()[before..];
        assert!(after.iter().all(|i| *i >= 3), "{after:?}");
        assert_eq!(timeline.start_index(), 3);
    }

    #[test]
    fn test_stop_joins_threads_and_keeps_buffer() {
        let temp = tempfile::tempdir().unwrap();
        let mut model = video_model(temp.path());
        model.play(1).unwrap();
        thread::sleep(Duration::from_millis(150));
        model.stop(true, false).unwrap();
        assert!(model.session.is_none());
        let timeline = model.timeline().unwrap();
        assert!(timeline.buffer().path().exists());
        assert!(!model.progress().is_active());
    }

    #[test]
    fn test_out_of_range_indices() {
        let temp = tempfile::tempdir().unwrap();
        let mut model = video_model(temp.path());
        for index in [0, 11] {
            assert!(matches!(
                model.rewind(index),
                Err(FramecastError::OutOfRange {
                    frames_count: 10,
                    ..
                })
            ));
            assert!(matches!(
                model.play(index),
                Err(FramecastError::OutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_audio_follows_transitions() {
        let temp = tempfile::tempdir().unwrap();
        let audio = LogAudio::new();
        let journal = audio.journal();
        let mut model = ProcessingModel::new(config(temp.path(), &["Identity"]))
            .unwrap()
            .with_audio(Box::new(audio));
        model.set_target(VIDEO).unwrap();
        model.set_volume(40).unwrap();
        model.play(5).unwrap();
        model.stop(true, false).unwrap();

        let events = journal.lock().unwrap().clone();
        assert_eq!(events.first(), Some(&AudioEvent::Volume(40)));
        assert!(events.contains(&AudioEvent::Play));
        let seek = events
            .iter()
            .find_map(|e| match e {
                AudioEvent::Seek(s) => Some(*s),
                _ => None,
            })
            .unwrap();
        assert!((seek - 0.4).abs() < 1e-9);
        assert_eq!(events.last(), Some(&AudioEvent::Stop));
    }

    #[test]
    fn test_unknown_processor_fails_when_processing() {
        let temp = tempfile::tempdir().unwrap();
        let mut model = ProcessingModel::new(config(temp.path(), &["FaceSwapper"])).unwrap();
        model.set_target(VIDEO).unwrap();
        assert!(matches!(
            model.play(1),
            Err(FramecastError::InvalidArgument(_))
        ));
        assert_eq!(model.state(), ModelState::Idle);
    }

    #[test]
    fn test_target_change_while_playing_restarts_at_position() {
        let temp = tempfile::tempdir().unwrap();
        let mut model = video_model(temp.path());
        model.play(4).unwrap();
        model.set_target("pattern:320x180@10:20").unwrap();
        assert_eq!(model.state(), ModelState::Playing);
        assert_eq!(model.metadata().unwrap().frames_count, 20);
        let timeline = model.timeline().unwrap();
        assert!(timeline.start_index() >= 4);
        assert!(timeline.buffer().path().ends_with("pattern:320x180@10:20/_"));
        model.stop(true, true).unwrap();
        assert!(model.timeline().is_none());
    }

    #[test]
    fn test_frame_lookup_and_mark_processed() {
        let temp = tempfile::tempdir().unwrap();
        let mut model = video_model(temp.path());
        assert!(matches!(
            model.frame(1),
            Err(FramecastError::InvalidArgument(_))
        ));
        let timeline = model.ensure_timeline().unwrap();
        let external = FrameBufferWriter::new(temp.path());
        external.write(3);
        assert!(!timeline.buffer().has(3));
        assert!(model.mark_frame_processed(3).unwrap());
        assert_eq!(model.frame(5).unwrap().index, 3);
        assert_eq!(timeline.buffer().miss(), 2);
    }

    #[test]
    fn test_directory_target_buffer_survives_reload() {
        let temp = tempfile::tempdir().unwrap();
        let frames = temp.path().join("frames");
        std::fs::create_dir_all(&frames).unwrap();
        for i in 0..10u8 {
            RgbImage::from_pixel(8, 6, Rgb([i * 10, 0, 0]))
                .save(frames.join(format!("{i:04}.png")))
                .unwrap();
        }

        {
            let mut model = ProcessingModel::new(config(temp.path(), &["Identity"])).unwrap();
            model.set_target(&frames).unwrap();
            let monitor = model.process_all(None).unwrap();
            assert_eq!(monitor.stats().completed, 10);
        }

        let mut model = ProcessingModel::new(config(temp.path(), &["Identity"])).unwrap();
        model.set_target(&frames).unwrap();
        let timeline = model.ensure_timeline().unwrap();
        assert_eq!(timeline.buffer().indices(), (1..=10).collect::<Vec<_>>());
        for i in 1..=10u64 {
            let nf = model.frame(i).unwrap();
            assert_eq!(nf.index, i);
            assert_eq!(nf.frame.get_pixel(0, 0), &Rgb([(i as u8 - 1) * 10, 0, 0]));
        }
        let monitor = model.process_all(None).unwrap();
        assert!(monitor.submissions().is_empty());
    }

    /// Writes frames into the shared buffer directory the way another
    /// process would.
    struct FrameBufferWriter {
        buffer: crate::pipeline::buffer::FrameBuffer,
    }

    impl FrameBufferWriter {
        fn new(temp: &Path) -> Self {
            let buffer = crate::pipeline::buffer::FrameBuffer::load(
                temp,
                NO_SOURCE_ID,
                VIDEO,
                10,
            )
            .unwrap();
            Self { buffer }
        }

        fn write(&self, index: u64) {
            self.buffer
                .add(&NumberedFrame::new(index, RgbImage::new(64, 36)))
                .unwrap();
        }
    }
}
