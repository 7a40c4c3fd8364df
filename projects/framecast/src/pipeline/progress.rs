use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

pub const STAGE_EXTRACT: &str = "extract";
pub const STAGE_TRANSFORM: &str = "transform";
pub const STAGE_BUFFER: &str = "buffer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    Processing,
    Processed,
    Failed,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct StageProgress {
    pub current: u64,
    pub total: u64,
    pub ms_per_frame: f64,
}

#[derive(Debug)]
struct Counters {
    total_frames: u64,
    frames: BTreeMap<u64, FrameStatus>,
    stages: BTreeMap<String, StageProgress>,
    processing_fps: f64,
    start_time: Instant,
}

impl Counters {
    fn new(total_frames: u64) -> Self {
        let stages = [STAGE_EXTRACT, STAGE_TRANSFORM, STAGE_BUFFER]
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    StageProgress {
                        total: total_frames,
                        ..StageProgress::default()
                    },
                )
            })
            .collect();
        Self {
            total_frames,
            frames: BTreeMap::new(),
            stages,
            processing_fps: 0.0,
            start_time: Instant::now(),
        }
    }
}

/// Progress of a processing session, shared between the scheduler, the
/// workers and whoever renders progress (CLI bar, `GET_STATUS`).
#[derive(Debug)]
pub struct ProcessingState {
    pub is_active: AtomicBool,
    counters: RwLock<Counters>,
}

impl ProcessingState {
    pub fn new(total_frames: u64) -> Self {
        Self {
            is_active: AtomicBool::new(false),
            counters: RwLock::new(Counters::new(total_frames)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Counters> {
        self.counters.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Counters> {
        self.counters.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new session over `total_frames`, forgetting per-frame state.
    pub fn reset(&self, total_frames: u64) {
        *self.write() = Counters::new(total_frames);
    }

    pub fn set_active(&self, active: bool) {
        self.is_active.store(active, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Relaxed)
    }

    pub fn set_frame_status(&self, index: u64, status: FrameStatus) {
        self.write().frames.insert(index, status);
    }

    /// Forgets a frame that was queued but never ran.
    pub fn clear_frame_status(&self, index: u64) {
        self.write().frames.remove(&index);
    }

    pub fn frame_status(&self, index: u64) -> Option<FrameStatus> {
        self.read().frames.get(&index).copied()
    }

    pub fn count(&self, status: FrameStatus) -> u64 {
        self.read().frames.values().filter(|s| **s == status).count() as u64
    }

    pub fn total_frames(&self) -> u64 {
        self.read().total_frames
    }

    /// Advances a stage by one frame and folds `ms` into its smoothed cost.
    pub fn update_stage(&self, stage: &str, ms: f64) {
        let mut counters = self.write();
        if let Some(progress) = counters.stages.get_mut(stage) {
            progress.current += 1;
            if progress.ms_per_frame == 0.0 {
                progress.ms_per_frame = ms;
            } else {
                progress.ms_per_frame = progress.ms_per_frame * 0.9 + ms * 0.1;
            }
        }
    }

    pub fn stage(&self, stage: &str) -> Option<StageProgress> {
        self.read().stages.get(stage).cloned()
    }

    pub fn set_processing_fps(&self, fps: f64) {
        self.write().processing_fps = fps;
    }

    pub fn processing_fps(&self) -> f64 {
        self.read().processing_fps
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let counters = self.read();

        let processed = counters
            .frames
            .values()
            .filter(|s| **s == FrameStatus::Processed)
            .count();
        let processing = counters
            .frames
            .values()
            .filter(|s| **s == FrameStatus::Processing)
            .count();
        let failed = counters
            .frames
            .values()
            .filter(|s| **s == FrameStatus::Failed)
            .count();

        let elapsed = counters.start_time.elapsed().as_secs_f64();
        let effective_fps = if elapsed > 0.0 {
            processed as f64 / elapsed
        } else {
            0.0
        };

        let stages_json: BTreeMap<String, serde_json::Value> = counters
            .stages
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    serde_json::json!({
                        "current": v.current,
                        "total": v.total,
                        "ms_per_frame": v.ms_per_frame,
                        "fps": if v.ms_per_frame > 0.0 { 1000.0 / v.ms_per_frame } else { 0.0 }
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "total_frames": counters.total_frames,
            "is_active": self.is_active(),
            "processed": processed,
            "processing": processing,
            "failed": failed,
            "stages": stages_json,
            "processing_fps": counters.processing_fps,
            "effective_fps": effective_fps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_status_counts() {
        let state = ProcessingState::new(10);
        state.set_frame_status(1, FrameStatus::Processing);
        state.set_frame_status(2, FrameStatus::Processing);
        state.set_frame_status(1, FrameStatus::Processed);
        state.set_frame_status(3, FrameStatus::Failed);
        assert_eq!(state.count(FrameStatus::Processed), 1);
        assert_eq!(state.count(FrameStatus::Processing), 1);
        assert_eq!(state.count(FrameStatus::Failed), 1);
        assert_eq!(state.frame_status(2), Some(FrameStatus::Processing));
        assert_eq!(state.frame_status(9), None);
    }

    #[test]
    fn test_stage_smoothing() {
        let state = ProcessingState::new(10);
        state.update_stage(STAGE_TRANSFORM, 100.0);
        state.update_stage(STAGE_TRANSFORM, 200.0);
        let stage = state.stage(STAGE_TRANSFORM).unwrap();
        assert_eq!(stage.current, 2);
        assert_eq!(stage.total, 10);
        assert!((stage.ms_per_frame - 110.0).abs() < 1e-9);
        state.update_stage("unknown", 1.0);
        assert!(state.stage("unknown").is_none());
    }

    #[test]
    fn test_progress_json_and_reset() {
        let state = ProcessingState::new(4);
        state.set_active(true);
        state.set_frame_status(1, FrameStatus::Processed);
        state.set_processing_fps(12.5);
        let json = state.to_progress_json();
        assert_eq!(json["total_frames"], 4);
        assert_eq!(json["processed"], 1);
        assert_eq!(json["is_active"], true);
        assert_eq!(json["processing_fps"], 12.5);
        assert!(json["stages"]["buffer"].is_object());

        state.reset(20);
        assert_eq!(state.total_frames(), 20);
        assert_eq!(state.count(FrameStatus::Processed), 0);
    }
}
