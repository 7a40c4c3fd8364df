// Explicit configuration record threaded through constructors.

use crate::cli::GlobalArgs;
use crate::error::{FramecastError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "tcp://127.0.0.1:5555";
pub const DEFAULT_SUB_ENDPOINT: &str = "tcp://127.0.0.1:5556";
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 1000;

/// Whether raw video frames are extracted to disk before processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PrepareFrames {
    #[value(name = "0")]
    Off,
    #[value(name = "1")]
    On,
    #[value(name = "auto")]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: Option<PathBuf>,
    pub target: Option<PathBuf>,
    pub frame_processors: Vec<String>,
    pub execution_threads: usize,
    /// Render resolution in percent of the target resolution.
    pub quality: u8,
    pub volume: u8,
    pub sound: bool,
    pub audio_backend: String,
    pub temp_dir: PathBuf,
    pub endpoint: String,
    pub sub_endpoint: String,
    pub timeout_ms: u64,
    pub prepare_frames: PrepareFrames,
    pub join_timeout_ms: u64,
}

pub fn default_execution_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("framecast")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            frame_processors: vec!["FaceSwapper".to_string()],
            execution_threads: default_execution_threads(),
            quality: 100,
            volume: 100,
            sound: true,
            audio_backend: crate::audio::DEFAULT_BACKEND.to_string(),
            temp_dir: default_temp_dir(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            sub_endpoint: DEFAULT_SUB_ENDPOINT.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            prepare_frames: PrepareFrames::Auto,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn from_args(args: &GlobalArgs) -> Self {
        Self {
            source: args.source.clone(),
            target: args.target.clone(),
            frame_processors: args.frame_processors.clone(),
            execution_threads: args.execution_threads,
            quality: args.quality,
            volume: args.volume,
            sound: args.sound != 0,
            audio_backend: args.audio_backend.clone(),
            temp_dir: args.temp_dir.clone().unwrap_or_else(default_temp_dir),
            endpoint: args.endpoint.clone(),
            sub_endpoint: args.sub_endpoint.clone(),
            timeout_ms: args.timeout,
            prepare_frames: args.prepare_frames,
            join_timeout_ms: args.join_timeout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.quality) {
            return Err(FramecastError::invalid(format!(
                "quality must be in 1..=100, got {}",
                self.quality
            )));
        }
        if self.volume > 100 {
            return Err(FramecastError::invalid(format!(
                "volume must be in 0..=100, got {}",
                self.volume
            )));
        }
        if self.execution_threads == 0 {
            return Err(FramecastError::invalid("execution threads must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(FramecastError::invalid("timeout must be positive"));
        }
        if self.frame_processors.is_empty() {
            return Err(FramecastError::invalid("at least one frame processor is required"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Audio backend name actually used, honoring `sound = false`.
    pub fn effective_audio_backend(&self) -> &str {
        if self.sound {
            &self.audio_backend
        } else {
            crate::audio::NULL_BACKEND
        }
    }
}
