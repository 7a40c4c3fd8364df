// Audio collaborator
//
// Decoding and output of the target's soundtrack live outside the core; the
// model only drives transitions (seek, play, stop, volume) at the right
// moments.

use crate::error::{FramecastError, Result};
use std::sync::{Arc, Mutex, PoisonError};

pub const NULL_BACKEND: &str = "null";
pub const LOG_BACKEND: &str = "log";
pub const DEFAULT_BACKEND: &str = LOG_BACKEND;

pub trait AudioBackend: Send {
    fn name(&self) -> &str;
    fn play(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn seek(&mut self, position_secs: f64) -> Result<()>;
    fn set_volume(&mut self, volume: u8) -> Result<()>;
}

/// Accepts every call and does nothing.
#[derive(Debug, Default)]
pub struct NullAudio;

impl AudioBackend for NullAudio {
    fn name(&self) -> &str {
        NULL_BACKEND
    }

    fn play(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn seek(&mut self, _position_secs: f64) -> Result<()> {
        Ok(())
    }

    fn set_volume(&mut self, _volume: u8) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    Play,
    Stop,
    Seek(f64),
    Volume(u8),
}

/// Logs transitions and keeps a journal of them.
#[derive(Debug, Default, Clone)]
pub struct LogAudio {
    journal: Arc<Mutex<Vec<AudioEvent>>>,
}

impl LogAudio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of every call made so far.
    pub fn journal(&self) -> Arc<Mutex<Vec<AudioEvent>>> {
        self.journal.clone()
    }

    fn record(&self, event: AudioEvent) {
        tracing::debug!("audio: {:?}", event);
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl AudioBackend for LogAudio {
    fn name(&self) -> &str {
        LOG_BACKEND
    }

    fn play(&mut self) -> Result<()> {
        self.record(AudioEvent::Play);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.record(AudioEvent::Stop);
        Ok(())
    }

    fn seek(&mut self, position_secs: f64) -> Result<()> {
        self.record(AudioEvent::Seek(position_secs));
        Ok(())
    }

    fn set_volume(&mut self, volume: u8) -> Result<()> {
        self.record(AudioEvent::Volume(volume));
        Ok(())
    }
}

pub fn create_backend(name: &str) -> Result<Box<dyn AudioBackend>> {
    match name {
        NULL_BACKEND => Ok(Box::new(NullAudio)),
        LOG_BACKEND => Ok(Box::new(LogAudio::new())),
        other => Err(FramecastError::invalid(format!(
            "unknown audio backend '{}' (available: {}, {})",
            other, NULL_BACKEND, LOG_BACKEND
        ))),
    }
}
