use std::path::PathBuf;

/// Convenience result type used across the pipeline.
pub type Result<T> = std::result::Result<T, FramecastError>;

/// Error taxonomy shared by the buffer, scheduler, model and remote layers.
#[derive(thiserror::Error, Debug)]
pub enum FramecastError {
    /// Requested index is not in `[1, frames_count]`.
    #[error("frame {index} is out of range [1, {frames_count}]")]
    OutOfRange { index: u64, frames_count: u64 },

    /// The media reader failed on a frame.
    #[error("decode error: {0}")]
    Decode(String),

    /// A frame transform failed.
    #[error("transform error: {0}")]
    Transform(String),

    /// Buffer or media file IO failed.
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Playback reached the end of the timeline.
    #[error("end of stream: frame {index} is past {end}")]
    EndOfStream { index: u64, end: u64 },

    /// Remote request timed out or the socket failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote server answered with `status = error`.
    #[error("remote error: {0}")]
    Remote(String),

    /// Programmer or user error at setup time.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FramecastError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Errors after which a remote client should drop and recreate its
    /// request connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }
}
