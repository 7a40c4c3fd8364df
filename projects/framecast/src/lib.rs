pub mod audio;
pub mod cli;
pub mod config;
pub mod error;
pub mod frame;
pub mod model;
pub mod pipeline;
pub mod remote;
pub mod status;
pub mod transform;
pub mod video;

pub use config::Config;
pub use error::{FramecastError, Result};
pub use model::ProcessingModel;
