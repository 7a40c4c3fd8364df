use crate::config::{
    default_execution_threads, PrepareFrames, DEFAULT_ENDPOINT, DEFAULT_JOIN_TIMEOUT_MS,
    DEFAULT_SUB_ENDPOINT, DEFAULT_TIMEOUT_MS,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Playback-synchronized frame processing", long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Source image handed to the frame processors
    #[arg(long, env = "FRAMECAST_SOURCE")]
    pub source: Option<PathBuf>,

    /// Target image, video, frame directory or `pattern:WxH@FPS:COUNT`
    #[arg(long, env = "FRAMECAST_TARGET")]
    pub target: Option<PathBuf>,

    /// Frame processors applied in order
    #[arg(long = "frame-processor", num_args = 1.., default_value = "FaceSwapper", env = "FRAMECAST_FRAME_PROCESSORS", value_delimiter = ',')]
    pub frame_processors: Vec<String>,

    #[arg(long, default_value_t = default_execution_threads(), env = "FRAMECAST_EXECUTION_THREADS")]
    pub execution_threads: usize,

    /// Render resolution in percent of the target resolution
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u8).range(1..=100), env = "FRAMECAST_QUALITY")]
    pub quality: u8,

    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u8).range(0..=100), env = "FRAMECAST_VOLUME")]
    pub volume: u8,

    /// 0 disables audio
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=1), env = "FRAMECAST_SOUND")]
    pub sound: u8,

    #[arg(long, default_value = crate::audio::DEFAULT_BACKEND, env = "FRAMECAST_AUDIO_BACKEND")]
    pub audio_backend: String,

    /// Frame buffer root [default: <system temp>/framecast]
    #[arg(long, env = "FRAMECAST_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_ENDPOINT, env = "FRAMECAST_ENDPOINT")]
    pub endpoint: String,

    #[arg(long, default_value = DEFAULT_SUB_ENDPOINT, env = "FRAMECAST_SUB_ENDPOINT")]
    pub sub_endpoint: String,

    /// Remote request timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS, env = "FRAMECAST_TIMEOUT")]
    pub timeout: u64,

    /// Extract video frames to disk before processing
    #[arg(long, value_enum, default_value = "auto", env = "FRAMECAST_PREPARE_FRAMES")]
    pub prepare_frames: PrepareFrames,

    /// How long to wait for worker threads on stop, in milliseconds
    #[arg(long, default_value_t = DEFAULT_JOIN_TIMEOUT_MS, env = "FRAMECAST_JOIN_TIMEOUT")]
    pub join_timeout: u64,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Play the target headless while processing frames ahead of playback
    Play {
        #[arg(long, default_value_t = 1)]
        position: u64,
    },
    /// Process every frame into the buffer without playback
    Process,
    /// Serve the model over the request and notification endpoints
    Serve,
    /// Send one request to a running server
    Remote {
        #[command(subcommand)]
        request: RemoteCommand,
    },
    /// Check the buffer of (source, target) for damaged or missing frames
    Check {
        /// Delete empty frame files so they get recomputed
        #[arg(long)]
        repair: bool,
    },
    /// List buffer directories under the temp dir
    Buffers,
}

#[derive(Subcommand, Debug, Clone)]
pub enum RemoteCommand {
    Metadata,
    Status,
    /// Fetch a processed frame and save it as PNG
    Frame {
        index: u64,
        #[arg(long)]
        out: PathBuf,
    },
    /// Start processing from a frame
    Start {
        #[arg(default_value_t = 1)]
        index: u64,
    },
    Stop,
    /// Print frame notifications until interrupted
    Watch {
        /// Exit after this many frames
        #[arg(long)]
        count: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["framecast", "process"]).unwrap();
        let config = Config::from_args(&args.global);
        assert_eq!(config.frame_processors, vec!["FaceSwapper"]);
        assert_eq!(config.quality, 100);
        assert!(config.sound);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.prepare_frames, PrepareFrames::Auto);
        assert!(matches!(args.command, Command::Process));
    }

    #[test]
    fn test_global_flags() {
        let args = Args::try_parse_from([
            "framecast",
            "--target",
            "clip.mp4",
            "--frame-processor",
            "Grayscale",
            "Invert",
            "--quality",
            "50",
            "--sound",
            "0",
            "--prepare-frames",
            "1",
            "--temp-dir",
            "/tmp/fc",
            "play",
            "--position",
            "7",
        ])
        .unwrap();
        let config = Config::from_args(&args.global);
        assert_eq!(config.target, Some(PathBuf::from("clip.mp4")));
        assert_eq!(config.frame_processors, vec!["Grayscale", "Invert"]);
        assert_eq!(config.quality, 50);
        assert!(!config.sound);
        assert_eq!(config.prepare_frames, PrepareFrames::On);
        assert_eq!(config.temp_dir, PathBuf::from("/tmp/fc"));
        assert!(matches!(args.command, Command::Play { position: 7 }));
    }

    #[test]
    fn test_out_of_range_quality_rejected() {
        assert!(Args::try_parse_from(["framecast", "--quality", "0", "process"]).is_err());
        assert!(Args::try_parse_from(["framecast", "--sound", "2", "process"]).is_err());
    }

    #[test]
    fn test_remote_frame() {
        let args =
            Args::try_parse_from(["framecast", "remote", "frame", "3", "--out", "f.png"]).unwrap();
        match args.command {
            Command::Remote {
                request: RemoteCommand::Frame { index, out },
            } => {
                assert_eq!(index, 3);
                assert_eq!(out, PathBuf::from("f.png"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
