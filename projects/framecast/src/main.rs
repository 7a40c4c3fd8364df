use anyhow::{Context, Result};
use clap::Parser;
use framecast::cli::{Args, Command, RemoteCommand};
use framecast::config::Config;
use framecast::error::FramecastError;
use framecast::model::{path_id, ProcessingModel, NO_SOURCE_ID};
use framecast::pipeline::buffer::FrameBuffer;
use framecast::pipeline::integrity;
use framecast::pipeline::manifest::list_buffers;
use framecast::remote::{NotificationMessage, RemoteClient, RemoteModel, RemoteServer};
use framecast::status::CountingSink;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_INVALID_ARGUMENT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let invalid = e.chain().any(|cause| {
                matches!(
                    cause.downcast_ref::<FramecastError>(),
                    Some(FramecastError::InvalidArgument(_))
                )
            });
            if invalid {
                ExitCode::from(EXIT_INVALID_ARGUMENT)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::from_args(&args.global);
    match args.command {
        Command::Play { position } => play(config, position).await,
        Command::Process => process(config).await,
        Command::Serve => serve(config).await,
        Command::Remote { request } => remote(&config, request).await,
        Command::Check { repair } => check(&config, repair),
        Command::Buffers => buffers(&config),
    }
}

fn require_target(config: &Config) -> Result<()> {
    if config.target.is_none() {
        return Err(FramecastError::invalid("--target is required for this command").into());
    }
    Ok(())
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} fps, {eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_model(config: Config) -> Result<ProcessingModel> {
    ProcessingModel::new(config).context("invalid configuration")
}

/// Flag set once Ctrl-C is received.
fn interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let set = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            set.store(true, Ordering::Relaxed);
        }
    });
    flag
}

async fn play(config: Config, position: u64) -> Result<()> {
    require_target(&config)?;
    let sink = CountingSink::new();
    let mut model = open_model(config)?.with_display(Box::new(sink.clone()));
    let metadata = model.metadata().context("cannot open target")?;
    info!(
        "Playing {}x{} @ {:.2} fps, {} frames",
        metadata.resolution.0, metadata.resolution.1, metadata.fps, metadata.frames_count
    );

    let pb = progress_bar(metadata.frames_count)?;
    let bar = pb.clone();
    model.on_frame_processed(Arc::new(move |_| bar.inc(1)));
    model
        .play(position)
        .with_context(|| format!("cannot start playback at frame {position}"))?;

    let interrupted = interrupt_flag();
    tokio::task::spawn_blocking(move || -> framecast::Result<()> {
        while !model.wait_ended(Duration::from_millis(200)) {
            if interrupted.load(Ordering::Relaxed) {
                break;
            }
        }
        model.stop(true, false)
    })
    .await??;

    pb.finish();
    info!(
        "Displayed {} frames, last frame {}",
        sink.shown(),
        sink.last_index()
    );
    Ok(())
}

async fn process(config: Config) -> Result<()> {
    require_target(&config)?;
    let mut model = open_model(config)?;
    let frames_count = model.metadata().context("cannot open target")?.frames_count;

    let pb = progress_bar(frames_count)?;
    let bar = pb.clone();
    let running = model.running_flag();
    let interrupted = interrupt_flag();
    tokio::spawn(async move {
        while !interrupted.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        running.clear();
    });

    let monitor = tokio::task::spawn_blocking(move || {
        model.process_all(Some(Arc::new(move |_| bar.inc(1))))
    })
    .await??;

    pb.finish();
    let stats = monitor.stats();
    info!(
        "Processed {} frames ({} failed) at {:.2} fps",
        stats.completed, stats.failed, stats.average_fps
    );
    Ok(())
}

async fn serve(mut config: Config) -> Result<()> {
    // The server has no audio device.
    config.sound = false;
    let endpoint = config.endpoint.clone();
    let sub_endpoint = config.sub_endpoint.clone();
    let model = open_model(config)?;
    let server = RemoteServer::bind(model, &endpoint, &sub_endpoint)
        .await
        .with_context(|| format!("cannot start server on {endpoint} / {sub_endpoint}"))?;
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn remote(config: &Config, request: RemoteCommand) -> Result<()> {
    let mut remote = RemoteModel::new(RemoteClient::from_config(config));
    match request {
        RemoteCommand::Metadata => print_json(&remote.metadata().await?)?,
        RemoteCommand::Status => print_json(&remote.status().await?)?,
        RemoteCommand::Frame { index, out } => {
            let nf = remote.frame(index).await?;
            nf.frame
                .save(&out)
                .with_context(|| format!("cannot write {}", out.display()))?;
            info!("Saved frame {} to {}", nf.index, out.display());
        }
        RemoteCommand::Start { index } => remote.play(index).await?,
        RemoteCommand::Stop => remote.stop().await?,
        RemoteCommand::Watch { count } => {
            let stream = remote.client().notifications().await?;
            tokio::pin!(stream);
            let mut frames = 0;
            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(notification) => {
                            let notification = notification?;
                            print_json(&notification)?;
                            if matches!(notification, NotificationMessage::NtfFrame { .. }) {
                                frames += 1;
                                if count == Some(frames) {
                                    break;
                                }
                            }
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }
    Ok(())
}

fn check(config: &Config, repair: bool) -> Result<()> {
    require_target(config)?;
    let mut model = open_model(config.clone())?;
    let frames_count = model.metadata().context("cannot open target")?.frames_count;
    let source_id = config
        .source
        .as_deref()
        .map(path_id)
        .unwrap_or_else(|| NO_SOURCE_ID.to_string());
    let target_id = config.target.as_deref().map(path_id).unwrap_or_default();
    let buffer = FrameBuffer::load(&config.temp_dir, &source_id, &target_id, frames_count)?;

    let report = integrity::check(&buffer)?;
    print_json(&report)?;
    if repair && !report.is_clean() {
        let removed = integrity::repair(&buffer, &report)?;
        info!("Removed {} empty frames", removed);
    }
    Ok(())
}

fn buffers(config: &Config) -> Result<()> {
    for manifest in list_buffers(&config.temp_dir)? {
        println!(
            "{}\t{} <- {}\t{} frames\t{}",
            manifest.buffer_dir.display(),
            manifest.target,
            manifest.source,
            manifest.frames_count,
            manifest.created_at.to_rfc3339()
        );
    }
    Ok(())
}
