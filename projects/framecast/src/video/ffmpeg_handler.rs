use super::{Extracted, FrameHandler, HandlerKind};
use crate::error::{FramecastError, Result};
use crate::frame::{Frame, NumberedFrame};
use ffmpeg_next::ffi;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Forward distance (in frames) below which decoding ahead beats seeking.
const SEEK_THRESHOLD: u64 = 50;

fn decode_err(context: &str, e: impl std::fmt::Display) -> FramecastError {
    FramecastError::decode(format!("{context}: {e}"))
}

// ---------------------------------------------------------------------------
// Decoder: sequential libav decoding with index-addressed seeking
// ---------------------------------------------------------------------------

struct Decoder {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Lazily created on first frame (source format is only known then).
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    width: u32,
    height: u32,
    fps: f64,
    time_base: f64,
    start_secs: f64,
    /// 0-based index of the next frame the decoder will emit, when known.
    next_frame: Option<u64>,
    reuse_packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
}

// SAFETY: the decoder is only reached through the handler's mutex, so the raw
// pointers inside ffmpeg-next types are never used from two threads at once.
unsafe impl Send for Decoder {}

impl Decoder {
    fn open(path: &Path) -> Result<(Self, u64)> {
        ffmpeg_next::init().map_err(|e| decode_err("failed to initialize FFmpeg", e))?;

        let input_ctx = ffmpeg_next::format::input(&path)
            .map_err(|e| decode_err(&format!("failed to open {:?}", path), e))?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| FramecastError::decode(format!("no video stream in {:?}", path)))?;
        let video_stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        let fps = if rational_fps.denominator() > 0 && rational_fps.numerator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            tracing::warn!("VideoHandler: could not determine FPS, defaulting to 30.0");
            30.0
        };

        let tb = video_stream.time_base();
        let time_base = if tb.denominator() > 0 {
            tb.numerator() as f64 / tb.denominator() as f64
        } else {
            1.0 / ffi::AV_TIME_BASE as f64
        };
        let start_secs = match video_stream.start_time() {
            ts if ts == ffi::AV_NOPTS_VALUE => 0.0,
            ts => ts as f64 * time_base,
        };

        let header_frames = video_stream.frames().max(0) as u64;
        let duration_secs = input_ctx.duration() as f64 / ffi::AV_TIME_BASE as f64;
        let estimated = if header_frames == 0 {
            (duration_secs * fps).round().max(0.0) as u64
        } else {
            header_frames
        };

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .map_err(|e| decode_err("failed to create decoder context", e))?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .map_err(|e| decode_err("failed to open video decoder", e))?;

        tracing::info!(
            "VideoHandler: opened {:?}, duration={:.2}s, fps={:.2}, stream_frames={}, estimated_total={}, {}x{}",
            path,
            duration_secs,
            fps,
            header_frames,
            estimated,
            decoder.width(),
            decoder.height()
        );

        Ok((
            Self {
                input_ctx,
                width: decoder.width(),
                height: decoder.height(),
                decoder,
                video_stream_index,
                scaler: None,
                fps,
                time_base,
                start_secs,
                next_frame: Some(0),
                reuse_packet: ffmpeg_next::codec::packet::Packet::empty(),
                eof_sent: false,
            },
            estimated,
        ))
    }

    fn seek_to_frame(&mut self, frame_num: u64) -> Result<()> {
        let time_secs = self.start_secs + frame_num as f64 / self.fps;
        let timestamp = (time_secs * ffi::AV_TIME_BASE as f64) as i64;
        self.input_ctx
            .seek(timestamp, ..timestamp)
            .map_err(|e| decode_err("failed to seek", e))?;
        self.decoder.flush();
        self.eof_sent = false;
        self.scaler = None;
        // A keyframe seek lands somewhere at or before the target.
        self.next_frame = None;
        Ok(())
    }

    /// Core decoding loop: pulls packets until the decoder yields a frame.
    fn decode_next(&mut self, target: &mut ffmpeg_next::util::frame::Video) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(decode_err("decoder error", e)),
            }

            let mut found_packet = false;
            while self.reuse_packet.read(&mut self.input_ctx).is_ok() {
                if self.reuse_packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.reuse_packet)
                        .map_err(|e| decode_err("failed to send packet", e))?;
                    found_packet = true;
                    break;
                }
            }
            if !found_packet {
                self.decoder
                    .send_eof()
                    .map_err(|e| decode_err("failed to send EOF", e))?;
                self.eof_sent = true;
            }
        }
    }

    fn frame_index_of(&self, frame: &ffmpeg_next::util::frame::Video) -> Option<u64> {
        let ts = frame.timestamp().or_else(|| frame.pts())?;
        let secs = ts as f64 * self.time_base - self.start_secs;
        Some((secs * self.fps).round().max(0.0) as u64)
    }

    /// Decodes the 0-based frame `target`. `Ok(None)` past the end of stream.
    fn read_frame(&mut self, target: u64) -> Result<Option<Frame>> {
        let needs_seek = match self.next_frame {
            Some(next) => target < next || target - next > SEEK_THRESHOLD,
            None => true,
        };
        if needs_seek {
            self.seek_to_frame(target)?;
        }

        let mut frame = ffmpeg_next::util::frame::Video::empty();
        loop {
            if !self.decode_next(&mut frame)? {
                self.next_frame = None;
                return Ok(None);
            }
            let index = self
                .frame_index_of(&frame)
                .or(self.next_frame)
                .unwrap_or(target);
            self.next_frame = Some(index + 1);
            if index >= target {
                return self.to_rgb(&frame).map(Some);
            }
        }
    }

    fn to_rgb(&mut self, frame: &ffmpeg_next::util::frame::Video) -> Result<Frame> {
        if self.scaler.is_none() {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                frame.format(),
                self.width,
                self.height,
                ffmpeg_next::format::Pixel::RGB24,
                self.width,
                self.height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| decode_err("failed to create scaler", e))?;
            self.scaler = Some(scaler);
        }
        let mut rgb = ffmpeg_next::util::frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler
                .run(frame, &mut rgb)
                .map_err(|e| decode_err("scaler failed", e))?;
        }

        // Rows are padded to `stride`; copy them out into a tight buffer.
        let width = rgb.width() as usize;
        let height = rgb.height() as usize;
        let stride = rgb.stride(0);
        let data = rgb.data(0);
        let mut pixels = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            let row = &data[y * stride..y * stride + width * 3];
            pixels.extend_from_slice(row);
        }
        Frame::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| FramecastError::decode("decoded frame has unexpected size"))
    }

    fn can_decode(&mut self, index: u64) -> bool {
        index > 0 && matches!(self.read_frame(index - 1), Ok(Some(_)))
    }

    /// Largest decodable 1-based index in `[1, upper]`, by binary search.
    fn probe_frame_count(&mut self, upper: u64) -> u64 {
        let (mut lo, mut hi) = (0u64, upper);
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.can_decode(mid) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo
    }
}

// ---------------------------------------------------------------------------
// VideoHandler
// ---------------------------------------------------------------------------

/// Video target decoded by libav through ffmpeg-next.
pub struct VideoHandler {
    path: PathBuf,
    fps: f64,
    frame_count: u64,
    resolution: (u32, u32),
    decoder: Mutex<Decoder>,
}

impl VideoHandler {
    pub fn open(path: &Path) -> Result<Self> {
        let (mut decoder, estimated) = Decoder::open(path)?;

        // Container headers lie about frame counts often enough that the
        // estimate is verified against what actually decodes.
        let frame_count = if estimated > 0 && decoder.can_decode(estimated) && !decoder.can_decode(estimated + 1) {
            estimated
        } else {
            let probed = decoder.probe_frame_count(estimated.max(1) * 2);
            tracing::info!(
                "VideoHandler: header frame count {} unreliable, probed {}",
                estimated,
                probed
            );
            probed
        };
        if frame_count == 0 {
            return Err(FramecastError::decode(format!(
                "no decodable frames in {:?}",
                path
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            fps: decoder.fps,
            frame_count,
            resolution: (decoder.width, decoder.height),
            decoder: Mutex::new(decoder),
        })
    }
}

impl FrameHandler for VideoHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Video
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn extract_frame(&self, index: u64) -> Result<Extracted> {
        if let Some(out) = self.out_of_range(index) {
            return Ok(out);
        }
        let mut decoder = self.decoder.lock().unwrap_or_else(PoisonError::into_inner);
        match decoder.read_frame(index - 1)? {
            Some(frame) => Ok(Extracted::Frame(
                NumberedFrame::new(index, frame).with_frame_time(self.frame_time()),
            )),
            None => Err(FramecastError::decode(format!(
                "frame {} of {:?} could not be decoded",
                index, self.path
            ))),
        }
    }
}
