//! Video frame source backed by FFmpeg
//!
//! Opens a video container, reports its frame rate and frame count, and yields
//! decoded frames as RGB images one at a time, in decode order.
//!
//! Frames are pulled lazily: nothing is decoded until the caller asks for the
//! next frame, so a caller that stops early (cancelled request, truncated run)
//! never pays for the rest of the video.

pub mod temp_file;

use blade_inspect_common::{ProcessingError, Result, VideoStream};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

pub use temp_file::{suffix_for_upload, TempVideoFile};

/// A finite, non-restartable sequence of decoded RGB frames
///
/// Frames are yielded in presentation order of the decoder; their zero-based
/// position in the sequence is their frame index. A failure mid-stream is
/// yielded once as `Err`, after which the sequence ends.
pub trait FrameSource: Iterator<Item = Result<RgbImage>> {
    /// Timing metadata, available before the first frame is pulled
    fn stream(&self) -> VideoStream;
}

/// Initialize `FFmpeg` library
fn init_ffmpeg() -> Result<()> {
    static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| ffmpeg::init().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| ProcessingError::FFmpegError(format!("Failed to initialize FFmpeg: {e}")))
}

/// Decoder state for one opened video file
pub struct VideoFrameSource {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    stream_index: usize,
    stream: VideoStream,
    decoded: ffmpeg::util::frame::video::Video,
    converted: ffmpeg::util::frame::video::Video,
    input_exhausted: bool,
    finished: bool,
    frames_yielded: u64,
}

impl VideoFrameSource {
    /// Open a video container and probe its timing metadata
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The input file cannot be opened
    /// - No video stream is found
    /// - The decoder cannot be created
    /// - The reported frame rate is below one frame per second
    pub fn open(input_path: &Path) -> Result<Self> {
        init_ffmpeg()?;

        let input = ffmpeg::format::input(&input_path)
            .map_err(|e| ProcessingError::Decode(format!("Failed to open input file: {e}")))?;

        let (stream_index, frame_rate, total_frame_count, decoder) = {
            let video_stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or(ProcessingError::NoVideoStream)?;

            let fps = reported_frame_rate(video_stream.avg_frame_rate(), video_stream.rate());
            let frame_rate = whole_frame_rate(fps)?;

            let stream_duration_secs = if video_stream.duration() > 0 {
                Some(video_stream.duration() as f64 * f64::from(video_stream.time_base()))
            } else if input.duration() > 0 {
                Some(input.duration() as f64 / 1_000_000.0)
            } else {
                None
            };
            let total_frame_count =
                estimate_frame_count(video_stream.frames(), stream_duration_secs, fps);

            let decoder = ffmpeg::codec::context::Context::from_parameters(
                video_stream.parameters(),
            )
            .map_err(|e| ProcessingError::Decode(format!("Failed to create context: {e}")))?
            .decoder()
            .video()
            .map_err(|e| ProcessingError::Decode(format!("Failed to create decoder: {e}")))?;

            (video_stream.index(), frame_rate, total_frame_count, decoder)
        };

        let stream = VideoStream::new(frame_rate, total_frame_count)?;

        info!(
            "Opened {}: {}x{}, {} fps, {} frames, {:.2}s",
            input_path.display(),
            decoder.width(),
            decoder.height(),
            stream.frame_rate,
            stream.total_frame_count,
            stream.duration
        );

        Ok(Self {
            input,
            decoder,
            scaler: None,
            stream_index,
            stream,
            decoded: ffmpeg::util::frame::video::Video::empty(),
            converted: ffmpeg::util::frame::video::Video::empty(),
            input_exhausted: false,
            finished: false,
            frames_yielded: 0,
        })
    }

    /// Number of frames yielded so far
    #[must_use]
    pub fn frames_yielded(&self) -> u64 {
        self.frames_yielded
    }

    /// Feed the next packet of the video stream to the decoder
    fn feed_decoder(&mut self) -> Result<()> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    // Corrupt packets are skipped; the decoder resynchronises on the next one
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        warn!("Skipping undecodable packet: {}", e);
                        continue;
                    }
                    return Ok(());
                }
                Err(ffmpeg::Error::Eof) => {
                    self.input_exhausted = true;
                    self.decoder.send_eof().ok();
                    return Ok(());
                }
                Err(e) => {
                    return Err(ProcessingError::CorruptedFile(format!(
                        "Failed to read packet after frame {}: {e}",
                        self.frames_yielded
                    )));
                }
            }
        }
    }

    /// Convert the last decoded frame to an RGB image
    fn convert_decoded(&mut self) -> Result<RgbImage> {
        let width = self.decoded.width();
        let height = self.decoded.height();

        let needs_scaler = match &self.scaler {
            None => true,
            Some(scaler) => {
                scaler.input().width != width
                    || scaler.input().height != height
                    || scaler.input().format != self.decoded.format()
            }
        };
        if needs_scaler {
            debug!("Creating RGB24 scaler for {}x{} frames", width, height);
            self.scaler = Some(
                ffmpeg::software::scaling::Context::get(
                    self.decoded.format(),
                    width,
                    height,
                    ffmpeg::format::Pixel::RGB24,
                    width,
                    height,
                    ffmpeg::software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| ProcessingError::FFmpegError(format!("Failed to create scaler: {e}")))?,
            );
        }

        if let Some(scaler) = self.scaler.as_mut() {
            scaler
                .run(&self.decoded, &mut self.converted)
                .map_err(|e| ProcessingError::FFmpegError(format!("Failed to convert frame: {e}")))?;
        }

        let data = copy_rgb_rows(&self.converted);
        RgbImage::from_raw(width, height, data).ok_or_else(|| {
            ProcessingError::ImageError(format!(
                "Converted frame buffer does not match {width}x{height}"
            ))
        })
    }
}

impl Iterator for VideoFrameSource {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                let frame = self.convert_decoded();
                if frame.is_err() {
                    self.finished = true;
                } else {
                    self.frames_yielded += 1;
                }
                return Some(frame);
            }

            if self.input_exhausted {
                self.finished = true;
                debug!("Decoder drained after {} frames", self.frames_yielded);
                return None;
            }

            if let Err(e) = self.feed_decoder() {
                self.finished = true;
                return Some(Err(e));
            }
        }
        None
    }
}

impl FrameSource for VideoFrameSource {
    fn stream(&self) -> VideoStream {
        self.stream
    }
}

/// A frame source that owns the temporary file it decodes from
///
/// Field order matters: the decoder is dropped (closing the file) before the
/// temporary file is removed.
pub struct UploadedVideo {
    source: VideoFrameSource,
    file: TempVideoFile,
}

impl UploadedVideo {
    /// Persist `bytes` to a temporary file and open it for decoding
    ///
    /// The temporary file is removed before returning if opening fails.
    pub fn open(bytes: &[u8], suffix: &str) -> Result<Self> {
        Self::open_in(std::env::temp_dir(), bytes, suffix)
    }

    /// Like [`UploadedVideo::open`], with the temporary file placed in `dir`
    pub fn open_in(dir: impl AsRef<Path>, bytes: &[u8], suffix: &str) -> Result<Self> {
        let file = TempVideoFile::from_bytes_in(dir, bytes, suffix)?;
        match VideoFrameSource::open(file.path()) {
            Ok(source) => Ok(Self { source, file }),
            Err(e) => {
                file.close();
                Err(e)
            }
        }
    }

    /// Path of the backing temporary file
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Iterator for UploadedVideo {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        self.source.next()
    }
}

impl FrameSource for UploadedVideo {
    fn stream(&self) -> VideoStream {
        self.source.stream()
    }
}

/// Pick the container's average frame rate, falling back to the base rate
fn reported_frame_rate(average: ffmpeg::Rational, base: ffmpeg::Rational) -> f64 {
    let usable = |r: ffmpeg::Rational| r.numerator() > 0 && r.denominator() > 0;
    if usable(average) {
        f64::from(average)
    } else if usable(base) {
        f64::from(base)
    } else {
        0.0
    }
}

/// Truncate a reported frame rate to whole frames per second
///
/// A rate that truncates to zero would make every timestamp a division by
/// zero, so it is rejected as invalid input.
pub fn whole_frame_rate(fps: f64) -> Result<u32> {
    if !fps.is_finite() || fps < 1.0 {
        return Err(ProcessingError::InvalidFrameRate(fps));
    }
    Ok(fps.trunc().min(f64::from(u32::MAX)) as u32)
}

/// Frame count from the container, or estimated from duration and rate
pub fn estimate_frame_count(reported: i64, duration_secs: Option<f64>, fps: f64) -> u64 {
    if reported > 0 {
        return reported as u64;
    }
    match duration_secs {
        Some(secs) if secs.is_finite() && secs > 0.0 => (secs * fps).round() as u64,
        _ => 0,
    }
}

/// Copy an RGB24 frame into a contiguous buffer, dropping row padding
fn copy_rgb_rows(frame: &ffmpeg::util::frame::video::Video) -> Vec<u8> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let plane_data = frame.data(0);

    let mut data = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row_start = y * stride;
        let row_end = row_start + (width * 3);
        data.extend_from_slice(&plane_data[row_start..row_end]);
    }
    data
}
