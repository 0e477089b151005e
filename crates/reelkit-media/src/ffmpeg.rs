// crates/reelkit-media/src/ffmpeg.rs
//
// FFmpeg-backed movie reader (feature "ffmpeg"). One worker thread owns
// all demux/decoder/scaler state for the source; requests arrive on a
// channel and the worker polls it with the configured timeout.
//
// Seek policy: stream forward when the target lies within FORWARD_WINDOW
// ahead of the last decoded frame, otherwise re-open and keyframe-seek,
// then burn (decode-only, no scale) up to the target. Re-opening instead
// of flushing in place sidesteps seek soft-failures on some containers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{input, Pixel, Sample};
use ffmpeg::media::Type;
use ffmpeg::software::resampling;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};

use reelkit_core::{IoError, RationalTime, SeqPath, TimeRange};

use crate::audio::{Audio, AudioInfo};
use crate::future::{pair, Pending, Promise};
use crate::image::{Image, ImageInfo, PixelType};
use crate::plugin::{opt_millis, opt_usize, IoOptions, Plugin, VIDEO_AND_AUDIO};
use crate::reader::{AudioBlock, Info, Reader, VideoFrame, REQUEST_TIMEOUT};

pub const DEFAULT_THREAD_COUNT: usize = 4;

/// Targets at most this far ahead of the last decoded frame are reached by
/// streaming forward; beyond it a seek is cheaper.
const FORWARD_WINDOW_SECS: f64 = 2.0;

// ── Plugin ────────────────────────────────────────────────────────────────────

pub struct FFmpegPlugin;

impl Plugin for FFmpegPlugin {
    fn name(&self) -> &str {
        "FFmpeg"
    }

    fn extensions(&self) -> &[&str] {
        &["mov", "mp4", "m4v", "mkv", "webm", "avi", "mxf", "wav", "mp3", "aac", "flac"]
    }

    fn capabilities(&self) -> u8 {
        VIDEO_AND_AUDIO
    }

    fn read(&self, path: &SeqPath, options: &IoOptions) -> Result<Box<dyn Reader>, IoError> {
        Ok(Box::new(FFmpegReader::open(path.clone(), options)))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

struct CountGuard(Arc<AtomicUsize>);

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Request {
    Video {
        time:    RationalTime,
        layer:   u16,
        promise: Promise<VideoFrame>,
        _guard:  CountGuard,
    },
    Audio {
        range:   TimeRange,
        promise: Promise<AudioBlock>,
        _guard:  CountGuard,
    },
}

pub struct FFmpegReader {
    path:        SeqPath,
    tx:          Sender<Request>,
    drain:       Receiver<Request>,
    info:        Pending<Info>,
    outstanding: Arc<AtomicUsize>,
    stopped:     Arc<AtomicBool>,
    worker_live: Arc<AtomicBool>,
}

impl FFmpegReader {
    pub fn open(path: SeqPath, options: &IoOptions) -> FFmpegReader {
        let threads = opt_usize(options, "FFmpeg/ThreadCount", DEFAULT_THREAD_COUNT);
        let timeout = opt_millis(options, "FFmpeg/RequestTimeout", REQUEST_TIMEOUT);

        let (tx, rx) = unbounded::<Request>();
        let (info_promise, info_pending) = pair::<Info>();
        let stopped = Arc::new(AtomicBool::new(false));
        let worker_live = Arc::new(AtomicBool::new(true));

        {
            let path = path.clone();
            let rx = rx.clone();
            let stopped = Arc::clone(&stopped);
            let live = Arc::clone(&worker_live);
            thread::spawn(move || {
                run_worker(path, threads, timeout, info_promise, rx, stopped);
                live.store(false, Ordering::SeqCst);
            });
        }

        FFmpegReader {
            path,
            tx,
            drain: rx,
            info: info_pending,
            outstanding: Arc::new(AtomicUsize::new(0)),
            stopped,
            worker_live,
        }
    }

    fn enqueue(&self, request: Request) {
        if self.tx.send(request).is_err() {
            // Worker gone; the request's promise drops and cancels.
        }
    }
}

impl Reader for FFmpegReader {
    fn get_info(&self) -> Pending<Info> {
        self.info.clone()
    }

    fn read_video(&self, media_time: RationalTime, layer: u16) -> Pending<VideoFrame> {
        if self.stopped.load(Ordering::SeqCst) {
            return Pending::ready(Err(IoError::ReaderClosed));
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let (promise, pending) = pair::<VideoFrame>();
        self.enqueue(Request::Video {
            time: media_time,
            layer,
            promise,
            _guard: CountGuard(Arc::clone(&self.outstanding)),
        });
        pending
    }

    fn read_audio(&self, media_range: TimeRange) -> Pending<AudioBlock> {
        if self.stopped.load(Ordering::SeqCst) {
            return Pending::ready(Err(IoError::ReaderClosed));
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let (promise, pending) = pair::<AudioBlock>();
        self.enqueue(Request::Audio {
            range: media_range,
            promise,
            _guard: CountGuard(Arc::clone(&self.outstanding)),
        });
        pending
    }

    fn has_requests(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) > 0
    }

    fn cancel_requests(&self) {
        while let Ok(request) = self.drain.try_recv() {
            match request {
                Request::Video { promise, .. } => promise.fulfill(Err(IoError::Cancelled)),
                Request::Audio { promise, .. } => promise.fulfill(Err(IoError::Cancelled)),
            }
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        while let Ok(request) = self.drain.try_recv() {
            match request {
                Request::Video { promise, .. } => promise.fulfill(Err(IoError::ReaderClosed)),
                Request::Audio { promise, .. } => promise.fulfill(Err(IoError::ReaderClosed)),
            }
        }
    }

    fn has_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) && !self.worker_live.load(Ordering::SeqCst)
    }
}

impl Drop for FFmpegReader {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

fn run_worker(
    path: SeqPath,
    threads: usize,
    timeout: Duration,
    info_promise: Promise<Info>,
    rx: Receiver<Request>,
    stopped: Arc<AtomicBool>,
) {
    let mut source = match Source::open(&path, threads) {
        Ok(source) => {
            debug!(path = %path, "ffmpeg reader opened");
            info_promise.fulfill(Ok(source.info.clone()));
            Some(source)
        }
        Err(e) => {
            let error = IoError::OpenFailed { path: path.full(), reason: e.to_string() };
            warn!(path = %path, error = %e, "ffmpeg open failed");
            info_promise.fulfill(Err(error));
            None
        }
    };

    loop {
        if stopped.load(Ordering::SeqCst) {
            return;
        }
        let request = match rx.recv_timeout(timeout) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        if stopped.load(Ordering::SeqCst) {
            match request {
                Request::Video { promise, .. } => promise.fulfill(Err(IoError::ReaderClosed)),
                Request::Audio { promise, .. } => promise.fulfill(Err(IoError::ReaderClosed)),
            }
            continue;
        }
        match (&mut source, request) {
            (Some(source), Request::Video { time, layer, promise, _guard }) => {
                let result = source.read_video(time, layer).map_err(|e| {
                    IoError::DecodeFailed { path: source.path.full(), reason: e.to_string() }
                });
                promise.fulfill(result);
            }
            (Some(source), Request::Audio { range, promise, _guard }) => {
                let result = source.read_audio(range).map_err(|e| {
                    IoError::DecodeFailed { path: source.path.full(), reason: e.to_string() }
                });
                promise.fulfill(result);
            }
            (None, Request::Video { promise, .. }) => {
                promise.fulfill(Err(IoError::OpenFailed {
                    path:   path.full(),
                    reason: "source failed to open".to_string(),
                }));
            }
            (None, Request::Audio { promise, .. }) => {
                promise.fulfill(Err(IoError::OpenFailed {
                    path:   path.full(),
                    reason: "source failed to open".to_string(),
                }));
            }
        }
    }
}

// ── Decoder state ─────────────────────────────────────────────────────────────

struct VideoState {
    ictx:      ffmpeg::format::context::Input,
    decoder:   ffmpeg::decoder::video::Video,
    index:     usize,
    tb_num:    i32,
    tb_den:    i32,
    width:     u32,
    height:    u32,
    scaler:    SwsContext,
    last_pts:  i64,
}

struct AudioState {
    ictx:      ffmpeg::format::context::Input,
    decoder:   ffmpeg::decoder::audio::Audio,
    index:     usize,
    tb_num:    i32,
    tb_den:    i32,
    info:      AudioInfo,
    resampler: Option<resampling::Context>,
    /// Media seconds of the next undecoded sample; drives the seek-vs-
    /// stream-forward choice for audio.
    position:  f64,
}

struct Source {
    path:    SeqPath,
    threads: usize,
    video:   Option<VideoState>,
    audio:   Option<AudioState>,
    info:    Info,
}

impl Source {
    fn open(path: &SeqPath, threads: usize) -> Result<Source> {
        let probe = input(&path.full())?;
        let mut info = Info::default();
        for (key, value) in probe.metadata().iter() {
            info.tags.insert(key.to_string(), value.to_string());
        }

        let mut video = None;
        if let Some(stream) = probe.streams().best(Type::Video) {
            let state = VideoState::open(path, 0.0, threads)?;
            let rate = {
                let r = stream.avg_frame_rate();
                if r.denominator() > 0 && r.numerator() > 0 {
                    r.numerator() as f64 / r.denominator() as f64
                } else {
                    24.0
                }
            };
            let duration_secs = stream_duration_secs(&probe, stream.index());
            info.video = vec![ImageInfo::new(state.width, state.height, PixelType::Rgba8)];
            info.video_time = Some(TimeRange::from_frames(
                0.0,
                (duration_secs * rate).round(),
                rate,
            ));
            video = Some(state);
        }

        let mut audio = None;
        if let Some(stream) = probe.streams().best(Type::Audio) {
            match AudioState::open(path) {
                Ok(state) => {
                    let duration_secs = stream_duration_secs(&probe, stream.index());
                    info.audio = Some(state.info);
                    info.audio_time = Some(TimeRange::new(
                        RationalTime::new(0.0, state.info.sample_rate as f64),
                        RationalTime::from_seconds(
                            duration_secs,
                            state.info.sample_rate as f64,
                        ),
                    ));
                    audio = Some(state);
                }
                // A broken audio stream degrades the source to video-only.
                Err(e) => warn!(path = %path, error = %e, "audio stream unusable"),
            }
        }

        if video.is_none() && audio.is_none() {
            return Err(anyhow!("no decodable streams"));
        }

        Ok(Source { path: path.clone(), threads, video, audio, info })
    }

    fn read_video(&mut self, time: RationalTime, layer: u16) -> Result<VideoFrame> {
        let state = self.video.as_mut().ok_or_else(|| anyhow!("no video stream"))?;
        let target_secs = time.to_seconds().max(0.0);
        let target_pts = state.secs_to_pts(target_secs);
        let forward_limit = state.last_pts + state.secs_to_pts(FORWARD_WINDOW_SECS);

        if target_pts <= state.last_pts || target_pts > forward_limit {
            *state = VideoState::open(&self.path, target_secs, self.threads)?;
            state.burn_to(target_pts);
        }

        let image = state
            .next_frame_at(target_pts)?
            .ok_or_else(|| anyhow!("no frame at {:.3}s", target_secs))?;
        Ok(VideoFrame { time, layer, image: Some(image) })
    }

    fn read_audio(&mut self, range: TimeRange) -> Result<AudioBlock> {
        let state = self.audio.as_mut().ok_or_else(|| anyhow!("no audio stream"))?;
        let start_secs = range.start.to_seconds().max(0.0);

        if start_secs < state.position
            || start_secs > state.position + FORWARD_WINDOW_SECS
        {
            *state = AudioState::open(&self.path)?;
            state.seek_to(start_secs)?;
        }

        let frames = (range.duration.to_seconds() * state.info.sample_rate as f64)
            .round() as usize;
        let audio = state.decode_block(start_secs, frames)?;
        Ok(AudioBlock { range, audio: Some(audio) })
    }
}

fn stream_duration_secs(ictx: &ffmpeg::format::context::Input, index: usize) -> f64 {
    let stream = match ictx.stream(index) {
        Some(stream) => stream,
        None => return 0.0,
    };
    let tb = stream.time_base();
    let by_stream =
        stream.duration() as f64 * tb.numerator() as f64 / tb.denominator() as f64;
    if by_stream > 0.0 {
        by_stream
    } else {
        ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
    }
}

impl VideoState {
    /// Open and keyframe-seek to `timestamp` seconds.
    fn open(path: &SeqPath, timestamp: f64, threads: usize) -> Result<VideoState> {
        let mut ictx = input(&path.full())?;
        let index = ictx
            .streams()
            .best(Type::Video)
            .ok_or_else(|| anyhow!("no video stream"))?
            .index();

        let (tb_num, tb_den, width, height) = {
            let stream = ictx.stream(index).unwrap();
            let tb = stream.time_base();
            let params = stream.parameters();
            (tb.numerator(), tb.denominator(), params.width() as u32, params.height() as u32)
        };

        if timestamp > 0.0 {
            let seek_ts = (timestamp * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
            if let Err(e) = ictx.seek(seek_ts, ..=seek_ts) {
                // Soft-fail: decode from the current position; the PTS
                // filter in next_frame_at discards pre-roll.
                warn!(path = %path, error = %e, "seek soft-failed");
            }
        }

        // Second context for decoder construction; Parameters borrows the
        // stream.
        let ictx2 = input(&path.full())?;
        let stream2 = ictx2.stream(index).ok_or_else(|| anyhow!("stream gone"))?;
        let mut dec_ctx =
            ffmpeg::codec::context::Context::from_parameters(stream2.parameters())?;
        if threads > 1 {
            unsafe {
                (*dec_ctx.as_mut_ptr()).thread_count = threads as i32;
            }
        }
        let decoder = dec_ctx.decoder().video()?;

        let scaler = SwsContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGBA,
            width.max(2),
            height.max(2),
            Flags::BILINEAR,
        )?;

        let seek_pts =
            (timestamp * tb_den as f64 / tb_num as f64) as i64;
        Ok(VideoState {
            ictx,
            decoder,
            index,
            tb_num,
            tb_den,
            width: width.max(2),
            height: height.max(2),
            scaler,
            // One below the target so next_frame_at(target) fires on it.
            last_pts: seek_pts.saturating_sub(1),
        })
    }

    fn secs_to_pts(&self, secs: f64) -> i64 {
        (secs * self.tb_den as f64 / self.tb_num as f64) as i64
    }

    /// Decode without scaling until `last_pts` reaches `target_pts`.
    fn burn_to(&mut self, target_pts: i64) {
        if target_pts <= self.last_pts {
            return;
        }
        'outer: for (stream, packet) in self.ictx.packets().flatten() {
            if stream.index() != self.index {
                continue;
            }
            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }
            let mut decoded = ffmpeg::util::frame::video::Video::empty();
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let pts = decoded.pts().unwrap_or(self.last_pts + 1);
                if pts + 1 >= target_pts {
                    break 'outer;
                }
                self.last_pts = pts;
            }
        }
    }

    /// Decode forward to the first frame at or past `target_pts` and scale
    /// it to RGBA.
    fn next_frame_at(&mut self, target_pts: i64) -> Result<Option<Image>> {
        let mut last_good: Option<Image> = None;
        for (stream, packet) in self.ictx.packets().flatten() {
            if stream.index() != self.index {
                continue;
            }
            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }
            let mut decoded = ffmpeg::util::frame::video::Video::empty();
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let pts = decoded.pts().unwrap_or(self.last_pts + 1);
                self.last_pts = pts;
                let image = self.scale(&decoded)?;
                last_good = Some(image.clone());
                if pts >= target_pts {
                    return Ok(Some(image));
                }
            }
        }
        // EOF before the target: hold the final frame (a request for the
        // very last frame usually lands here).
        Ok(last_good)
    }

    fn scale(&mut self, decoded: &ffmpeg::util::frame::video::Video) -> Result<Image> {
        let mut out = ffmpeg::util::frame::video::Video::empty();
        self.scaler.run(decoded, &mut out)?;
        let stride = out.stride(0);
        let raw = out.data(0);
        let row_bytes = self.width as usize * 4;
        // Destripe: copy visible pixels, not stride padding.
        let data: Vec<u8> = (0..self.height as usize)
            .flat_map(|row| &raw[row * stride..row * stride + row_bytes])
            .copied()
            .collect();
        Image::new(ImageInfo::new(self.width, self.height, PixelType::Rgba8), data)
            .map_err(|e| anyhow!(e))
    }
}

impl AudioState {
    fn open(path: &SeqPath) -> Result<AudioState> {
        let ictx = input(&path.full())?;
        let (index, tb_num, tb_den, decoder) = {
            let stream = ictx
                .streams()
                .best(Type::Audio)
                .ok_or_else(|| anyhow!("no audio stream"))?;
            let tb = stream.time_base();
            let dec_ctx =
                ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
            (
                stream.index(),
                tb.numerator(),
                tb.denominator(),
                dec_ctx.decoder().audio()?,
            )
        };
        let info = AudioInfo::new(
            decoder.ch_layout().channels().max(1) as u16,
            decoder.rate().max(1),
        );
        Ok(AudioState {
            ictx,
            decoder,
            index,
            tb_num,
            tb_den,
            info,
            resampler: None,
            position: 0.0,
        })
    }

    fn seek_to(&mut self, secs: f64) -> Result<()> {
        if secs > 0.0 {
            let seek_ts = (secs * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
            if let Err(e) = self.ictx.seek(seek_ts, ..=seek_ts) {
                warn!(error = %e, "audio seek soft-failed");
            }
        }
        self.position = secs;
        Ok(())
    }

    /// Decode from the current position, dropping samples before
    /// `start_secs`, until `frames` sample frames are collected. Short
    /// reads (EOF) are zero-padded.
    fn decode_block(&mut self, start_secs: f64, frames: usize) -> Result<Audio> {
        let channels = self.info.channels as usize;
        let rate = self.info.sample_rate as f64;
        let mut collected: Vec<f32> = Vec::with_capacity(frames * channels);
        let mut cursor_secs = self.position;

        'packets: for (stream, packet) in self.ictx.packets().flatten() {
            if stream.index() != self.index {
                continue;
            }
            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }
            let mut raw = ffmpeg::util::frame::audio::Audio::empty();
            while self.decoder.receive_frame(&mut raw).is_ok() {
                if let Some(pts) = raw.pts() {
                    cursor_secs =
                        pts as f64 * self.tb_num as f64 / self.tb_den as f64;
                }
                let samples = self.to_f32_interleaved(&raw)?;
                let frame_count = samples.len() / channels;
                // Drop the part of this frame before the requested start.
                let skip = if cursor_secs < start_secs {
                    (((start_secs - cursor_secs) * rate) as usize).min(frame_count)
                } else {
                    0
                };
                collected.extend_from_slice(&samples[skip * channels..]);
                cursor_secs += frame_count as f64 / rate;
                if collected.len() >= frames * channels {
                    break 'packets;
                }
            }
        }

        self.position = start_secs + frames as f64 / rate;
        collected.resize(frames * channels, 0.0);
        Audio::new(self.info, collected).map_err(|e| anyhow!(e))
    }

    /// Resample a decoded frame to packed f32 at the source rate and
    /// channel count, then lift the interleaved plane out.
    fn to_f32_interleaved(
        &mut self,
        raw: &ffmpeg::util::frame::audio::Audio,
    ) -> Result<Vec<f32>> {
        let channels = self.info.channels as usize;
        let target = Sample::F32(SampleType::Packed);
        let frame = if raw.format() == target {
            raw.clone()
        } else {
            let resampler = match &mut self.resampler {
                Some(resampler) => resampler,
                None => {
                    let built = resampling::Context::get2(
                        raw.format(),
                        raw.ch_layout(),
                        raw.rate(),
                        target,
                        raw.ch_layout(),
                        raw.rate(),
                    )?;
                    self.resampler.insert(built)
                }
            };
            let mut resampled = ffmpeg::util::frame::audio::Audio::empty();
            resampler.run(raw, &mut resampled)?;
            resampled
        };
        let count = frame.samples() * channels;
        let bytes = frame.data(0);
        let mut samples = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(4).take(count) {
            samples.push(f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(samples)
    }
}
