// crates/reelkit-media/src/sequence.rs
//
// Image-sequence I/O: numbered PPM/PNG frames on disk as a video source.
//
// Reader model: `SequenceIO/ThreadCount` workers consume one shared
// request channel, so several frames decode in parallel during scrubs and
// prefetch bursts. A scan thread lists the directory and probes the first
// frame's header once at open; workers block on that result through a
// condvar slot before their first decode.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use reelkit_core::{IoError, RationalTime, SeqPath, TimeRange};

use crate::future::{pair, Pending, Promise};
use crate::image::{Image, ImageInfo, PixelType};
use crate::plugin::{opt_f64, opt_usize, IoOptions, Plugin, VIDEO_ONLY};
use crate::reader::{AudioBlock, Info, Reader, VideoFrame, Writer, REQUEST_TIMEOUT};

pub const DEFAULT_SPEED: f64 = 24.0;
pub const DEFAULT_THREAD_COUNT: usize = 4;

// ── Plugin ────────────────────────────────────────────────────────────────────

pub struct SequencePlugin;

impl Plugin for SequencePlugin {
    fn name(&self) -> &str {
        "SequenceIO"
    }

    fn extensions(&self) -> &[&str] {
        &["ppm", "png"]
    }

    fn capabilities(&self) -> u8 {
        VIDEO_ONLY
    }

    fn read(&self, path: &SeqPath, options: &IoOptions) -> Result<Box<dyn Reader>, IoError> {
        Ok(Box::new(SequenceReader::open(path.clone(), options)))
    }

    fn write(
        &self,
        path: &SeqPath,
        _info: &Info,
        _options: &IoOptions,
    ) -> Result<Box<dyn Writer>, IoError> {
        Ok(Box::new(SequenceWriter { path: path.clone() }))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ── Codec dispatch ────────────────────────────────────────────────────────────

fn decode_file(file: &str) -> Result<Image> {
    let bytes = fs::read(file)?;
    match extension_of(file).as_str() {
        "ppm" => crate::ppm::decode(&bytes),
        "png" => png_decode(&bytes),
        other => bail!("unsupported extension \"{other}\""),
    }
}

fn probe_file(file: &str) -> Result<ImageInfo> {
    let bytes = fs::read(file)?;
    match extension_of(file).as_str() {
        "ppm" => crate::ppm::probe(&bytes),
        "png" => png_probe(&bytes),
        other => bail!("unsupported extension \"{other}\""),
    }
}

fn extension_of(file: &str) -> String {
    SeqPath::parse(file).extension()
}

fn png_decode(bytes: &[u8]) -> Result<Image> {
    let decoder = png::Decoder::new(std::io::Cursor::new(bytes));
    let mut reader = decoder.read_info()?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let out = reader.next_frame(&mut buf)?;
    if out.bit_depth != png::BitDepth::Eight {
        bail!("unsupported bit depth {:?}", out.bit_depth);
    }
    let pixel = match out.color_type {
        png::ColorType::Grayscale => PixelType::L8,
        png::ColorType::Rgb => PixelType::Rgb8,
        png::ColorType::Rgba => PixelType::Rgba8,
        other => bail!("unsupported color type {other:?}"),
    };
    buf.truncate(out.buffer_size());
    Image::new(ImageInfo::new(out.width, out.height, pixel), buf).map_err(|e| anyhow!(e))
}

fn png_probe(bytes: &[u8]) -> Result<ImageInfo> {
    let decoder = png::Decoder::new(std::io::Cursor::new(bytes));
    let reader = decoder.read_info()?;
    let info = reader.info();
    let pixel = match info.color_type {
        png::ColorType::Grayscale => PixelType::L8,
        png::ColorType::Rgb => PixelType::Rgb8,
        png::ColorType::Rgba => PixelType::Rgba8,
        other => bail!("unsupported color type {other:?}"),
    };
    Ok(ImageInfo::new(info.width, info.height, pixel))
}

fn png_encode(image: &Image) -> Result<Vec<u8>> {
    let info = image.info();
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, info.width, info.height);
        encoder.set_color(match info.pixel {
            PixelType::L8 => png::ColorType::Grayscale,
            PixelType::Rgb8 => png::ColorType::Rgb,
            PixelType::Rgba8 => png::ColorType::Rgba,
        });
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(image.data())?;
    }
    Ok(out)
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Frame range and probe result shared by all workers once the scan ran.
#[derive(Clone, Copy, Debug)]
struct Scan {
    start_frame: i64,
    end_frame:   i64,
    image:       ImageInfo,
    speed:       f64,
}

type ScanSlot = Arc<(Mutex<Option<Result<Scan, IoError>>>, Condvar)>;

/// Decrements the outstanding-request counter however the request ends:
/// fulfilled, cancelled, or dropped with the queue.
struct CountGuard(Arc<AtomicUsize>);

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SeqRequest {
    time:    RationalTime,
    layer:   u16,
    promise: Promise<VideoFrame>,
    _guard:  CountGuard,
}

pub struct SequenceReader {
    path:         SeqPath,
    tx:           Sender<SeqRequest>,
    /// Receiver clone used to drain the queue on cancel/stop.
    drain:        Receiver<SeqRequest>,
    info:         Pending<Info>,
    outstanding:  Arc<AtomicUsize>,
    stopped:      Arc<AtomicBool>,
    live_workers: Arc<AtomicUsize>,
}

impl SequenceReader {
    pub fn open(path: SeqPath, options: &IoOptions) -> SequenceReader {
        let speed = opt_f64(options, "SequenceIO/DefaultSpeed", DEFAULT_SPEED);
        let threads =
            opt_usize(options, "SequenceIO/ThreadCount", DEFAULT_THREAD_COUNT).max(1);

        let (tx, rx) = unbounded::<SeqRequest>();
        let (info_promise, info_pending) = pair::<Info>();
        let scan_slot: ScanSlot = Arc::new((Mutex::new(None), Condvar::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let live_workers = Arc::new(AtomicUsize::new(threads));

        for _ in 0..threads {
            let rx = rx.clone();
            let path = path.clone();
            let scan_slot = Arc::clone(&scan_slot);
            let stopped = Arc::clone(&stopped);
            let live = Arc::clone(&live_workers);
            thread::spawn(move || {
                worker(rx, path, scan_slot, stopped);
                live.fetch_sub(1, Ordering::SeqCst);
            });
        }

        // Scan on its own thread so open() never blocks on the filesystem.
        {
            let path = path.clone();
            let scan_slot = Arc::clone(&scan_slot);
            thread::spawn(move || {
                let result = scan(&path, speed);
                match &result {
                    Ok(s) => {
                        debug!(
                            path = %path,
                            frames = s.end_frame - s.start_frame + 1,
                            "sequence opened"
                        );
                        info_promise.fulfill(Ok(scan_info(s)));
                    }
                    Err(e) => info_promise.fulfill(Err(e.clone())),
                }
                let (lock, cvar) = &*scan_slot;
                *lock.lock().unwrap() = Some(result);
                cvar.notify_all();
            });
        }

        SequenceReader {
            path,
            tx,
            drain: rx,
            info: info_pending,
            outstanding: Arc::new(AtomicUsize::new(0)),
            stopped,
            live_workers,
        }
    }
}

impl Reader for SequenceReader {
    fn get_info(&self) -> Pending<Info> {
        self.info.clone()
    }

    fn read_video(&self, media_time: RationalTime, layer: u16) -> Pending<VideoFrame> {
        if self.stopped.load(Ordering::SeqCst) {
            return Pending::ready(Err(IoError::ReaderClosed));
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let guard = CountGuard(Arc::clone(&self.outstanding));
        let (promise, pending) = pair::<VideoFrame>();
        let request = SeqRequest { time: media_time, layer, promise, _guard: guard };
        if self.tx.send(request).is_err() {
            return Pending::ready(Err(IoError::ReaderClosed));
        }
        pending
    }

    fn read_audio(&self, _media_range: TimeRange) -> Pending<AudioBlock> {
        Pending::ready(Err(IoError::OpenFailed {
            path:   self.path.full(),
            reason: "image sequences carry no audio".to_string(),
        }))
    }

    fn has_requests(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) > 0
    }

    fn cancel_requests(&self) {
        while let Ok(request) = self.drain.try_recv() {
            request.promise.fulfill(Err(IoError::Cancelled));
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        while let Ok(request) = self.drain.try_recv() {
            request.promise.fulfill(Err(IoError::ReaderClosed));
        }
    }

    fn has_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) && self.live_workers.load(Ordering::SeqCst) == 0
    }
}

impl Drop for SequenceReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(rx: Receiver<SeqRequest>, path: SeqPath, scan_slot: ScanSlot, stopped: Arc<AtomicBool>) {
    loop {
        if stopped.load(Ordering::SeqCst) {
            return;
        }
        match rx.recv_timeout(REQUEST_TIMEOUT) {
            Ok(request) => {
                if stopped.load(Ordering::SeqCst) {
                    request.promise.fulfill(Err(IoError::ReaderClosed));
                    continue;
                }
                let result = match wait_for_scan(&scan_slot, &stopped) {
                    Ok(s) => decode_frame(&path, &s, request.time, request.layer),
                    Err(e) => Err(e),
                };
                request.promise.fulfill(result);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn wait_for_scan(slot: &ScanSlot, stopped: &AtomicBool) -> Result<Scan, IoError> {
    let (lock, cvar) = &**slot;
    let mut guard = lock.lock().unwrap();
    loop {
        if let Some(result) = guard.as_ref() {
            return result.clone();
        }
        if stopped.load(Ordering::SeqCst) {
            return Err(IoError::ReaderClosed);
        }
        let (next, _) = cvar.wait_timeout(guard, REQUEST_TIMEOUT).unwrap();
        guard = next;
    }
}

/// List the sequence on disk and probe the first frame's header.
fn scan(path: &SeqPath, speed: f64) -> Result<Scan, IoError> {
    let open_failed = |reason: String| IoError::OpenFailed { path: path.full(), reason };

    let (start_frame, end_frame) = if path.is_sequence() {
        let dir = if path.directory().is_empty() { "." } else { path.directory() };
        let entries = fs::read_dir(dir).map_err(|e| open_failed(e.to_string()))?;
        let extension = path.extension();
        let mut frames: Vec<i64> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let candidate = SeqPath::parse(&name);
            if candidate.base_name() == path.base_name()
                && candidate.extension() == extension
            {
                if let Some(frame) = candidate.start_frame() {
                    frames.push(frame);
                }
            }
        }
        if frames.is_empty() {
            return Err(open_failed("no frames on disk".to_string()));
        }
        let start = *frames.iter().min().unwrap();
        let end = *frames.iter().max().unwrap();
        (start, end)
    } else {
        (0, 0)
    };

    let image = probe_file(&path.get(Some(start_frame)))
        .map_err(|e| open_failed(e.to_string()))?;

    Ok(Scan { start_frame, end_frame, image, speed })
}

fn scan_info(scan: &Scan) -> Info {
    let mut tags = std::collections::HashMap::new();
    tags.insert("sequence/StartFrame".to_string(), scan.start_frame.to_string());
    tags.insert(
        "sequence/FrameCount".to_string(),
        (scan.end_frame - scan.start_frame + 1).to_string(),
    );
    tags.insert("sequence/Speed".to_string(), scan.speed.to_string());
    Info {
        video:      vec![scan.image],
        video_time: Some(TimeRange::from_frames(
            scan.start_frame as f64,
            (scan.end_frame - scan.start_frame + 1) as f64,
            scan.speed,
        )),
        audio:      None,
        audio_time: None,
        tags,
    }
}

fn decode_frame(
    path: &SeqPath,
    scan: &Scan,
    time: RationalTime,
    layer: u16,
) -> Result<VideoFrame, IoError> {
    // Clamp rather than fail outside the scanned range: dissolve reads run
    // past a clip's last frame by design and hold on it.
    let frame = time
        .rescaled_to(scan.speed)
        .frame()
        .clamp(scan.start_frame, scan.end_frame);
    let file = if path.is_sequence() {
        path.get(Some(frame))
    } else {
        path.full()
    };
    let image = decode_file(&file).map_err(|e| IoError::DecodeFailed {
        path:   file.clone(),
        reason: e.to_string(),
    })?;
    Ok(VideoFrame { time, layer, image: Some(image) })
}

// ── Writer ────────────────────────────────────────────────────────────────────

pub struct SequenceWriter {
    path: SeqPath,
}

impl Writer for SequenceWriter {
    fn write_video(&mut self, time: RationalTime, image: &Image) -> Result<(), IoError> {
        let file = if self.path.is_sequence() {
            self.path.get(Some(time.frame()))
        } else {
            self.path.full()
        };
        let bytes = match self.path.extension().as_str() {
            "ppm" => crate::ppm::encode(image),
            "png" => png_encode(image).map_err(|e| IoError::OpenFailed {
                path:   file.clone(),
                reason: e.to_string(),
            })?,
            other => {
                return Err(IoError::OpenFailed {
                    path:   file,
                    reason: format!("unsupported extension \"{other}\""),
                })
            }
        };
        fs::write(&file, bytes).map_err(|e| IoError::OpenFailed {
            path:   file,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginRegistry;
    use std::time::Duration;

    /// Write `count` 16x16 RGB frames and return the sequence path.
    fn write_sequence(dir: &std::path::Path, count: i64) -> SeqPath {
        let path = SeqPath::parse(&format!(
            "{}/TimelineTest.0.ppm",
            dir.to_string_lossy()
        ));
        let registry = PluginRegistry::new();
        let mut writer = registry
            .write(&path, &Info::default(), &IoOptions::new())
            .unwrap();
        let image = Image::solid(ImageInfo::new(16, 16, PixelType::Rgb8), 127);
        for frame in 0..count {
            writer
                .write_video(RationalTime::new(frame as f64, 24.0), &image)
                .unwrap();
        }
        path
    }

    #[test]
    fn info_from_disk_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sequence(dir.path(), 24);
        let reader = SequenceReader::open(path, &IoOptions::new());
        let info = reader.get_info().wait().unwrap();
        assert_eq!(info.video, vec![ImageInfo::new(16, 16, PixelType::Rgb8)]);
        assert_eq!(
            info.video_time,
            Some(TimeRange::from_frames(0.0, 24.0, 24.0))
        );
        assert_eq!(info.tags.get("sequence/FrameCount").unwrap(), "24");
    }

    #[test]
    fn default_speed_option_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sequence(dir.path(), 8);
        let mut options = IoOptions::new();
        options.insert("SequenceIO/DefaultSpeed".to_string(), "30".to_string());
        let reader = SequenceReader::open(path, &options);
        let info = reader.get_info().wait().unwrap();
        assert_eq!(info.video_time.unwrap().duration.rate, 30.0);
    }

    #[test]
    fn read_video_decodes_each_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sequence(dir.path(), 4);
        let reader = SequenceReader::open(path, &IoOptions::new());
        for frame in 0..4 {
            let time = RationalTime::new(frame as f64, 24.0);
            let result = reader.read_video(time, 0).wait().unwrap();
            assert_eq!(result.time, time);
            let image = result.image.unwrap();
            assert_eq!(image.info(), ImageInfo::new(16, 16, PixelType::Rgb8));
        }
        assert!(!reader.has_requests());
    }

    #[test]
    fn out_of_range_reads_clamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sequence(dir.path(), 4);
        let reader = SequenceReader::open(path, &IoOptions::new());
        let result = reader
            .read_video(RationalTime::new(100.0, 24.0), 0)
            .wait()
            .unwrap();
        assert!(result.image.is_some());
    }

    #[test]
    fn open_of_missing_sequence_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = SeqPath::parse(&format!(
            "{}/Nothing.0.ppm",
            dir.path().to_string_lossy()
        ));
        let reader = SequenceReader::open(path, &IoOptions::new());
        assert!(matches!(
            reader.get_info().wait(),
            Err(IoError::OpenFailed { .. })
        ));
        assert!(matches!(
            reader.read_video(RationalTime::new(0.0, 24.0), 0).wait(),
            Err(IoError::OpenFailed { .. })
        ));
    }

    #[test]
    fn stop_rejects_new_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sequence(dir.path(), 4);
        let reader = SequenceReader::open(path, &IoOptions::new());
        reader.stop();
        assert_eq!(
            reader.read_video(RationalTime::new(0.0, 24.0), 0).wait(),
            Err(IoError::ReaderClosed)
        );
        // Workers exit within a few poll timeouts.
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !reader.has_stopped() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(reader.has_stopped());
    }

    #[test]
    fn read_audio_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sequence(dir.path(), 1);
        let reader = SequenceReader::open(path, &IoOptions::new());
        assert!(matches!(
            reader
                .read_audio(TimeRange::from_frames(0.0, 24.0, 24.0))
                .wait(),
            Err(IoError::OpenFailed { .. })
        ));
    }

    #[test]
    fn png_round_trip_through_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = SeqPath::parse(&format!(
            "{}/frame.0.png",
            dir.path().to_string_lossy()
        ));
        let mut writer = SequenceWriter { path: path.clone() };
        let image = Image::solid(ImageInfo::new(8, 8, PixelType::Rgba8), 42);
        writer
            .write_video(RationalTime::new(0.0, 24.0), &image)
            .unwrap();
        let reader = SequenceReader::open(path, &IoOptions::new());
        let back = reader
            .read_video(RationalTime::new(0.0, 24.0), 0)
            .wait()
            .unwrap()
            .image
            .unwrap();
        assert_eq!(back.info(), ImageInfo::new(8, 8, PixelType::Rgba8));
        assert!(back.data().iter().all(|&b| b == 42));
    }
}
