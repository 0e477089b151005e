// crates/reelkit-timeline/src/test_util.rs
//
// Instrumented fake plugin for engine and I/O manager tests: counts
// dispatches, optionally gates completions so tests can observe in-flight
// state, and produces deterministic ramp audio.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use reelkit_core::{IoError, RationalTime, SeqPath, TimeRange};
use reelkit_media::audio::{Audio, AudioInfo};
use reelkit_media::future::{pair, Pending, Promise};
use reelkit_media::image::{Image, ImageInfo, PixelType};
use reelkit_media::plugin::{IoOptions, Plugin, VIDEO_AND_AUDIO};
use reelkit_media::reader::{AudioBlock, Info, Reader, VideoFrame};

pub const FAKE_IMAGE: ImageInfo = ImageInfo { width: 8, height: 8, pixel: PixelType::Rgb8 };
pub const FAKE_AUDIO: AudioInfo = AudioInfo { channels: 2, sample_rate: 48_000 };

#[derive(Default)]
pub struct Counters {
    pub opens:          AtomicUsize,
    pub video_reads:    AtomicUsize,
    pub audio_reads:    AtomicUsize,
    pub concurrent:     AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl Counters {
    fn enter(&self) {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Video requests parked by a gated reader until the test releases them.
#[derive(Default)]
pub struct Gate {
    held: Mutex<Vec<(String, RationalTime, u16, Promise<VideoFrame>)>>,
}

impl Gate {
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Source paths of the currently parked requests, in dispatch order.
    pub fn held_paths(&self) -> Vec<String> {
        self.held.lock().unwrap().iter().map(|(p, ..)| p.clone()).collect()
    }

    /// Fulfill everything currently parked with a solid frame.
    pub fn release_all(&self, counters: &Counters) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        for (_, time, layer, promise) in held {
            counters.leave();
            promise.fulfill(Ok(VideoFrame {
                time,
                layer,
                image: Some(Image::solid(FAKE_IMAGE, 100)),
            }));
        }
    }

    fn drain_with(&self, counters: &Counters, error: IoError) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        for (.., promise) in held {
            counters.leave();
            promise.fulfill(Err(error.clone()));
        }
    }
}

pub struct FakePlugin {
    pub counters: Arc<Counters>,
    pub gate:     Option<Arc<Gate>>,
}

impl FakePlugin {
    pub fn immediate(counters: Arc<Counters>) -> FakePlugin {
        FakePlugin { counters, gate: None }
    }

    pub fn gated(counters: Arc<Counters>, gate: Arc<Gate>) -> FakePlugin {
        FakePlugin { counters, gate: Some(gate) }
    }
}

impl Plugin for FakePlugin {
    fn name(&self) -> &str {
        "Fake"
    }

    fn extensions(&self) -> &[&str] {
        &["fake"]
    }

    fn capabilities(&self) -> u8 {
        VIDEO_AND_AUDIO
    }

    fn read(&self, path: &SeqPath, _options: &IoOptions) -> Result<Box<dyn Reader>, IoError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeReader {
            path:     path.full(),
            counters: Arc::clone(&self.counters),
            gate:     self.gate.clone(),
            stopped:  AtomicBool::new(false),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct FakeReader {
    path:     String,
    counters: Arc<Counters>,
    gate:     Option<Arc<Gate>>,
    stopped:  AtomicBool,
}

impl Reader for FakeReader {
    fn get_info(&self) -> Pending<Info> {
        Pending::ready(Ok(Info {
            video:      vec![FAKE_IMAGE],
            video_time: Some(TimeRange::from_frames(0.0, 1000.0, 24.0)),
            audio:      Some(FAKE_AUDIO),
            audio_time: Some(TimeRange::new(
                RationalTime::new(0.0, FAKE_AUDIO.sample_rate as f64),
                RationalTime::from_seconds(1000.0, FAKE_AUDIO.sample_rate as f64),
            )),
            tags:       Default::default(),
        }))
    }

    fn read_video(&self, media_time: RationalTime, layer: u16) -> Pending<VideoFrame> {
        if self.stopped.load(Ordering::SeqCst) {
            return Pending::ready(Err(IoError::ReaderClosed));
        }
        self.counters.video_reads.fetch_add(1, Ordering::SeqCst);
        self.counters.enter();
        match &self.gate {
            Some(gate) => {
                let (promise, pending) = pair::<VideoFrame>();
                gate.held
                    .lock()
                    .unwrap()
                    .push((self.path.clone(), media_time, layer, promise));
                pending
            }
            None => {
                self.counters.leave();
                Pending::ready(Ok(VideoFrame {
                    time:  media_time,
                    layer,
                    image: Some(Image::solid(FAKE_IMAGE, 100)),
                }))
            }
        }
    }

    /// Ramp PCM: every sample frame carries its absolute media frame
    /// index, so continuity across buckets is directly checkable.
    fn read_audio(&self, media_range: TimeRange) -> Pending<AudioBlock> {
        if self.stopped.load(Ordering::SeqCst) {
            return Pending::ready(Err(IoError::ReaderClosed));
        }
        self.counters.audio_reads.fetch_add(1, Ordering::SeqCst);
        let rate = FAKE_AUDIO.sample_rate as f64;
        let start = (media_range.start.to_seconds() * rate).round() as i64;
        let frames = (media_range.duration.to_seconds() * rate).round() as usize;
        let mut samples = Vec::with_capacity(frames * FAKE_AUDIO.channels as usize);
        for frame in 0..frames {
            let value = (start + frame as i64) as f32;
            for _ in 0..FAKE_AUDIO.channels {
                samples.push(value);
            }
        }
        Pending::ready(Ok(AudioBlock {
            range: media_range,
            audio: Some(Audio::new(FAKE_AUDIO, samples).unwrap()),
        }))
    }

    fn has_requests(&self) -> bool {
        self.gate
            .as_ref()
            .map(|gate| gate.held_count() > 0)
            .unwrap_or(false)
    }

    fn cancel_requests(&self) {
        if let Some(gate) = &self.gate {
            gate.drain_with(&self.counters, IoError::Cancelled);
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.drain_with(&self.counters, IoError::ReaderClosed);
        }
    }

    fn has_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
