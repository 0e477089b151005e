// crates/reelkit-timeline/src/engine.rs
//
// The timeline engine façade: composition time in, assembled VideoData /
// AudioData futures out. Per-read failures degrade to null images or
// silence in their slot so playback keeps running; only an out-of-range
// request fails the returned future.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::warn;

use reelkit_core::edl::{Timeline, TrackKind, Transition};
use reelkit_core::{time_equals, IoError, RationalTime, SeqPath, Signal, TimeRange};
use reelkit_media::audio::{concat_trimmed, Audio, AudioInfo};
use reelkit_media::future::{pair, Pending, Promise};
use reelkit_media::image::Image;
use reelkit_media::plugin::PluginRegistry;
use reelkit_media::reader::Info;

use crate::io::IoManager;
use crate::options::Options;
use crate::resolve;

// ── Output types ──────────────────────────────────────────────────────────────

/// One video layer of a composited frame. With `transition == Dissolve`,
/// `image` is the outgoing A side, `image_b` the incoming B side, and
/// `transition_value` the B weight in [0, 1].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VideoLayer {
    pub image:            Option<Image>,
    pub image_b:          Option<Image>,
    pub transition:       Transition,
    pub transition_value: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VideoData {
    pub time:   RationalTime,
    pub layers: Vec<VideoLayer>,
}

impl Default for VideoData {
    fn default() -> Self {
        Self { time: RationalTime::INVALID, layers: Vec::new() }
    }
}

/// Compare only the time stamps of two frames.
pub fn is_video_time_equal(a: &VideoData, b: &VideoData) -> bool {
    time_equals(a.time, b.time)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioLayer {
    pub audio: Option<Audio>,
}

/// One whole second of audio, one layer per audio track in composition
/// order. Layers are concatenated per track, never mixed; mixing is the
/// renderer's concern.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioData {
    pub seconds: i64,
    pub layers:  Vec<AudioLayer>,
}

impl Default for AudioData {
    fn default() -> Self {
        Self { seconds: -1, layers: Vec::new() }
    }
}

pub fn is_audio_time_equal(a: &AudioData, b: &AudioData) -> bool {
    a.seconds == b.seconds
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct PlaybackEngine {
    edl:           Timeline,
    io:            IoManager,
    duration:      RationalTime,
    global_start:  RationalTime,
    av_info:       Info,
    active_ranges: Signal<Vec<TimeRange>>,
}

impl PlaybackEngine {
    /// Build an engine over `edl`. Fails only on fatal conditions: a
    /// corrupt EDL, an empty track stack, or a registry with no plugins.
    /// The first clip of each kind is opened eagerly so `get_av_info` is
    /// populated from construction; an unopenable first clip logs a
    /// warning and leaves that half of the info empty.
    pub fn new(
        edl: Timeline,
        registry: Arc<PluginRegistry>,
        options: Options,
    ) -> Result<PlaybackEngine, IoError> {
        edl.validate()?;
        if edl.stack.tracks.is_empty() {
            return Err(IoError::OpenFailed {
                path:   edl.name.clone(),
                reason: "timeline has no tracks".to_string(),
            });
        }
        if registry.get_plugins().is_empty() {
            return Err(IoError::OpenFailed {
                path:   edl.name.clone(),
                reason: "no I/O plugins registered".to_string(),
            });
        }

        let io = IoManager::new(registry, options);
        let duration = edl.duration();
        let global_start = edl.global_start_time;

        let mut av_info = Info::default();
        if let Some(clip) = edl.first_clip(TrackKind::Video) {
            match io.get_info(&clip.path).wait() {
                Ok(info) => {
                    av_info.video = info.video;
                    av_info.video_time = info.video_time;
                    av_info.tags.extend(info.tags);
                }
                Err(e) => warn!(path = %clip.path, error = %e, "first video clip info failed"),
            }
        }
        if let Some(clip) = edl.first_clip(TrackKind::Audio) {
            match io.get_info(&clip.path).wait() {
                Ok(info) => {
                    av_info.audio = info.audio;
                    av_info.audio_time = info.audio_time;
                    av_info.tags.extend(info.tags);
                }
                Err(e) => warn!(path = %clip.path, error = %e, "first audio clip info failed"),
            }
        }

        Ok(PlaybackEngine {
            edl,
            io,
            duration,
            global_start,
            av_info,
            active_ranges: Signal::new(Vec::new()),
        })
    }

    pub fn get_duration(&self) -> RationalTime {
        self.duration
    }

    pub fn get_global_start_time(&self) -> RationalTime {
        self.global_start
    }

    pub fn get_av_info(&self) -> &Info {
        &self.av_info
    }

    pub fn active_ranges(&self) -> Vec<TimeRange> {
        self.active_ranges.get()
    }

    pub fn observe_cancel_requests(&self) -> Signal<bool> {
        self.io.observe_cancel_requests()
    }

    /// Paths with a live reader right now. Diagnostics and tests.
    pub fn open_paths(&self) -> Vec<String> {
        self.io.open_paths()
    }

    /// Composited frame at `time`. The future always resolves: failed
    /// reads leave null images in their layer slots. Only a time outside
    /// the composition fails, with `OutOfRange`.
    pub fn get_video(&self, time: RationalTime, layer: u16) -> Pending<VideoData> {
        self.io.maintain();
        let plan = match resolve::video_plan(&self.edl, time) {
            Ok(plan) => plan,
            Err(e) => return Pending::ready(Err(e)),
        };

        let layers: Vec<VideoLayer> = plan
            .iter()
            .map(|lp| VideoLayer {
                image:            None,
                image_b:          None,
                transition:       lp.transition,
                transition_value: lp.transition_value,
            })
            .collect();
        let reads = plan
            .iter()
            .map(|lp| lp.read.iter().count() + lp.read_b.iter().count())
            .sum::<usize>();
        if reads == 0 {
            return Pending::ready(Ok(VideoData { time, layers }));
        }

        let (promise, pending) = pair::<VideoData>();
        let collect = Arc::new(Mutex::new(VideoCollect {
            remaining: reads,
            layers,
            promise: Some(promise),
        }));
        for (index, lp) in plan.iter().enumerate() {
            if let Some(read) = &lp.read {
                let future = self.io.read_video(&read.path, read.time, layer);
                hook_video(&collect, future, index, false, time);
            }
            if let Some(read) = &lp.read_b {
                let future = self.io.read_video(&read.path, read.time, layer);
                hook_video(&collect, future, index, true, time);
            }
        }
        pending
    }

    /// One second of audio, bucketed at the composition clock. Always
    /// resolves; seconds outside the composition and failed reads come
    /// back as silence.
    pub fn get_audio(&self, seconds: i64) -> Pending<AudioData> {
        self.io.maintain();
        let info = self.av_info.audio.unwrap_or_default();
        let bucket_frames = info.sample_rate as usize;
        let plans = resolve::audio_plan(&self.edl, seconds);

        // Per-track slots, pre-filled with the silent segments so only
        // real reads stay outstanding.
        let mut slots: Vec<Vec<Option<Audio>>> = Vec::with_capacity(plans.len());
        let mut frame_counts: Vec<Vec<usize>> = Vec::with_capacity(plans.len());
        let mut reads = Vec::new();
        for (track_index, plan) in plans.iter().enumerate() {
            let mut track_slots = Vec::with_capacity(plan.segments.len());
            let mut track_frames = Vec::with_capacity(plan.segments.len());
            for (segment_index, segment) in plan.segments.iter().enumerate() {
                let frames =
                    (segment.duration.to_seconds() * info.sample_rate as f64).round() as usize;
                track_frames.push(frames);
                match &segment.read {
                    Some((path, range)) => {
                        track_slots.push(None);
                        reads.push((track_index, segment_index, path.clone(), *range));
                    }
                    None => track_slots.push(Some(Audio::silence(info, frames))),
                }
            }
            slots.push(track_slots);
            frame_counts.push(track_frames);
        }

        if reads.is_empty() {
            return Pending::ready(Ok(assemble_audio(
                seconds,
                info,
                bucket_frames,
                slots,
                &frame_counts,
            )));
        }

        let (promise, pending) = pair::<AudioData>();
        let collect = Arc::new(Mutex::new(AudioCollect {
            remaining: reads.len(),
            slots,
            frame_counts,
            promise: Some(promise),
        }));
        for (track_index, segment_index, path, range) in reads {
            let future = self.io.read_audio(&path, range);
            let collect = Arc::clone(&collect);
            future.on_settle(move |result| {
                let mut guard = collect.lock().unwrap();
                match result {
                    Ok(block) => {
                        guard.slots[track_index][segment_index] = block.audio.clone();
                    }
                    Err(IoError::Cancelled) => {}
                    Err(e) => {
                        warn!(seconds, error = %e, "audio read failed, inserting silence")
                    }
                }
                guard.remaining -= 1;
                if guard.remaining == 0 {
                    let slots = std::mem::take(&mut guard.slots);
                    let frame_counts = std::mem::take(&mut guard.frame_counts);
                    let promise = guard.promise.take().expect("settled once");
                    drop(guard);
                    promise.fulfill(Ok(assemble_audio(
                        seconds,
                        info,
                        bucket_frames,
                        slots,
                        &frame_counts,
                    )));
                }
            });
        }
        pending
    }

    /// Replace the set of composition ranges whose readers stay warm.
    /// Re-applying the current set is a no-op; newly covered paths are
    /// pre-opened, newly uncovered ones become eviction candidates.
    pub fn set_active_ranges(&self, ranges: Vec<TimeRange>) {
        if ranges == self.active_ranges.get() {
            return;
        }
        self.active_ranges.set(ranges.clone());
        let paths: HashSet<String> = resolve::active_paths(&self.edl, &ranges);
        let added = self.io.set_active_paths(paths);
        for path in added {
            self.io.prime(&SeqPath::parse(&path));
        }
        self.io.maintain();
    }

    pub fn cancel_requests(&self) {
        self.io.cancel_requests();
    }

    /// Housekeeping: waiter timeouts and reader eviction. The player
    /// calls this every tick; tests call it directly.
    pub fn tick(&self) {
        self.io.maintain();
    }
}

// ── Assembly ──────────────────────────────────────────────────────────────────

struct VideoCollect {
    remaining: usize,
    layers:    Vec<VideoLayer>,
    promise:   Option<Promise<VideoData>>,
}

fn hook_video(
    collect: &Arc<Mutex<VideoCollect>>,
    future: Pending<reelkit_media::reader::VideoFrame>,
    index: usize,
    is_b_side: bool,
    time: RationalTime,
) {
    let collect = Arc::clone(collect);
    future.on_settle(move |result| {
        let mut guard = collect.lock().unwrap();
        match result {
            Ok(frame) => {
                let slot = &mut guard.layers[index];
                if is_b_side {
                    slot.image_b = frame.image.clone();
                } else {
                    slot.image = frame.image.clone();
                }
            }
            Err(IoError::Cancelled) => {}
            Err(e) => warn!(time = %time, error = %e, "video read failed, layer stays null"),
        }
        guard.remaining -= 1;
        if guard.remaining == 0 {
            let layers = std::mem::take(&mut guard.layers);
            let promise = guard.promise.take().expect("settled once");
            drop(guard);
            promise.fulfill(Ok(VideoData { time, layers }));
        }
    });
}

struct AudioCollect {
    remaining:    usize,
    slots:        Vec<Vec<Option<Audio>>>,
    frame_counts: Vec<Vec<usize>>,
    promise:      Option<Promise<AudioData>>,
}

fn assemble_audio(
    seconds: i64,
    info: AudioInfo,
    bucket_frames: usize,
    slots: Vec<Vec<Option<Audio>>>,
    frame_counts: &[Vec<usize>],
) -> AudioData {
    let layers = slots
        .into_iter()
        .zip(frame_counts)
        .map(|(track_slots, track_frames)| {
            let blocks: Vec<Audio> = track_slots
                .into_iter()
                .zip(track_frames)
                .map(|(slot, frames)| slot.unwrap_or_else(|| Audio::silence(info, *frames)))
                .collect();
            AudioLayer {
                audio: Some(concat_trimmed(info, &blocks, bucket_frames)),
            }
        })
        .collect();
    AudioData { seconds, layers }
}
