// crates/reelkit-timeline/src/player.rs
//
// The playback controller: transport state over a PlaybackEngine, driven
// by an external frame timer calling tick(). Each tick advances the
// rational clock, keeps a small read-ahead of video frames and audio
// seconds in flight, publishes the newest displayable frame, and drops
// requests the playhead has passed.
//
// All methods run on the owner thread; only the published signals cross
// threads.

use std::sync::Arc;
use std::time::Instant;

use reelkit_core::{time_equals, RationalTime, Signal, TimeRange};
use reelkit_media::future::Pending;

use crate::engine::{AudioData, PlaybackEngine, VideoData};

/// Frames requested ahead of the playhead.
const VIDEO_PREFETCH_FRAMES: i64 = 8;
/// Whole seconds of audio requested ahead of the playhead.
const AUDIO_PREFETCH_SECONDS: i64 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Playback {
    #[default]
    Stop,
    Forward,
    Reverse,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoopMode {
    /// Wrap to the in-point at the out-point.
    #[default]
    Loop,
    /// Clamp at the out-point and stop.
    Once,
    /// Flip direction at either endpoint.
    PingPong,
}

pub struct Player {
    engine:         Arc<PlaybackEngine>,
    rate:           f64,
    playback:       Signal<Playback>,
    loop_mode:      Signal<LoopMode>,
    current_time:   Signal<RationalTime>,
    in_out:         Signal<TimeRange>,
    speed:          Signal<f64>,
    current_video:  Signal<Option<VideoData>>,
    video_requests: Vec<(RationalTime, Pending<VideoData>)>,
    audio_requests: Vec<(i64, Pending<AudioData>)>,
    last_tick:      Option<Instant>,
    /// Fractional frames carried between ticks so odd tick rates do not
    /// drop time.
    frame_accum:    f64,
}

impl Player {
    pub fn new(engine: Arc<PlaybackEngine>) -> Player {
        let duration = engine.get_duration();
        let start = engine.get_global_start_time().rescaled_to(duration.rate);
        let full_range = TimeRange::new(start, duration);
        Player {
            engine,
            rate: duration.rate,
            playback: Signal::new(Playback::Stop),
            loop_mode: Signal::new(LoopMode::Loop),
            current_time: Signal::new(start),
            in_out: Signal::new(full_range),
            speed: Signal::new(1.0),
            current_video: Signal::new(None),
            video_requests: Vec::new(),
            audio_requests: Vec::new(),
            last_tick: None,
            frame_accum: 0.0,
        }
    }

    // ── Observables ───────────────────────────────────────────────────────────

    pub fn observe_current_time(&self) -> Signal<RationalTime> {
        self.current_time.clone()
    }

    pub fn observe_playback(&self) -> Signal<Playback> {
        self.playback.clone()
    }

    pub fn observe_loop_mode(&self) -> Signal<LoopMode> {
        self.loop_mode.clone()
    }

    pub fn observe_in_out_range(&self) -> Signal<TimeRange> {
        self.in_out.clone()
    }

    pub fn observe_speed(&self) -> Signal<f64> {
        self.speed.clone()
    }

    /// Latest frame at or behind the playhead, for the renderer.
    pub fn observe_current_video(&self) -> Signal<Option<VideoData>> {
        self.current_video.clone()
    }

    // ── Transport ─────────────────────────────────────────────────────────────

    pub fn play(&mut self, direction: Playback) {
        self.playback.set(direction);
    }

    pub fn stop(&mut self) {
        self.playback.set(Playback::Stop);
    }

    pub fn toggle(&mut self) {
        match self.playback.get() {
            Playback::Stop => self.playback.set(Playback::Forward),
            Playback::Forward | Playback::Reverse => self.playback.set(Playback::Stop),
        }
    }

    /// Jump to `time`, clamped to the in/out range. Outstanding requests
    /// are cancelled; the new position re-primes on the next tick.
    pub fn seek(&mut self, time: RationalTime) {
        let clamped = self.clamp_to_in_out(time.rescaled_to(self.rate));
        if time_equals(clamped, self.current_time.get()) {
            return;
        }
        self.engine.cancel_requests();
        self.video_requests.clear();
        self.audio_requests.clear();
        self.frame_accum = 0.0;
        self.current_time.set(clamped);
    }

    pub fn start_frame(&mut self) {
        self.seek(self.in_out.get().start);
    }

    pub fn end_frame(&mut self) {
        self.seek(self.in_out.get().end_time_inclusive());
    }

    pub fn prev_frame(&mut self) {
        self.seek(self.current_time.get() - RationalTime::one_tick(self.rate));
    }

    pub fn next_frame(&mut self) {
        self.seek(self.current_time.get() + RationalTime::one_tick(self.rate));
    }

    pub fn set_in_out(&mut self, range: TimeRange) {
        self.in_out.set(TimeRange::new(
            range.start.rescaled_to(self.rate),
            range.duration.rescaled_to(self.rate),
        ));
        let clamped = self.clamp_to_in_out(self.current_time.get());
        self.current_time.set(clamped);
    }

    pub fn set_loop(&mut self, mode: LoopMode) {
        self.loop_mode.set(mode);
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.speed.set(speed.max(0.0));
    }

    // ── Tick ──────────────────────────────────────────────────────────────────

    /// Advance the clock and service the read-ahead. Never blocks: all
    /// futures are polled with `try_get`.
    pub fn tick(&mut self, now: Instant) {
        let elapsed = self
            .last_tick
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_tick = Some(now);

        let playback = self.playback.get();
        if playback != Playback::Stop && elapsed > 0.0 {
            self.frame_accum += elapsed * self.rate * self.speed.get();
            let whole = self.frame_accum.floor();
            self.frame_accum -= whole;
            if whole > 0.0 {
                let direction = if playback == Playback::Forward { 1.0 } else { -1.0 };
                let advanced = self.current_time.get()
                    + RationalTime::new(whole * direction, self.rate);
                let bounded = self.apply_boundary(advanced, playback);
                self.current_time.set(bounded);
            }
        }

        self.request_ahead();
        self.publish_ready();
        self.drop_stale();

        let window = self.prefetch_window();
        self.engine.set_active_ranges(vec![window]);
        self.engine.tick();
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn clamp_to_in_out(&self, time: RationalTime) -> RationalTime {
        let range = self.in_out.get();
        let lo = range.start.value;
        let hi = range.end_time_inclusive().value;
        RationalTime::new(time.rescaled_to(self.rate).value.clamp(lo, hi), self.rate)
    }

    fn apply_boundary(&mut self, time: RationalTime, playback: Playback) -> RationalTime {
        let range = self.in_out.get();
        let first = range.start;
        let last = range.end_time_inclusive();
        match playback {
            Playback::Forward if time.value > last.value => match self.loop_mode.get() {
                LoopMode::Once => {
                    self.playback.set(Playback::Stop);
                    last
                }
                LoopMode::Loop => first,
                LoopMode::PingPong => {
                    self.playback.set(Playback::Reverse);
                    // Reflect the overshoot back inside the range.
                    let reflected = 2.0 * last.value - time.value;
                    RationalTime::new(reflected.clamp(first.value, last.value), self.rate)
                }
            },
            Playback::Reverse if time.value < first.value => match self.loop_mode.get() {
                LoopMode::Once => {
                    self.playback.set(Playback::Stop);
                    first
                }
                LoopMode::Loop => last,
                LoopMode::PingPong => {
                    self.playback.set(Playback::Forward);
                    let reflected = 2.0 * first.value - time.value;
                    RationalTime::new(reflected.clamp(first.value, last.value), self.rate)
                }
            },
            _ => time,
        }
    }

    /// Window the player promises to play through soon: the playhead plus
    /// the prefetch frames in the direction of travel.
    fn prefetch_window(&self) -> TimeRange {
        let current = self.current_time.get();
        let frames = VIDEO_PREFETCH_FRAMES as f64;
        let range = match self.playback.get() {
            Playback::Reverse => TimeRange::new(
                RationalTime::new(current.value - frames, self.rate),
                RationalTime::new(frames + 1.0, self.rate),
            ),
            _ => TimeRange::new(current, RationalTime::new(frames + 1.0, self.rate)),
        };
        let start = self.engine.get_global_start_time().rescaled_to(self.rate);
        let duration = self.engine.get_duration().rescaled_to(self.rate);
        TimeRange::new(
            RationalTime::new(
                range.start.value.clamp(start.value, start.value + duration.value),
                self.rate,
            ),
            range.duration,
        )
    }

    fn request_ahead(&mut self) {
        let current = self.current_time.get();
        let playback = self.playback.get();
        let range = self.in_out.get();

        let count = if playback == Playback::Stop { 1 } else { VIDEO_PREFETCH_FRAMES };
        let step = if playback == Playback::Reverse { -1.0 } else { 1.0 };
        for i in 0..count {
            let t = RationalTime::new(current.value + i as f64 * step, self.rate);
            if !range.contains(t) && !time_equals(t, range.end_time_inclusive()) {
                continue;
            }
            let already = self
                .video_requests
                .iter()
                .any(|(requested, _)| time_equals(*requested, t));
            if !already {
                let future = self.engine.get_video(t, 0);
                self.video_requests.push((t, future));
            }
        }

        if self.engine.get_av_info().audio.is_some() {
            let first_second = current.to_seconds().floor() as i64;
            let end_second = range.end_time_exclusive().to_seconds().ceil() as i64;
            for second in first_second..(first_second + AUDIO_PREFETCH_SECONDS) {
                if second >= end_second {
                    break;
                }
                let already = self.audio_requests.iter().any(|(s, _)| *s == second);
                if !already {
                    let future = self.engine.get_audio(second);
                    self.audio_requests.push((second, future));
                }
            }
        }
    }

    /// Publish the ready frame closest to the playhead on its passed side.
    fn publish_ready(&mut self) {
        let current = self.current_time.get();
        let reverse = self.playback.get() == Playback::Reverse;
        let mut best: Option<(f64, VideoData)> = None;
        for (time, future) in &self.video_requests {
            let passed = if reverse {
                time.value >= current.value
            } else {
                time.value <= current.value
            };
            if !passed {
                continue;
            }
            if let Some(Ok(data)) = future.try_get() {
                let distance = (current.value - time.value).abs();
                let closer = best
                    .as_ref()
                    .map(|(d, _)| distance < *d)
                    .unwrap_or(true);
                if closer {
                    best = Some((distance, data));
                }
            }
        }
        if let Some((_, data)) = best {
            let newer = self
                .current_video
                .get()
                .map(|shown| !time_equals(shown.time, data.time))
                .unwrap_or(true);
            if newer {
                self.current_video.set_always(Some(data));
            }
        }
    }

    /// Drop requests strictly behind the playhead. Dropping detaches this
    /// waiter without cancelling coalesced peers.
    fn drop_stale(&mut self) {
        let current = self.current_time.get();
        let reverse = self.playback.get() == Playback::Reverse;
        self.video_requests.retain(|(time, _)| {
            if reverse {
                time.value <= current.value
            } else {
                time.value >= current.value
            }
        });
        let current_second = current.to_seconds().floor() as i64;
        self.audio_requests.retain(|(second, _)| *second >= current_second);
    }
}
