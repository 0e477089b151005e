// crates/reelkit-timeline/src/io.rs
//
// The I/O manager: owns one reader per distinct path, coalesces identical
// in-flight requests, and bounds in-flight work per kind.
//
// Locking: one mutex over all bookkeeping; every reader call and every
// caller-facing fulfillment happens with the mutex released, so a reader
// that settles synchronously (or a completion callback that issues new
// reads) can never re-enter a held lock.
//
// Admission: requests beyond the per-kind cap wait in a FIFO queue. On
// each completion the next waiter is admitted, preferring the first one
// whose path differs from the last admitted path so a single source
// cannot monopolize the caps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use reelkit_core::{IoError, RationalTime, SeqPath, Signal, TimeRange};
use reelkit_media::future::{pair, Pending, Promise};
use reelkit_media::plugin::PluginRegistry;
use reelkit_media::reader::{AudioBlock, Info, Reader, VideoFrame};

use crate::options::Options;

/// Admission deadline = `request_timeout * ADMISSION_RETRIES`; waiters
/// older than this resolve with `Timeout` on the next maintain sweep.
const ADMISSION_RETRIES: u32 = 1000;

// ── Keys ──────────────────────────────────────────────────────────────────────
//
// Times are keyed bitwise: two requests coalesce only when their
// (value, rate) pairs are bit-identical, matching RationalTime equality.

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct VideoKey {
    path:  String,
    value: u64,
    rate:  u64,
    layer: u16,
}

impl VideoKey {
    fn new(path: &SeqPath, time: RationalTime, layer: u16) -> VideoKey {
        VideoKey {
            path:  path.full(),
            value: time.value.to_bits(),
            rate:  time.rate.to_bits(),
            layer,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AudioKey {
    path:     String,
    start:    u64,
    duration: u64,
    rate:     u64,
}

impl AudioKey {
    fn new(path: &SeqPath, range: TimeRange) -> AudioKey {
        AudioKey {
            path:     path.full(),
            start:    range.start.value.to_bits(),
            duration: range.duration.value.to_bits(),
            rate:     range.start.rate.to_bits(),
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

struct ReaderSlot {
    reader:    Arc<dyn Reader>,
    last_used: Instant,
}

struct VideoWaiter {
    path:     SeqPath,
    time:     RationalTime,
    layer:    u16,
    promise:  Promise<VideoFrame>,
    key:      VideoKey,
    enqueued: Instant,
}

struct AudioWaiter {
    path:     SeqPath,
    range:    TimeRange,
    promise:  Promise<AudioBlock>,
    key:      AudioKey,
    enqueued: Instant,
}

#[derive(Default)]
struct State {
    readers:          HashMap<String, ReaderSlot>,
    video_pending:    HashMap<VideoKey, Pending<VideoFrame>>,
    audio_pending:    HashMap<AudioKey, Pending<AudioBlock>>,
    video_in_flight:  usize,
    audio_in_flight:  usize,
    video_waiters:    VecDeque<VideoWaiter>,
    audio_waiters:    VecDeque<AudioWaiter>,
    last_video_path:  Option<String>,
    last_audio_path:  Option<String>,
    active_paths:     HashSet<String>,
}

struct Shared {
    registry: Arc<PluginRegistry>,
    options:  Options,
    state:    Mutex<State>,
    cancel:   Signal<bool>,
}

#[derive(Clone)]
pub struct IoManager {
    shared: Arc<Shared>,
}

impl IoManager {
    pub fn new(registry: Arc<PluginRegistry>, options: Options) -> IoManager {
        IoManager {
            shared: Arc::new(Shared {
                registry,
                options,
                state: Mutex::new(State::default()),
                cancel: Signal::new(false),
            }),
        }
    }

    /// Broadcast signal fired by `cancel_requests`.
    pub fn observe_cancel_requests(&self) -> Signal<bool> {
        self.shared.cancel.clone()
    }

    pub fn get_info(&self, path: &SeqPath) -> Pending<Info> {
        match reader_for(&self.shared, path) {
            Ok(reader) => reader.get_info(),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    /// Open the reader for `path` ahead of need. Failures only log; the
    /// first real read will surface them.
    pub fn prime(&self, path: &SeqPath) {
        if let Err(e) = reader_for(&self.shared, path) {
            warn!(path = %path, error = %e, "pre-open failed");
        }
    }

    pub fn read_video(
        &self,
        path: &SeqPath,
        time: RationalTime,
        layer: u16,
    ) -> Pending<VideoFrame> {
        let key = VideoKey::new(path, time, layer);
        let (promise, pending) = {
            let mut state = self.shared.state.lock();
            if let Some(existing) = state.video_pending.get(&key) {
                return existing.clone();
            }
            let (promise, pending) = pair::<VideoFrame>();
            state.video_pending.insert(key.clone(), pending.clone());
            if state.video_in_flight < self.shared.options.video_request_count {
                state.video_in_flight += 1;
                state.last_video_path = Some(key.path.clone());
                (Some(promise), pending)
            } else {
                state.video_waiters.push_back(VideoWaiter {
                    path: path.clone(),
                    time,
                    layer,
                    promise,
                    key: key.clone(),
                    enqueued: Instant::now(),
                });
                (None, pending)
            }
        };
        if let Some(promise) = promise {
            dispatch_video(&self.shared, path.clone(), time, layer, promise, key);
        }
        pending
    }

    pub fn read_audio(&self, path: &SeqPath, range: TimeRange) -> Pending<AudioBlock> {
        let key = AudioKey::new(path, range);
        let (promise, pending) = {
            let mut state = self.shared.state.lock();
            if let Some(existing) = state.audio_pending.get(&key) {
                return existing.clone();
            }
            let (promise, pending) = pair::<AudioBlock>();
            state.audio_pending.insert(key.clone(), pending.clone());
            if state.audio_in_flight < self.shared.options.audio_request_count {
                state.audio_in_flight += 1;
                state.last_audio_path = Some(key.path.clone());
                (Some(promise), pending)
            } else {
                state.audio_waiters.push_back(AudioWaiter {
                    path: path.clone(),
                    range,
                    promise,
                    key: key.clone(),
                    enqueued: Instant::now(),
                });
                (None, pending)
            }
        };
        if let Some(promise) = promise {
            dispatch_audio(&self.shared, path.clone(), range, promise, key);
        }
        pending
    }

    /// Replace the retention set. Returns paths that are newly active so
    /// the engine can pre-open them.
    pub fn set_active_paths(&self, paths: HashSet<String>) -> Vec<String> {
        let mut state = self.shared.state.lock();
        let added = paths
            .iter()
            .filter(|p| !state.active_paths.contains(*p))
            .cloned()
            .collect();
        state.active_paths = paths;
        added
    }

    /// Fail every queued waiter with `Cancelled`, tell every reader to
    /// cancel what it holds, and fire the cancel signal. Readers stay
    /// open; in-flight completions still run their bookkeeping.
    pub fn cancel_requests(&self) {
        self.shared.cancel.set_always(true);
        let (video_waiters, audio_waiters, readers) = {
            let mut state = self.shared.state.lock();
            let video: Vec<VideoWaiter> = state.video_waiters.drain(..).collect();
            let audio: Vec<AudioWaiter> = state.audio_waiters.drain(..).collect();
            for waiter in &video {
                state.video_pending.remove(&waiter.key);
            }
            for waiter in &audio {
                state.audio_pending.remove(&waiter.key);
            }
            let readers: Vec<Arc<dyn Reader>> =
                state.readers.values().map(|s| Arc::clone(&s.reader)).collect();
            (video, audio, readers)
        };
        for waiter in video_waiters {
            waiter.promise.fulfill(Err(IoError::Cancelled));
        }
        for waiter in audio_waiters {
            waiter.promise.fulfill(Err(IoError::Cancelled));
        }
        for reader in readers {
            reader.cancel_requests();
        }
    }

    /// Periodic sweep: expire over-age waiters with `Timeout`, stop and
    /// drop readers that are idle and outside every active range.
    pub fn maintain(&self) {
        let deadline = self.shared.options.request_timeout * ADMISSION_RETRIES;
        let idle = self.shared.options.reader_idle_timeout;
        let now = Instant::now();

        let (timed_out_video, timed_out_audio, evicted) = {
            let mut state = self.shared.state.lock();

            let mut timed_out_video = Vec::new();
            let mut keep = VecDeque::new();
            while let Some(waiter) = state.video_waiters.pop_front() {
                if now.duration_since(waiter.enqueued) >= deadline {
                    state.video_pending.remove(&waiter.key);
                    timed_out_video.push(waiter);
                } else {
                    keep.push_back(waiter);
                }
            }
            state.video_waiters = keep;

            let mut timed_out_audio = Vec::new();
            let mut keep = VecDeque::new();
            while let Some(waiter) = state.audio_waiters.pop_front() {
                if now.duration_since(waiter.enqueued) >= deadline {
                    state.audio_pending.remove(&waiter.key);
                    timed_out_audio.push(waiter);
                } else {
                    keep.push_back(waiter);
                }
            }
            state.audio_waiters = keep;

            let evict: Vec<String> = state
                .readers
                .iter()
                .filter(|(path, slot)| {
                    !state.active_paths.contains(*path)
                        && !slot.reader.has_requests()
                        && now.duration_since(slot.last_used) >= idle
                })
                .map(|(path, _)| path.clone())
                .collect();
            let evicted: Vec<(String, Arc<dyn Reader>)> = evict
                .into_iter()
                .filter_map(|path| {
                    state.readers.remove(&path).map(|slot| (path, slot.reader))
                })
                .collect();

            (timed_out_video, timed_out_audio, evicted)
        };

        for waiter in timed_out_video {
            warn!(path = %waiter.path, "video request admission timed out");
            waiter.promise.fulfill(Err(IoError::Timeout));
        }
        for waiter in timed_out_audio {
            warn!(path = %waiter.path, "audio request admission timed out");
            waiter.promise.fulfill(Err(IoError::Timeout));
        }
        for (path, reader) in evicted {
            debug!(path = %path, "stopping idle reader");
            reader.stop();
        }
    }

    /// Paths with a live reader. Diagnostics and tests.
    pub fn open_paths(&self) -> Vec<String> {
        self.shared.state.lock().readers.keys().cloned().collect()
    }
}

// ── Dispatch & completion ─────────────────────────────────────────────────────
//
// Free functions over the shared state so completion callbacks (which run
// on reader worker threads) can drive admission without an IoManager.

fn reader_for(shared: &Arc<Shared>, path: &SeqPath) -> Result<Arc<dyn Reader>, IoError> {
    let key = path.full();
    if let Some(slot) = shared.state.lock().readers.get_mut(&key) {
        slot.last_used = Instant::now();
        return Ok(Arc::clone(&slot.reader));
    }
    // Open outside the lock; creation spawns the reader's worker but does
    // no blocking I/O.
    let created: Arc<dyn Reader> =
        Arc::from(shared.registry.read(path, &shared.options.io)?);
    let mut state = shared.state.lock();
    let slot = state.readers.entry(key).or_insert_with(|| {
        debug!(path = %path, "opened reader");
        ReaderSlot { reader: created, last_used: Instant::now() }
    });
    slot.last_used = Instant::now();
    Ok(Arc::clone(&slot.reader))
}

fn dispatch_video(
    shared: &Arc<Shared>,
    path: SeqPath,
    time: RationalTime,
    layer: u16,
    promise: Promise<VideoFrame>,
    key: VideoKey,
) {
    match reader_for(shared, &path) {
        Ok(reader) => {
            let inner = reader.read_video(time, layer);
            let shared = Arc::clone(shared);
            inner.on_settle(move |result| {
                complete_video(&shared, &key);
                promise.fulfill(result.clone());
            });
        }
        Err(e) => {
            complete_video(shared, &key);
            promise.fulfill(Err(e));
        }
    }
}

fn dispatch_audio(
    shared: &Arc<Shared>,
    path: SeqPath,
    range: TimeRange,
    promise: Promise<AudioBlock>,
    key: AudioKey,
) {
    match reader_for(shared, &path) {
        Ok(reader) => {
            let inner = reader.read_audio(range);
            let shared = Arc::clone(shared);
            inner.on_settle(move |result| {
                complete_audio(&shared, &key);
                promise.fulfill(result.clone());
            });
        }
        Err(e) => {
            complete_audio(shared, &key);
            promise.fulfill(Err(e));
        }
    }
}

fn complete_video(shared: &Arc<Shared>, key: &VideoKey) {
    let next = {
        let mut state = shared.state.lock();
        state.video_in_flight = state.video_in_flight.saturating_sub(1);
        state.video_pending.remove(key);
        if let Some(slot) = state.readers.get_mut(&key.path) {
            slot.last_used = Instant::now();
        }
        let last = state.last_video_path.clone();
        let next = pop_fair(&mut state.video_waiters, last.as_deref());
        if let Some(waiter) = &next {
            state.video_in_flight += 1;
            state.last_video_path = Some(waiter.key.path.clone());
        }
        next
    };
    if let Some(waiter) = next {
        dispatch_video(
            shared,
            waiter.path,
            waiter.time,
            waiter.layer,
            waiter.promise,
            waiter.key,
        );
    }
}

fn complete_audio(shared: &Arc<Shared>, key: &AudioKey) {
    let next = {
        let mut state = shared.state.lock();
        state.audio_in_flight = state.audio_in_flight.saturating_sub(1);
        state.audio_pending.remove(key);
        if let Some(slot) = state.readers.get_mut(&key.path) {
            slot.last_used = Instant::now();
        }
        let last = state.last_audio_path.clone();
        let next = pop_fair_audio(&mut state.audio_waiters, last.as_deref());
        if let Some(waiter) = &next {
            state.audio_in_flight += 1;
            state.last_audio_path = Some(waiter.key.path.clone());
        }
        next
    };
    if let Some(waiter) = next {
        dispatch_audio(shared, waiter.path, waiter.range, waiter.promise, waiter.key);
    }
}

/// FIFO with a per-path twist: prefer the first waiter on a different path
/// than the one just admitted, falling back to the queue head.
fn pop_fair(waiters: &mut VecDeque<VideoWaiter>, last: Option<&str>) -> Option<VideoWaiter> {
    let position = match last {
        Some(last) => waiters
            .iter()
            .position(|w| w.key.path != last)
            .unwrap_or(0),
        None => 0,
    };
    waiters.remove(position)
}

fn pop_fair_audio(waiters: &mut VecDeque<AudioWaiter>, last: Option<&str>) -> Option<AudioWaiter> {
    let position = match last {
        Some(last) => waiters
            .iter()
            .position(|w| w.key.path != last)
            .unwrap_or(0),
        None => 0,
    };
    waiters.remove(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{Counters, FakePlugin, Gate};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn manager(plugin: FakePlugin, options: Options) -> IoManager {
        let registry = Arc::new(PluginRegistry::with_plugins(vec![Arc::new(plugin)]));
        IoManager::new(registry, options)
    }

    fn path(name: &str) -> SeqPath {
        SeqPath::parse(name)
    }

    fn t(frame: f64) -> RationalTime {
        RationalTime::new(frame, 24.0)
    }

    #[test]
    fn identical_requests_share_one_dispatch() {
        let counters = Arc::new(Counters::default());
        let gate = Arc::new(Gate::default());
        let io = manager(
            FakePlugin::gated(Arc::clone(&counters), Arc::clone(&gate)),
            Options::default(),
        );

        let first = io.read_video(&path("a.fake"), t(10.0), 0);
        let second = io.read_video(&path("a.fake"), t(10.0), 0);
        assert_eq!(counters.video_reads.load(Ordering::SeqCst), 1);
        assert_eq!(gate.held_count(), 1);

        gate.release_all(&counters);
        let a = first.wait().unwrap();
        let b = second.wait().unwrap();
        assert_eq!(a, b);

        // The key clears on completion; the same request dispatches anew.
        let again = io.read_video(&path("a.fake"), t(10.0), 0);
        assert_eq!(counters.video_reads.load(Ordering::SeqCst), 2);
        gate.release_all(&counters);
        again.wait().unwrap();
    }

    #[test]
    fn different_layers_do_not_coalesce() {
        let counters = Arc::new(Counters::default());
        let gate = Arc::new(Gate::default());
        let io = manager(
            FakePlugin::gated(Arc::clone(&counters), Arc::clone(&gate)),
            Options::default(),
        );
        let _a = io.read_video(&path("a.fake"), t(1.0), 0);
        let _b = io.read_video(&path("a.fake"), t(1.0), 1);
        assert_eq!(counters.video_reads.load(Ordering::SeqCst), 2);
        gate.release_all(&counters);
    }

    #[test]
    fn in_flight_never_exceeds_the_cap() {
        let counters = Arc::new(Counters::default());
        let gate = Arc::new(Gate::default());
        let options = Options { video_request_count: 4, ..Options::default() };
        let io = manager(
            FakePlugin::gated(Arc::clone(&counters), Arc::clone(&gate)),
            options,
        );

        let futures: Vec<_> = (0..10)
            .map(|i| io.read_video(&path(&format!("clip{i}.fake")), t(0.0), 0))
            .collect();
        assert_eq!(counters.video_reads.load(Ordering::SeqCst), 4);
        assert_eq!(gate.held_count(), 4);

        // Each release admits the next wave; the cap holds throughout.
        while futures.iter().any(|f| !f.is_ready()) {
            gate.release_all(&counters);
        }
        assert!(counters.max_concurrent.load(Ordering::SeqCst) <= 4);
        for future in futures {
            assert!(future.wait().is_ok());
        }
        assert_eq!(counters.video_reads.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn admission_prefers_a_different_path() {
        let counters = Arc::new(Counters::default());
        let gate = Arc::new(Gate::default());
        let options = Options { video_request_count: 1, ..Options::default() };
        let io = manager(
            FakePlugin::gated(Arc::clone(&counters), Arc::clone(&gate)),
            options,
        );

        let _a1 = io.read_video(&path("a.fake"), t(1.0), 0);
        let _a2 = io.read_video(&path("a.fake"), t(2.0), 0);
        let _a3 = io.read_video(&path("a.fake"), t(3.0), 0);
        let _b1 = io.read_video(&path("b.fake"), t(1.0), 0);
        assert_eq!(gate.held_paths(), vec!["a.fake"]);

        // "a" was admitted last, so the queued "b" jumps the two queued
        // "a" requests.
        gate.release_all(&counters);
        assert_eq!(gate.held_paths(), vec!["b.fake"]);
        gate.release_all(&counters);
        assert_eq!(gate.held_paths(), vec!["a.fake"]);
    }

    #[test]
    fn cancel_resolves_everything_and_fires_the_signal() {
        let counters = Arc::new(Counters::default());
        let gate = Arc::new(Gate::default());
        let options = Options { video_request_count: 1, ..Options::default() };
        let io = manager(
            FakePlugin::gated(Arc::clone(&counters), Arc::clone(&gate)),
            options,
        );

        let fired = Arc::new(AtomicBool::new(false));
        let sink = Arc::clone(&fired);
        let _token = io.observe_cancel_requests().observe(move |v| {
            if *v {
                sink.store(true, Ordering::SeqCst);
            }
        });

        let futures: Vec<_> = (0..5)
            .map(|i| io.read_video(&path(&format!("clip{i}.fake")), t(0.0), 0))
            .collect();
        io.cancel_requests();

        for future in futures {
            let result = future.wait_for(Duration::from_millis(100));
            assert_eq!(result, Some(Err(IoError::Cancelled)));
        }
        assert!(fired.load(Ordering::SeqCst));

        // The manager stays usable after a cancel.
        let after = io.read_video(&path("clip0.fake"), t(1.0), 0);
        gate.release_all(&counters);
        assert!(after.wait().is_ok());
    }

    #[test]
    fn idle_readers_outside_active_paths_are_evicted() {
        let counters = Arc::new(Counters::default());
        let options = Options {
            reader_idle_timeout: Duration::from_millis(30),
            ..Options::default()
        };
        let io = manager(FakePlugin::immediate(Arc::clone(&counters)), options);

        io.read_video(&path("a.fake"), t(0.0), 0).wait().unwrap();
        io.read_video(&path("b.fake"), t(0.0), 0).wait().unwrap();
        assert_eq!(io.open_paths().len(), 2);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);

        io.set_active_paths(["a.fake".to_string()].into_iter().collect());
        std::thread::sleep(Duration::from_millis(60));
        io.maintain();
        assert_eq!(io.open_paths(), vec!["a.fake".to_string()]);

        // A later read reopens the evicted path.
        io.read_video(&path("b.fake"), t(1.0), 0).wait().unwrap();
        assert_eq!(counters.opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn queued_waiters_time_out() {
        let counters = Arc::new(Counters::default());
        let gate = Arc::new(Gate::default());
        let options = Options {
            video_request_count: 1,
            request_timeout: Duration::from_micros(10),
            ..Options::default()
        };
        let io = manager(
            FakePlugin::gated(Arc::clone(&counters), Arc::clone(&gate)),
            options,
        );

        let _held = io.read_video(&path("a.fake"), t(0.0), 0);
        let queued = io.read_video(&path("b.fake"), t(0.0), 0);
        std::thread::sleep(Duration::from_millis(30));
        io.maintain();
        assert_eq!(queued.try_get(), Some(Err(IoError::Timeout)));
        gate.release_all(&counters);
    }

    #[test]
    fn unresolvable_path_fails_without_poisoning_admission() {
        let counters = Arc::new(Counters::default());
        let io = manager(FakePlugin::immediate(counters), Options::default());
        let result = io.read_video(&path("clip.nope"), t(0.0), 0).wait();
        assert!(matches!(result, Err(IoError::NotFound { .. })));
        // The failed dispatch released its admission slot.
        let ok = io.read_video(&path("clip.fake"), t(0.0), 0).wait();
        assert!(ok.is_ok());
    }
}
