// crates/reelkit-timeline/src/resolve.rs
//
// The composition resolver: maps a composition time to the set of source
// reads needed to synthesize that moment, without touching any I/O.
//
// Matching rule: children are tested in order against their half-open
// composition ranges; zero-duration children never match. A boundary time
// therefore belongs to the child that starts there. Nested stacks resolve
// depth-first, first track that produces a read wins.

use std::collections::HashSet;

use reelkit_core::edl::{Clip, Composable, Timeline, Track, TrackKind, Transition};
use reelkit_core::{IoError, RationalTime, SeqPath, TimeRange};

// ── Video ─────────────────────────────────────────────────────────────────────

/// One source read: which asset, at which media time.
#[derive(Clone, Debug, PartialEq)]
pub struct ClipRead {
    pub path: SeqPath,
    pub time: RationalTime,
}

/// What one video layer needs at the requested time. `read` is `None` over
/// gaps; `read_b` is present only inside a dissolve window.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerPlan {
    pub track:            usize,
    pub read:             Option<ClipRead>,
    pub read_b:           Option<ClipRead>,
    pub transition:       Transition,
    pub transition_value: f32,
}

impl LayerPlan {
    fn empty(track: usize) -> LayerPlan {
        LayerPlan {
            track,
            read: None,
            read_b: None,
            transition: Transition::None,
            transition_value: 0.0,
        }
    }
}

/// Read plan for every video layer at `time`, bottom track first.
pub fn video_plan(timeline: &Timeline, time: RationalTime) -> Result<Vec<LayerPlan>, IoError> {
    if !timeline.range().contains(time) {
        return Err(IoError::OutOfRange { value: time.value, rate: time.rate });
    }
    let local = time - timeline.global_start_time;
    Ok(timeline
        .stack
        .tracks_of_kind(TrackKind::Video)
        .enumerate()
        .map(|(index, track)| {
            let mut plan = resolve_video_track(track, local);
            plan.track = index;
            plan
        })
        .collect())
}

fn resolve_video_track(track: &Track, time: RationalTime) -> LayerPlan {
    let ranges = track.child_ranges();
    let found = track.children.iter().enumerate().find(|(i, child)| {
        !matches!(child, Composable::Transition(_))
            && ranges[*i].duration.value > 0.0
            && ranges[*i].contains(time)
    });
    let (index, child) = match found {
        Some(hit) => hit,
        None => return LayerPlan::empty(0),
    };

    match child {
        Composable::Gap(_) => LayerPlan::empty(0),
        Composable::Stack(stack) => {
            let local = time - ranges[index].start;
            stack
                .tracks_of_kind(TrackKind::Video)
                .map(|sub| resolve_video_track(sub, local))
                .find(|plan| plan.read.is_some())
                .unwrap_or_else(|| LayerPlan::empty(0))
        }
        Composable::Clip(clip) => {
            let mut plan = LayerPlan::empty(0);
            plan.read = Some(clip_read(clip, time, ranges[index].start));

            // Dissolve window around the cut behind this clip: the previous
            // clip is the outgoing A side, this clip is B.
            if let Some((item, prev)) = neighbor_transition(track, index, -1) {
                let cut = ranges[index].start;
                if item.kind == Transition::Dissolve
                    && in_window(time, cut, item.in_offset, item.out_offset)
                {
                    let prev_start = ranges[index - 2].start;
                    plan.read_b = plan.read.take();
                    plan.read = Some(clip_read(prev, time, prev_start));
                    plan.transition = Transition::Dissolve;
                    plan.transition_value =
                        transition_value(time, cut, item.in_offset, item.out_offset);
                    return plan;
                }
            }

            // Dissolve window around the cut ahead: this clip is A, the
            // next clip is B.
            if let Some((item, next)) = neighbor_transition(track, index, 1) {
                let cut = ranges[index].end_time_exclusive();
                if item.kind == Transition::Dissolve
                    && in_window(time, cut, item.in_offset, item.out_offset)
                {
                    let next_start = ranges[index + 2].start;
                    plan.read_b = Some(clip_read(next, time, next_start));
                    plan.transition = Transition::Dissolve;
                    plan.transition_value =
                        transition_value(time, cut, item.in_offset, item.out_offset);
                }
            }
            plan
        }
        Composable::Transition(_) => unreachable!("filtered above"),
    }
}

/// The transition item adjacent to child `index` (direction -1 = behind,
/// +1 = ahead) together with the clip on its far side.
fn neighbor_transition(
    track: &Track,
    index: usize,
    direction: i64,
) -> Option<(&reelkit_core::edl::TransitionItem, &Clip)> {
    let item_index = index.checked_add_signed(direction as isize)?;
    let clip_index = index.checked_add_signed(direction as isize * 2)?;
    let item = match track.children.get(item_index)? {
        Composable::Transition(item) => item,
        _ => return None,
    };
    let clip = match track.children.get(clip_index)? {
        Composable::Clip(clip) => clip,
        _ => return None,
    };
    Some((item, clip))
}

/// Closed window `[cut - in_offset, cut + out_offset]`: the exact endpoints
/// report transition values 0 and 1.
fn in_window(
    time: RationalTime,
    cut: RationalTime,
    in_offset: RationalTime,
    out_offset: RationalTime,
) -> bool {
    let t = time.rescaled_to(cut.rate).value;
    let lo = (cut - in_offset).value;
    let hi = (cut + out_offset).value;
    t >= lo && t <= hi
}

fn transition_value(
    time: RationalTime,
    cut: RationalTime,
    in_offset: RationalTime,
    out_offset: RationalTime,
) -> f32 {
    let t = time.rescaled_to(cut.rate).value;
    let lo = (cut - in_offset).value;
    let width = in_offset.rescaled_to(cut.rate).value + out_offset.rescaled_to(cut.rate).value;
    if width <= 0.0 {
        return 1.0;
    }
    (((t - lo) / width) as f32).clamp(0.0, 1.0)
}

/// Media time for `clip` at composition time `time`, given where the clip
/// starts in the composition. Falls back to the composition rate when the
/// clip's media rate is unknown.
fn clip_read(clip: &Clip, time: RationalTime, clip_start: RationalTime) -> ClipRead {
    let offset = time - clip_start;
    let source_start = clip.source_range.start;
    let media_time = if source_start.is_invalid() {
        offset
    } else {
        source_start + offset
    };
    ClipRead { path: clip.path.clone(), time: media_time }
}

// ── Audio ─────────────────────────────────────────────────────────────────────

/// A slice of one audio bucket, in composition order. `read` is `None` for
/// silence of the same duration.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioSegment {
    pub read:     Option<(SeqPath, TimeRange)>,
    pub duration: RationalTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackAudioPlan {
    pub track:    usize,
    pub segments: Vec<AudioSegment>,
}

/// Per-track segments covering the whole-second bucket `[seconds,
/// seconds + 1)`. Tracks that end inside the bucket leave it short; the
/// engine pads the tail to a full second.
pub fn audio_plan(timeline: &Timeline, seconds: i64) -> Vec<TrackAudioPlan> {
    let bucket = TimeRange::new(
        RationalTime::new(seconds as f64, 1.0) - timeline.global_start_time,
        RationalTime::new(1.0, 1.0),
    );
    timeline
        .stack
        .tracks_of_kind(TrackKind::Audio)
        .enumerate()
        .map(|(index, track)| TrackAudioPlan {
            track:    index,
            segments: track_segments(track, &bucket),
        })
        .collect()
}

fn track_segments(track: &Track, window: &TimeRange) -> Vec<AudioSegment> {
    let rate = track.rate();
    let window = TimeRange::new(
        window.start.rescaled_to(rate),
        window.duration.rescaled_to(rate),
    );
    let ranges = track.child_ranges();
    let mut segments = Vec::new();
    for (index, child) in track.children.iter().enumerate() {
        let overlap = match ranges[index].intersect(&window) {
            Some(overlap) => overlap,
            None => continue,
        };
        match child {
            Composable::Transition(_) => {}
            Composable::Gap(_) => segments.push(AudioSegment {
                read:     None,
                duration: overlap.duration,
            }),
            Composable::Clip(clip) => {
                let media_start = {
                    let offset = overlap.start - ranges[index].start;
                    let source_start = clip.source_range.start;
                    if source_start.is_invalid() {
                        offset
                    } else {
                        source_start + offset
                    }
                };
                let media_range = TimeRange::new(
                    media_start,
                    overlap.duration.rescaled_to(media_start.rate),
                );
                segments.push(AudioSegment {
                    read:     Some((clip.path.clone(), media_range)),
                    duration: overlap.duration,
                });
            }
            Composable::Stack(stack) => {
                // First audio track of the nested stack speaks for it.
                let local = TimeRange::new(
                    overlap.start - ranges[index].start,
                    overlap.duration,
                );
                match stack.tracks_of_kind(TrackKind::Audio).next() {
                    Some(sub) => segments.extend(track_segments(sub, &local)),
                    None => segments.push(AudioSegment {
                        read:     None,
                        duration: overlap.duration,
                    }),
                }
            }
        }
    }
    segments
}

// ── Active ranges ─────────────────────────────────────────────────────────────

/// Paths of every clip whose composition range intersects any of `ranges`.
/// Drives reader retention: everything else is an eviction candidate.
pub fn active_paths(timeline: &Timeline, ranges: &[TimeRange]) -> HashSet<String> {
    let mut out = HashSet::new();
    let offset = timeline.global_start_time;
    collect_paths(&timeline.stack.tracks, offset, ranges, &mut out);
    out
}

fn collect_paths(
    tracks: &[Track],
    offset: RationalTime,
    ranges: &[TimeRange],
    out: &mut HashSet<String>,
) {
    for track in tracks {
        let child_ranges = track.child_ranges();
        for (index, child) in track.children.iter().enumerate() {
            let global = child_ranges[index].translated(offset);
            match child {
                Composable::Clip(clip) => {
                    if ranges.iter().any(|r| r.intersects(&global)) {
                        out.insert(clip.path.full());
                    }
                }
                Composable::Stack(stack) => {
                    collect_paths(&stack.tracks, global.start, ranges, out);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelkit_core::edl::{Gap, Stack, TransitionItem};

    fn clip(name: &str, path: &str, count: f64) -> Composable {
        Composable::Clip(Clip {
            name:         name.to_string(),
            path:         SeqPath::parse(path),
            source_range: TimeRange::from_frames(0.0, count, 24.0),
        })
    }

    fn video_track(children: Vec<Composable>) -> Track {
        Track { kind: TrackKind::Video, name: String::new(), children }
    }

    fn timeline(tracks: Vec<Track>) -> Timeline {
        Timeline::new("test", Stack { tracks })
    }

    fn t(frame: f64) -> RationalTime {
        RationalTime::new(frame, 24.0)
    }

    #[test]
    fn single_clip_plan() {
        let tl = timeline(vec![video_track(vec![clip("a", "a.0.ppm", 24.0)])]);
        let plan = video_plan(&tl, t(10.0)).unwrap();
        assert_eq!(plan.len(), 1);
        let read = plan[0].read.as_ref().unwrap();
        assert_eq!(read.path.full(), "a.0.ppm");
        assert_eq!(read.time, t(10.0));
        assert!(plan[0].read_b.is_none());
        assert_eq!(plan[0].transition, Transition::None);
    }

    #[test]
    fn second_clip_maps_into_its_source_range() {
        let tl = timeline(vec![video_track(vec![
            clip("a", "a.0.ppm", 24.0),
            Composable::Clip(Clip {
                name:         "b".to_string(),
                path:         SeqPath::parse("b.0.ppm"),
                source_range: TimeRange::from_frames(100.0, 24.0, 24.0),
            }),
        ])]);
        let plan = video_plan(&tl, t(30.0)).unwrap();
        let read = plan[0].read.as_ref().unwrap();
        assert_eq!(read.path.full(), "b.0.ppm");
        assert_eq!(read.time, t(106.0));
    }

    #[test]
    fn gap_yields_no_read() {
        let tl = timeline(vec![video_track(vec![
            Composable::Gap(Gap { duration: t(24.0) }),
            clip("a", "a.0.ppm", 24.0),
        ])]);
        let plan = video_plan(&tl, t(10.0)).unwrap();
        assert!(plan[0].read.is_none());
        let plan = video_plan(&tl, t(24.0)).unwrap();
        assert!(plan[0].read.is_some());
    }

    #[test]
    fn out_of_range_fails() {
        let tl = timeline(vec![video_track(vec![clip("a", "a.0.ppm", 24.0)])]);
        assert!(video_plan(&tl, t(0.0)).is_ok());
        assert!(matches!(
            video_plan(&tl, t(24.0)),
            Err(IoError::OutOfRange { .. })
        ));
        assert!(matches!(
            video_plan(&tl, t(-1.0)),
            Err(IoError::OutOfRange { .. })
        ));
    }

    fn dissolve_timeline() -> Timeline {
        // Cut at frame 12, window [6, 18] with half-width 6.
        timeline(vec![video_track(vec![
            clip("a", "a.0.ppm", 12.0),
            Composable::Transition(TransitionItem {
                kind:       Transition::Dissolve,
                in_offset:  t(6.0),
                out_offset: t(6.0),
            }),
            clip("b", "b.0.ppm", 12.0),
        ])])
    }

    #[test]
    fn dissolve_window_endpoints() {
        let tl = dissolve_timeline();

        let start = video_plan(&tl, t(6.0)).unwrap();
        assert_eq!(start[0].transition, Transition::Dissolve);
        assert_eq!(start[0].transition_value, 0.0);
        assert!(start[0].read.is_some() && start[0].read_b.is_some());

        let end = video_plan(&tl, t(18.0)).unwrap();
        assert_eq!(end[0].transition, Transition::Dissolve);
        assert_eq!(end[0].transition_value, 1.0);
        assert!(end[0].read.is_some() && end[0].read_b.is_some());
    }

    #[test]
    fn dissolve_sides_and_midpoint() {
        let tl = dissolve_timeline();
        let mid = video_plan(&tl, t(12.0)).unwrap();
        assert_eq!(mid[0].transition_value, 0.5);
        // A side is always the outgoing clip, even past the cut.
        let a = mid[0].read.as_ref().unwrap();
        let b = mid[0].read_b.as_ref().unwrap();
        assert_eq!(a.path.full(), "a.0.ppm");
        assert_eq!(a.time, t(12.0)); // one past a's last frame; reader clamps
        assert_eq!(b.path.full(), "b.0.ppm");
        assert_eq!(b.time, t(0.0));

        // Outside the window there is no dissolve.
        let before = video_plan(&tl, t(5.0)).unwrap();
        assert_eq!(before[0].transition, Transition::None);
        assert!(before[0].read_b.is_none());
        let after = video_plan(&tl, t(19.0)).unwrap();
        assert_eq!(after[0].transition, Transition::None);
        assert_eq!(after[0].read.as_ref().unwrap().path.full(), "b.0.ppm");
    }

    #[test]
    fn layers_stack_by_track_index() {
        let tl = timeline(vec![
            video_track(vec![clip("bottom", "bottom.0.ppm", 24.0)]),
            video_track(vec![clip("top", "top.0.ppm", 24.0)]),
        ]);
        let plan = video_plan(&tl, t(0.0)).unwrap();
        assert_eq!(plan[0].track, 0);
        assert_eq!(plan[0].read.as_ref().unwrap().path.full(), "bottom.0.ppm");
        assert_eq!(plan[1].track, 1);
        assert_eq!(plan[1].read.as_ref().unwrap().path.full(), "top.0.ppm");
    }

    #[test]
    fn nested_stack_resolves_depth_first() {
        let inner = Stack {
            tracks: vec![
                video_track(vec![Composable::Gap(Gap { duration: t(24.0) })]),
                video_track(vec![clip("deep", "deep.0.ppm", 24.0)]),
            ],
        };
        let tl = timeline(vec![video_track(vec![Composable::Stack(inner)])]);
        let plan = video_plan(&tl, t(3.0)).unwrap();
        // First inner track is a gap; the second produces the read.
        assert_eq!(plan[0].read.as_ref().unwrap().path.full(), "deep.0.ppm");
    }

    #[test]
    fn unknown_media_rate_uses_timeline_rate() {
        let tl = timeline(vec![video_track(vec![Composable::Clip(Clip {
            name:         "raw".to_string(),
            path:         SeqPath::parse("raw.0.ppm"),
            source_range: TimeRange::new(RationalTime::INVALID, t(24.0)),
        })])]);
        let plan = video_plan(&tl, t(7.0)).unwrap();
        let read = plan[0].read.as_ref().unwrap();
        assert_eq!(read.time.rate, 24.0);
        assert_eq!(read.time.value, 7.0);
    }

    fn audio_track(children: Vec<Composable>) -> Track {
        Track { kind: TrackKind::Audio, name: String::new(), children }
    }

    #[test]
    fn audio_bucket_slices_clip_and_gap() {
        // 0.5 s clip, 0.25 s gap, 1 s clip at 24 fps sequencing.
        let tl = timeline(vec![audio_track(vec![
            clip("a", "a.wav", 12.0),
            Composable::Gap(Gap { duration: t(6.0) }),
            clip("b", "b.wav", 24.0),
        ])]);
        let plan = audio_plan(&tl, 0);
        assert_eq!(plan.len(), 1);
        let segments = &plan[0].segments;
        assert_eq!(segments.len(), 3);
        assert_eq!(
            segments[0].read.as_ref().unwrap().0.full(),
            "a.wav"
        );
        assert_eq!(segments[0].duration, t(12.0));
        assert!(segments[1].read.is_none());
        assert_eq!(segments[1].duration, t(6.0));
        let (path, media) = segments[2].read.as_ref().unwrap();
        assert_eq!(path.full(), "b.wav");
        assert_eq!(media.start, t(0.0));
        assert_eq!(media.duration, t(6.0));

        // Second bucket continues inside clip b.
        let plan = audio_plan(&tl, 1);
        let segments = &plan[0].segments;
        assert_eq!(segments.len(), 1);
        let (_, media) = segments[0].read.as_ref().unwrap();
        assert_eq!(media.start, t(6.0));
        assert_eq!(media.duration, t(18.0));
    }

    #[test]
    fn audio_bucket_outside_track_is_empty() {
        let tl = timeline(vec![audio_track(vec![clip("a", "a.wav", 24.0)])]);
        assert!(audio_plan(&tl, 5)[0].segments.is_empty());
    }

    #[test]
    fn active_paths_by_range() {
        let tl = timeline(vec![video_track(vec![
            clip("a", "a.0.ppm", 24.0),
            clip("b", "b.0.ppm", 24.0),
        ])]);
        let first = active_paths(&tl, &[TimeRange::from_frames(0.0, 24.0, 24.0)]);
        assert!(first.contains("a.0.ppm"));
        assert!(!first.contains("b.0.ppm"));
        let both = active_paths(&tl, &[TimeRange::from_frames(12.0, 24.0, 24.0)]);
        assert_eq!(both.len(), 2);
        assert!(active_paths(&tl, &[]).is_empty());
    }
}
