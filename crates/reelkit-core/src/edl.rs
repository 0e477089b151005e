// crates/reelkit-core/src/edl.rs
//
// The in-memory edit decision list consumed read-only by the playback
// engine. Pure project data — no I/O, no runtime handles. Serializable via
// serde; `Timeline::from_json` stands in for an external loader.
//
// Shape:
//   Timeline → Stack → Tracks → Clips / Gaps / Transitions / nested Stacks
//
// Transitions are zero-duration children placed between two clips; they
// never advance the track cursor. A nested Stack behaves like a clip whose
// duration is the longest of its own tracks.

use serde::{Deserialize, Serialize};

use crate::error::IoError;
use crate::path::SeqPath;
use crate::range::TimeRange;
use crate::time::RationalTime;

/// Fallback rate for empty tracks and zero-length timelines.
pub const DEFAULT_RATE: f64 = 24.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
}

/// The kind of transition between two adjacent clips.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    #[default]
    None,
    Dissolve,
}

impl Transition {
    /// Map an OTIO transition type name. Only `"SMPTE_Dissolve"` is a
    /// recognized kind; every other name (including the empty string)
    /// behaves as a cut.
    pub fn parse(name: &str) -> Transition {
        match name {
            "SMPTE_Dissolve" => Transition::Dissolve,
            _ => Transition::None,
        }
    }
}

/// A source asset placed on a track. `source_range` is in media time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    #[serde(default)]
    pub name:         String,
    pub path:         SeqPath,
    pub source_range: TimeRange,
}

/// Empty track time. Yields a null image / silence.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub duration: RationalTime,
}

/// A transition centered on the cut between the previous and next clip,
/// influencing `[cut - in_offset, cut + out_offset]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionItem {
    pub kind:       Transition,
    pub in_offset:  RationalTime,
    pub out_offset: RationalTime,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Composable {
    Clip(Clip),
    Gap(Gap),
    Transition(TransitionItem),
    Stack(Stack),
}

impl Composable {
    /// Sequencing duration: how far this child advances the track cursor.
    /// Transitions overlap their neighbors and advance it by zero.
    pub fn duration(&self) -> RationalTime {
        match self {
            Composable::Clip(c) => c.source_range.duration,
            Composable::Gap(g) => g.duration,
            Composable::Transition(t) => RationalTime::new(0.0, t.in_offset.rate),
            Composable::Stack(s) => s.duration(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub kind:     TrackKind,
    #[serde(default)]
    pub name:     String,
    pub children: Vec<Composable>,
}

impl Track {
    /// Rate the track sequences at: the rate of the first child with a
    /// nonzero duration.
    pub fn rate(&self) -> f64 {
        self.children
            .iter()
            .map(|c| c.duration())
            .find(|d| d.value > 0.0)
            .map(|d| d.rate)
            .unwrap_or(DEFAULT_RATE)
    }

    /// The composition range of child `index`, relative to the track start.
    /// Transitions get a zero-duration range at the cursor.
    pub fn trimmed_range_of_child(&self, index: usize) -> TimeRange {
        let rate = self.rate();
        let mut cursor = RationalTime::new(0.0, rate);
        for (i, child) in self.children.iter().enumerate() {
            let duration = child.duration().rescaled_to(rate);
            if i == index {
                return TimeRange::new(cursor, duration);
            }
            cursor = cursor + duration;
        }
        TimeRange::new(cursor, RationalTime::new(0.0, rate))
    }

    /// Composition ranges for all children, in order.
    pub fn child_ranges(&self) -> Vec<TimeRange> {
        let rate = self.rate();
        let mut cursor = RationalTime::new(0.0, rate);
        self.children
            .iter()
            .map(|child| {
                let duration = child.duration().rescaled_to(rate);
                let range = TimeRange::new(cursor, duration);
                cursor = cursor + duration;
                range
            })
            .collect()
    }

    pub fn duration(&self) -> RationalTime {
        let rate = self.rate();
        self.children
            .iter()
            .fold(RationalTime::new(0.0, rate), |acc, child| {
                acc + child.duration()
            })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub tracks: Vec<Track>,
}

impl Stack {
    /// Longest track, expressed at the first video track's rate when one
    /// exists, otherwise the first track's rate.
    pub fn duration(&self) -> RationalTime {
        let rate = self
            .tracks
            .iter()
            .find(|t| t.kind == TrackKind::Video)
            .or_else(|| self.tracks.first())
            .map(|t| t.rate())
            .unwrap_or(DEFAULT_RATE);
        self.tracks
            .iter()
            .map(|t| t.duration().rescaled_to(rate))
            .fold(RationalTime::new(0.0, rate), |acc, d| {
                if d.value > acc.value {
                    d
                } else {
                    acc
                }
            })
    }

    pub fn tracks_of_kind(&self, kind: TrackKind) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub name:              String,
    pub global_start_time: RationalTime,
    pub stack:             Stack,
}

impl Timeline {
    pub fn new(name: &str, stack: Stack) -> Timeline {
        let rate = stack.duration().rate;
        Timeline {
            name: name.to_string(),
            global_start_time: RationalTime::new(0.0, rate),
            stack,
        }
    }

    pub fn duration(&self) -> RationalTime {
        self.stack.duration()
    }

    /// The composition range: `[global_start, global_start + duration)`.
    pub fn range(&self) -> TimeRange {
        let duration = self.duration();
        TimeRange::new(self.global_start_time.rescaled_to(duration.rate), duration)
    }

    /// First clip of the given kind, searching tracks in order. Used to
    /// publish A/V info eagerly at engine construction.
    pub fn first_clip(&self, kind: TrackKind) -> Option<&Clip> {
        fn find(tracks: &[Track], kind: TrackKind) -> Option<&Clip> {
            for track in tracks.iter().filter(|t| t.kind == kind) {
                for child in &track.children {
                    match child {
                        Composable::Clip(c) => return Some(c),
                        Composable::Stack(s) => {
                            if let Some(c) = find(&s.tracks, kind) {
                                return Some(c);
                            }
                        }
                        _ => {}
                    }
                }
            }
            None
        }
        find(&self.stack.tracks, kind)
    }

    pub fn from_json(json: &str) -> Result<Timeline, IoError> {
        let timeline: Timeline =
            serde_json::from_str(json).map_err(|e| IoError::OpenFailed {
                path:   String::new(),
                reason: e.to_string(),
            })?;
        timeline.validate()?;
        Ok(timeline)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Loader invariants: every clip resolves to a path, durations are
    /// non-negative, the global start is a valid time.
    pub fn validate(&self) -> Result<(), IoError> {
        fn check(stack: &Stack, name: &str) -> Result<(), IoError> {
            for track in &stack.tracks {
                for child in &track.children {
                    match child {
                        Composable::Clip(c) => {
                            if c.path.is_empty() {
                                return Err(IoError::OpenFailed {
                                    path:   name.to_string(),
                                    reason: format!(
                                        "clip \"{}\" has no media reference",
                                        c.name
                                    ),
                                });
                            }
                            if c.source_range.duration.value < 0.0 {
                                return Err(IoError::OpenFailed {
                                    path:   name.to_string(),
                                    reason: format!(
                                        "clip \"{}\" has a negative duration",
                                        c.name
                                    ),
                                });
                            }
                        }
                        Composable::Stack(s) => check(s, name)?,
                        _ => {}
                    }
                }
            }
            Ok(())
        }
        if self.global_start_time.is_invalid() {
            return Err(IoError::OpenFailed {
                path:   self.name.clone(),
                reason: "invalid global start time".to_string(),
            });
        }
        check(&self.stack, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(name: &str, path: &str, start: f64, count: f64) -> Composable {
        Composable::Clip(Clip {
            name:         name.to_string(),
            path:         SeqPath::parse(path),
            source_range: TimeRange::from_frames(start, count, 24.0),
        })
    }

    fn two_clip_track() -> Track {
        Track {
            kind:     TrackKind::Video,
            name:     "V1".to_string(),
            children: vec![
                clip("a", "a.0.ppm", 0.0, 24.0),
                clip("b", "b.0.ppm", 0.0, 24.0),
            ],
        }
    }

    #[test]
    fn trimmed_ranges_accumulate() {
        let track = two_clip_track();
        assert_eq!(
            track.trimmed_range_of_child(0),
            TimeRange::from_frames(0.0, 24.0, 24.0)
        );
        assert_eq!(
            track.trimmed_range_of_child(1),
            TimeRange::from_frames(24.0, 24.0, 24.0)
        );
        assert_eq!(track.duration(), RationalTime::new(48.0, 24.0));
    }

    #[test]
    fn transitions_occupy_no_track_time() {
        let mut track = two_clip_track();
        track.children.insert(
            1,
            Composable::Transition(TransitionItem {
                kind:       Transition::Dissolve,
                in_offset:  RationalTime::new(6.0, 24.0),
                out_offset: RationalTime::new(6.0, 24.0),
            }),
        );
        assert_eq!(track.duration(), RationalTime::new(48.0, 24.0));
        // The clip after the transition still starts at frame 24.
        assert_eq!(
            track.trimmed_range_of_child(2),
            TimeRange::from_frames(24.0, 24.0, 24.0)
        );
        // The transition itself sits at the cut with zero duration.
        assert_eq!(track.trimmed_range_of_child(1).duration.value, 0.0);
    }

    #[test]
    fn stack_duration_is_longest_track() {
        let stack = Stack {
            tracks: vec![
                two_clip_track(),
                Track {
                    kind:     TrackKind::Audio,
                    name:     "A1".to_string(),
                    children: vec![Composable::Gap(Gap {
                        duration: RationalTime::new(1.0, 1.0),
                    })],
                },
            ],
        };
        assert_eq!(stack.duration(), RationalTime::new(48.0, 24.0));
    }

    #[test]
    fn transition_names() {
        assert_eq!(Transition::parse("SMPTE_Dissolve"), Transition::Dissolve);
        assert_eq!(Transition::parse(""), Transition::None);
        assert_eq!(Transition::parse("SMPTE_Wipe"), Transition::None);
    }

    #[test]
    fn json_round_trip() {
        let timeline = Timeline::new(
            "test",
            Stack { tracks: vec![two_clip_track()] },
        );
        let json = timeline.to_json();
        let back = Timeline::from_json(&json).unwrap();
        assert_eq!(timeline, back);
        assert_eq!(back.duration(), RationalTime::new(48.0, 24.0));
    }

    #[test]
    fn validate_rejects_missing_media() {
        let timeline = Timeline::new(
            "bad",
            Stack {
                tracks: vec![Track {
                    kind:     TrackKind::Video,
                    name:     String::new(),
                    children: vec![clip("empty", "", 0.0, 24.0)],
                }],
            },
        );
        assert!(timeline.validate().is_err());
    }

    #[test]
    fn first_clip_searches_nested_stacks() {
        let inner = Stack {
            tracks: vec![two_clip_track()],
        };
        let timeline = Timeline::new(
            "nested",
            Stack {
                tracks: vec![Track {
                    kind:     TrackKind::Video,
                    name:     String::new(),
                    children: vec![Composable::Stack(inner)],
                }],
            },
        );
        assert_eq!(timeline.first_clip(TrackKind::Video).unwrap().name, "a");
        assert!(timeline.first_clip(TrackKind::Audio).is_none());
    }
}
