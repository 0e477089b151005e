// crates/reelkit-media/src/reader.rs
//
// The asset reader contract. A Reader owns one source (movie file or
// image sequence) and a worker that services requests asynchronously;
// every call returns immediately with a Pending future.
//
// Worker model: requests are enqueued on a channel; the worker wakes on a
// new request or its poll timeout. Decoder state never leaves the worker.

use std::collections::HashMap;
use std::time::Duration;

use reelkit_core::{RationalTime, TimeRange};

use crate::audio::{Audio, AudioInfo};
use crate::future::Pending;
use crate::image::{Image, ImageInfo};

/// Default worker poll timeout; FFmpeg readers override via
/// `FFmpeg/RequestTimeout`.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(1);

/// What a reader learned from the source header, resolved once after the
/// worker opens it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Info {
    /// One entry per image layer; empty for audio-only sources.
    pub video:      Vec<ImageInfo>,
    /// Media-time range of the video stream.
    pub video_time: Option<TimeRange>,
    pub audio:      Option<AudioInfo>,
    /// Media-time range of the audio stream.
    pub audio_time: Option<TimeRange>,
    /// Container/stream metadata, verbatim.
    pub tags:       HashMap<String, String>,
}

/// A decoded frame. `image` is `None` when the source had nothing to give
/// at this time but the failure is not worth surfacing as an error.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
    pub time:  RationalTime,
    pub layer: u16,
    pub image: Option<Image>,
}

/// Decoded PCM covering `range`, trimmed/padded to the exact sample count
/// implied by `range.duration` at the source rate.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBlock {
    pub range: TimeRange,
    pub audio: Option<Audio>,
}

pub trait Reader: Send + Sync {
    /// Resolves once the worker has opened the source.
    fn get_info(&self) -> Pending<Info>;

    /// Decode the single frame at or containing `media_time`. The returned
    /// frame's timestamp rounds to `media_time` at the source rate;
    /// otherwise the future fails with `DecodeFailed`.
    fn read_video(&self, media_time: RationalTime, layer: u16) -> Pending<VideoFrame>;

    /// Decode PCM covering `media_range`.
    fn read_audio(&self, media_range: TimeRange) -> Pending<AudioBlock>;

    /// Whether any request is queued or being serviced.
    fn has_requests(&self) -> bool;

    /// Resolve every pending request with `Cancelled`; the reader stays
    /// usable.
    fn cancel_requests(&self);

    /// Shut the worker down. Requests already queued and any arriving
    /// later resolve with `ReaderClosed`.
    fn stop(&self);

    fn has_stopped(&self) -> bool;
}

/// Frame-by-frame writer counterpart, used for sequence export and test
/// fixtures.
pub trait Writer: Send {
    fn write_video(&mut self, time: RationalTime, image: &Image) -> Result<(), reelkit_core::IoError>;
}
