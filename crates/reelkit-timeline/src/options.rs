// crates/reelkit-timeline/src/options.rs

use std::time::Duration;

use reelkit_media::IoOptions;

/// Engine tuning knobs, fixed at construction.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// In-flight cap for video reads across all readers.
    pub video_request_count: usize,
    /// In-flight cap for audio reads across all readers.
    pub audio_request_count: usize,
    /// Reader worker poll timeout; also the base unit of the admission
    /// deadline.
    pub request_timeout:     Duration,
    /// Idle time after which a reader outside every active range is
    /// stopped and dropped.
    pub reader_idle_timeout: Duration,
    /// String options forwarded to plugins (`FFmpeg/ThreadCount`,
    /// `SequenceIO/DefaultSpeed`, ...).
    pub io:                  IoOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            video_request_count: 16,
            audio_request_count: 16,
            request_timeout:     Duration::from_millis(1),
            reader_idle_timeout: Duration::from_secs(1),
            io:                  IoOptions::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = Options::default();
        assert_eq!(options.video_request_count, 16);
        assert_eq!(options.audio_request_count, 16);
        assert_eq!(options.request_timeout, Duration::from_millis(1));
        assert_eq!(options, Options::default());
    }
}
