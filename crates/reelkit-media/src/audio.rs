// crates/reelkit-media/src/audio.rs
//
// PCM blocks as immutable refcounted buffers, interleaved f32 samples.
// "Sample frames" counts one sample per channel; a one-second block at
// 48 kHz stereo holds 48000 frames / 96000 samples.

use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioInfo {
    pub channels:    u16,
    pub sample_rate: u32,
}

impl AudioInfo {
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self { channels, sample_rate }
    }
}

impl Default for AudioInfo {
    fn default() -> Self {
        Self { channels: 2, sample_rate: 48_000 }
    }
}

#[derive(Clone, Debug)]
pub struct Audio {
    info:    AudioInfo,
    samples: Arc<[f32]>,
}

impl Audio {
    /// Wrap interleaved samples; the length must be a whole number of
    /// sample frames.
    pub fn new(info: AudioInfo, samples: Vec<f32>) -> Result<Audio, String> {
        if info.channels == 0 {
            return Err("zero channels".to_string());
        }
        if samples.len() % info.channels as usize != 0 {
            return Err(format!(
                "{} samples is not a whole number of {}-channel frames",
                samples.len(),
                info.channels
            ));
        }
        Ok(Audio { info, samples: samples.into() })
    }

    pub fn silence(info: AudioInfo, frames: usize) -> Audio {
        Audio {
            info,
            samples: vec![0.0; frames * info.channels as usize].into(),
        }
    }

    pub fn info(&self) -> AudioInfo {
        self.info
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_frames(&self) -> usize {
        self.samples.len() / self.info.channels as usize
    }

    pub fn duration_seconds(&self) -> f64 {
        self.sample_frames() as f64 / self.info.sample_rate as f64
    }
}

impl PartialEq for Audio {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info
            && (Arc::ptr_eq(&self.samples, &other.samples)
                || self.samples == other.samples)
    }
}

/// Join blocks end to end, then trim or zero-pad to exactly `frames`
/// sample frames. Blocks are assumed to share `info`'s layout.
pub fn concat_trimmed(info: AudioInfo, blocks: &[Audio], frames: usize) -> Audio {
    let channels = info.channels as usize;
    let mut samples = Vec::with_capacity(frames * channels);
    for block in blocks {
        samples.extend_from_slice(block.samples());
    }
    samples.resize(frames * channels, 0.0);
    Audio { info, samples: samples.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_frame_count() {
        let a = Audio::silence(AudioInfo::new(2, 48_000), 48_000);
        assert_eq!(a.sample_frames(), 48_000);
        assert_eq!(a.samples().len(), 96_000);
        assert_eq!(a.duration_seconds(), 1.0);
    }

    #[test]
    fn new_rejects_ragged_frames() {
        let info = AudioInfo::new(2, 48_000);
        assert!(Audio::new(info, vec![0.0; 3]).is_err());
        assert!(Audio::new(info, vec![0.0; 4]).is_ok());
    }

    #[test]
    fn concat_trims_and_pads() {
        let info = AudioInfo::new(1, 10);
        let a = Audio::new(info, vec![1.0; 6]).unwrap();
        let b = Audio::new(info, vec![2.0; 6]).unwrap();
        // 12 frames joined, trimmed to 10.
        let joined = concat_trimmed(info, &[a.clone(), b.clone()], 10);
        assert_eq!(joined.sample_frames(), 10);
        assert_eq!(joined.samples()[5], 1.0);
        assert_eq!(joined.samples()[6], 2.0);
        // 6 frames joined, padded to 10 with silence.
        let padded = concat_trimmed(info, &[a], 10);
        assert_eq!(padded.sample_frames(), 10);
        assert_eq!(padded.samples()[9], 0.0);
    }
}
