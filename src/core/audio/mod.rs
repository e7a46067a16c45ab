//! PCM framing primitives shared by the input and output paths.
//!
//! All audio moving through the relay is 16-bit signed little-endian PCM,
//! interleaved when multi-channel, and cut into 20ms frames.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Duration of one frame.
pub const FRAME_DURATION_MS: u32 = 20;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Native voice-platform sample rate.
pub const PLATFORM_SAMPLE_RATE: u32 = 48000;

/// Byte size of one mono 20ms frame at `sample_rate`.
#[inline]
pub const fn mono_frame_bytes(sample_rate: u32) -> usize {
    (sample_rate as usize * FRAME_DURATION_MS as usize / 1000) * BYTES_PER_SAMPLE
}

/// Sample rate and channel layout of a PCM16 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub const fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    pub const fn stereo(sample_rate: u32) -> Self {
        Self::new(sample_rate, 2)
    }

    /// Samples per channel in one frame.
    #[inline]
    pub const fn samples_per_frame(&self) -> usize {
        self.sample_rate as usize * FRAME_DURATION_MS as usize / 1000
    }

    /// Byte size of one interleaved frame.
    #[inline]
    pub const fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Byte size of one interleaved sample slot (all channels).
    #[inline]
    pub const fn block_align(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }
}

impl std::fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}

/// Regroups arbitrarily sized byte chunks into fixed-size frames.
///
/// Partial input is held until enough bytes arrive; frame boundaries never
/// depend on how the caller split its writes.
#[derive(Debug)]
pub struct FrameChunker {
    frame_bytes: usize,
    pending: BytesMut,
}

impl FrameChunker {
    pub fn new(frame_bytes: usize) -> Self {
        debug_assert!(frame_bytes > 0);
        Self {
            frame_bytes,
            pending: BytesMut::with_capacity(frame_bytes * 2),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Bytes waiting for a complete frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Appends `data` and returns every frame completed by it, oldest first.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_bytes);
        while self.pending.len() >= self.frame_bytes {
            frames.push(self.pending.split_to(self.frame_bytes).freeze());
        }
        frames
    }

    /// Zero-pads any remainder up to the frame boundary and returns it.
    pub fn flush_padded(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending.resize(self.frame_bytes, 0);
        Some(self.pending.split().freeze())
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Normalizes one PCM16 sample to `[-1.0, 1.0)`.
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Converts a normalized sample back to PCM16, clamping out-of-range values.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes_for_all_rates() {
        for rate in [8000u32, 16000, 24000, 44100, 48000] {
            let expected = (rate as f64 * 0.02 * 2.0) as usize;
            assert_eq!(mono_frame_bytes(rate), expected, "rate {}", rate);
            assert_eq!(PcmFormat::mono(rate).frame_bytes(), expected);
            assert_eq!(PcmFormat::stereo(rate).frame_bytes(), expected * 2);
        }
        assert_eq!(mono_frame_bytes(24000), 960);
        assert_eq!(mono_frame_bytes(48000), 1920);
    }

    #[test]
    fn test_chunker_tolerates_partial_writes() {
        let mut chunker = FrameChunker::new(4);
        assert!(chunker.push(&[1, 2, 3]).is_empty());
        assert_eq!(chunker.pending_len(), 3);

        let frames = chunker.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &[1, 2, 3, 4]);
        assert_eq!(&frames[1][..], &[5, 6, 7, 8]);
        assert_eq!(chunker.pending_len(), 1);
    }

    #[test]
    fn test_chunker_flush_pads_with_silence() {
        let mut chunker = FrameChunker::new(4);
        chunker.push(&[9]);
        let tail = chunker.flush_padded().unwrap();
        assert_eq!(&tail[..], &[9, 0, 0, 0]);
        assert!(chunker.flush_padded().is_none());
    }

    #[test]
    fn test_sample_conversion_clamps() {
        let samples: Vec<i16> = [2.0, -2.0, 0.0].into_iter().map(f32_to_i16).collect();
        assert_eq!(samples, vec![32767, -32767, 0]);

        assert!((i16_to_f32(samples[0]) - 1.0).abs() < 1e-3);
        assert_eq!(i16_to_f32(i16::MIN), -1.0);
    }
}
