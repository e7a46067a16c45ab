//! Packet decoders that turn platform voice packets into PCM16.

use bytes::Bytes;
use std::sync::Arc;

use super::TranscodeResult;
#[cfg(feature = "opus")]
use super::TranscodeError;
use crate::core::audio::PcmFormat;

/// Decodes one voice packet into interleaved PCM16 LE.
pub trait FrameDecoder: Send {
    /// Format of the PCM this decoder produces.
    fn format(&self) -> PcmFormat;

    fn decode(&mut self, packet: &[u8]) -> TranscodeResult<Bytes>;
}

/// Boxed trait object for decoders.
pub type BoxedDecoder = Box<dyn FrameDecoder>;

/// Builds one decoder per speaker for the platform's packet format.
pub type DecoderFactory = Arc<dyn Fn(PcmFormat) -> TranscodeResult<BoxedDecoder> + Send + Sync>;

/// Factory for platforms delivering raw PCM.
pub fn pcm_decoder_factory() -> DecoderFactory {
    Arc::new(|format| Ok(Box::new(PcmFrameDecoder::new(format)) as BoxedDecoder))
}

/// Factory for platforms delivering Opus packets.
#[cfg(feature = "opus")]
pub fn opus_decoder_factory() -> DecoderFactory {
    Arc::new(|format| Ok(Box::new(OpusFrameDecoder::new(format)?) as BoxedDecoder))
}

/// For platforms that already deliver raw PCM.
#[derive(Debug, Clone, Copy)]
pub struct PcmFrameDecoder {
    format: PcmFormat,
}

impl PcmFrameDecoder {
    pub fn new(format: PcmFormat) -> Self {
        Self { format }
    }
}

impl FrameDecoder for PcmFrameDecoder {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn decode(&mut self, packet: &[u8]) -> TranscodeResult<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }
}

/// Largest Opus frame: 120ms at 48kHz per channel.
#[cfg(feature = "opus")]
const MAX_OPUS_FRAME_SAMPLES: usize = 5760;

/// Opus decoder producing PCM16 at the packet's native format.
#[cfg(feature = "opus")]
pub struct OpusFrameDecoder {
    decoder: opus::Decoder,
    format: PcmFormat,
    pcm: Vec<i16>,
}

#[cfg(feature = "opus")]
impl OpusFrameDecoder {
    pub fn new(format: PcmFormat) -> TranscodeResult<Self> {
        let channels = match format.channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            n => {
                return Err(TranscodeError::Decode(format!(
                    "Opus supports 1 or 2 channels, got {}",
                    n
                )));
            }
        };
        let decoder = opus::Decoder::new(format.sample_rate, channels)
            .map_err(|e| TranscodeError::Decode(e.to_string()))?;
        Ok(Self {
            decoder,
            format,
            pcm: vec![0i16; MAX_OPUS_FRAME_SAMPLES * format.channels as usize],
        })
    }
}

#[cfg(feature = "opus")]
impl FrameDecoder for OpusFrameDecoder {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn decode(&mut self, packet: &[u8]) -> TranscodeResult<Bytes> {
        let per_channel = self
            .decoder
            .decode(packet, &mut self.pcm, false)
            .map_err(|e| TranscodeError::Decode(e.to_string()))?;
        let total = per_channel * self.format.channels as usize;
        let mut out = Vec::with_capacity(total * 2);
        for s in &self.pcm[..total] {
            out.extend_from_slice(&s.to_le_bytes());
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_decoder_passthrough() {
        let mut decoder = PcmFrameDecoder::new(PcmFormat::stereo(48000));
        let out = decoder.decode(&[1, 2, 3, 4]).unwrap();
        assert_eq!(&out[..], &[1, 2, 3, 4]);
        assert_eq!(decoder.format(), PcmFormat::stereo(48000));
    }

    #[test]
    fn test_pcm_factory() {
        let factory = pcm_decoder_factory();
        let decoder = factory(PcmFormat::mono(16000)).unwrap();
        assert_eq!(decoder.format(), PcmFormat::mono(16000));
    }

    #[cfg(feature = "opus")]
    #[test]
    fn test_opus_rejects_surround() {
        assert!(OpusFrameDecoder::new(PcmFormat::new(48000, 6)).is_err());
    }
}
