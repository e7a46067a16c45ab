//! PCM transcoding between the voice platform and the realtime endpoint.
//!
//! A [`TranscodeWorker`] converts sample rate and channel layout and re-frames
//! its output into 20ms frames. Two implementations are interchangeable:
//!
//! - [`InProcessTranscoder`]: FFT resampling with `rubato`, no process overhead
//! - [`ProcessTranscoder`]: pipes audio through an external `ffmpeg`
//!
//! Packet decoding (Opus or raw PCM) happens before transcoding, see [`decode`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::core::audio::PcmFormat;

pub mod decode;
mod process;
mod resampler;

pub use decode::{
    BoxedDecoder, DecoderFactory, FrameDecoder, PcmFrameDecoder, pcm_decoder_factory,
};
#[cfg(feature = "opus")]
pub use decode::{OpusFrameDecoder, opus_decoder_factory};
pub use process::{ProcessOptions, ProcessTranscoder};
pub use resampler::InProcessTranscoder;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by transcoding pipelines.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The resampler could not be built for the requested formats
    #[error("Failed to construct resampler: {0}")]
    Construction(String),

    /// Resampling a chunk failed
    #[error("Resampling failed: {0}")]
    Resample(String),

    /// Channel conversion not supported
    #[error("Unsupported channel conversion: {from} -> {to}")]
    UnsupportedChannels { from: u16, to: u16 },

    /// The conversion subprocess could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The conversion subprocess died or its pipes broke
    #[error("Transcoder process failed: {0}")]
    Process(String),

    /// Packet decoding failed
    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Result type for transcoding operations.
pub type TranscodeResult<T> = Result<T, TranscodeError>;

// =============================================================================
// Worker Trait
// =============================================================================

/// Streaming PCM converter.
///
/// Implementations accept partial buffers of any size, preserve sample order,
/// and only ever emit whole frames of `output_format().frame_bytes()` bytes.
#[async_trait]
pub trait TranscodeWorker: Send {
    fn input_format(&self) -> PcmFormat;

    fn output_format(&self) -> PcmFormat;

    /// Feeds PCM and returns every output frame completed so far.
    async fn process(&mut self, pcm: &[u8]) -> TranscodeResult<Vec<Bytes>>;

    /// Drains buffered audio, zero-padding the trailing frame.
    async fn flush(&mut self) -> TranscodeResult<Vec<Bytes>>;

    /// Releases any OS resources. The worker may be reused afterwards.
    async fn shutdown(&mut self);
}

/// Boxed trait object for transcoders.
pub type BoxedTranscoder = Box<dyn TranscodeWorker>;

/// Builds a transcoder for an `(input, output)` format pair.
pub type TranscoderFactory =
    Arc<dyn Fn(PcmFormat, PcmFormat) -> TranscodeResult<BoxedTranscoder> + Send + Sync>;

/// Which transcoder implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscoderKind {
    /// In-process FFT resampler (default)
    #[default]
    InProcess,
    /// External ffmpeg process over pipes
    Process,
}

impl TranscoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in_process",
            Self::Process => "process",
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "process" | "ffmpeg" | "subprocess" => Self::Process,
            _ => Self::InProcess,
        }
    }
}

/// Returns a factory producing transcoders of `kind`.
///
/// `filter` is an ffmpeg `-filter:a` chain; the in-process transcoder ignores it.
pub fn transcoder_factory(
    kind: TranscoderKind,
    ffmpeg_path: PathBuf,
    filter: Option<String>,
) -> TranscoderFactory {
    Arc::new(move |input, output| -> TranscodeResult<BoxedTranscoder> {
        match kind {
            TranscoderKind::InProcess => Ok(Box::new(InProcessTranscoder::new(input, output)?)),
            TranscoderKind::Process => Ok(Box::new(ProcessTranscoder::new(
                input,
                output,
                ProcessOptions {
                    program: ffmpeg_path.clone(),
                    filter: filter.clone(),
                },
            ))),
        }
    })
}
