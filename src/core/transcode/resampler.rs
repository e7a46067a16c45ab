//! In-process transcoder backed by rubato's FFT resampler.

use async_trait::async_trait;
use bytes::Bytes;
use rubato::{FftFixedIn, Resampler};

use super::{TranscodeError, TranscodeResult, TranscodeWorker};
use crate::core::audio::{FrameChunker, PcmFormat, f32_to_i16, i16_to_f32};

/// Converts PCM16 between rates and channel layouts without leaving the process.
///
/// Input is sliced into the resampler's fixed chunk size; output is re-framed
/// into 20ms frames of the output format. When formats match the bytes pass
/// through untouched.
pub struct InProcessTranscoder {
    input: PcmFormat,
    output: PcmFormat,
    resampler: Option<FftFixedIn<f32>>,
    input_chunker: FrameChunker,
    output_chunker: FrameChunker,
}

impl InProcessTranscoder {
    pub fn new(input: PcmFormat, output: PcmFormat) -> TranscodeResult<Self> {
        check_channels(input.channels, output.channels)?;

        let (resampler, chunk_frames) = if input.sample_rate == output.sample_rate {
            (None, input.samples_per_frame())
        } else {
            let resampler = FftFixedIn::<f32>::new(
                input.sample_rate as usize,
                output.sample_rate as usize,
                input.samples_per_frame(),
                1,
                output.channels as usize,
            )
            .map_err(|e| TranscodeError::Construction(e.to_string()))?;
            // rubato may round the chunk to its FFT granularity
            let next = resampler.input_frames_next();
            (Some(resampler), next)
        };

        Ok(Self {
            input,
            output,
            resampler,
            input_chunker: FrameChunker::new(chunk_frames * input.block_align()),
            output_chunker: FrameChunker::new(output.frame_bytes()),
        })
    }

    fn convert_chunk(&mut self, chunk: &[u8]) -> TranscodeResult<Vec<u8>> {
        if self.input == self.output {
            return Ok(chunk.to_vec());
        }

        let samples: Vec<i16> = chunk
            .chunks_exact(2)
            .map(|s| i16::from_le_bytes([s[0], s[1]]))
            .collect();
        let planes = remix(&samples, self.input.channels, self.output.channels);

        let planes = match self.resampler.as_mut() {
            None => planes,
            Some(resampler) => {
                let wave: Vec<Vec<f32>> = planes
                    .iter()
                    .map(|p| p.iter().copied().map(i16_to_f32).collect())
                    .collect();
                let resampled = resampler
                    .process(&wave, None)
                    .map_err(|e| TranscodeError::Resample(e.to_string()))?;
                resampled
                    .iter()
                    .map(|p| p.iter().copied().map(f32_to_i16).collect())
                    .collect()
            }
        };

        Ok(interleave(&planes))
    }

    fn emit(&mut self, chunks: Vec<Bytes>) -> TranscodeResult<Vec<Bytes>> {
        let mut frames = Vec::new();
        for chunk in chunks {
            let converted = self.convert_chunk(&chunk)?;
            frames.extend(self.output_chunker.push(&converted));
        }
        Ok(frames)
    }
}

#[async_trait]
impl TranscodeWorker for InProcessTranscoder {
    fn input_format(&self) -> PcmFormat {
        self.input
    }

    fn output_format(&self) -> PcmFormat {
        self.output
    }

    async fn process(&mut self, pcm: &[u8]) -> TranscodeResult<Vec<Bytes>> {
        let chunks = self.input_chunker.push(pcm);
        self.emit(chunks)
    }

    async fn flush(&mut self) -> TranscodeResult<Vec<Bytes>> {
        let tail: Vec<Bytes> = self.input_chunker.flush_padded().into_iter().collect();
        let mut frames = self.emit(tail)?;
        frames.extend(self.output_chunker.flush_padded());
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        Ok(frames)
    }

    async fn shutdown(&mut self) {
        self.input_chunker.clear();
        self.output_chunker.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

fn check_channels(from: u16, to: u16) -> TranscodeResult<()> {
    if from == 0 || to == 0 || (from != to && from != 1 && to != 1) {
        return Err(TranscodeError::UnsupportedChannels { from, to });
    }
    Ok(())
}

/// Splits interleaved samples into `to` planes, averaging on downmix and
/// duplicating on upmix from mono.
fn remix(samples: &[i16], from: u16, to: u16) -> Vec<Vec<i16>> {
    let from = from as usize;
    let to = to as usize;
    let frames = samples.len() / from;
    let mut planes = vec![Vec::with_capacity(frames); to];

    for slot in samples.chunks_exact(from) {
        if from == to {
            for (plane, &s) in planes.iter_mut().zip(slot) {
                plane.push(s);
            }
        } else if to == 1 {
            let sum: i32 = slot.iter().map(|&s| s as i32).sum();
            planes[0].push((sum / from as i32) as i16);
        } else {
            for plane in planes.iter_mut() {
                plane.push(slot[0]);
            }
        }
    }
    planes
}

fn interleave(planes: &[Vec<i16>]) -> Vec<u8> {
    let len = planes.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(len * planes.len() * 2);
    for i in 0..len {
        for plane in planes {
            out.extend_from_slice(&plane[i].to_le_bytes());
        }
    }
    out
}
