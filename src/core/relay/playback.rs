//! Downlink path: jitter buffering and playback of response audio.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::audio::{FrameChunker, PcmFormat};
use crate::core::transcode::{BoxedTranscoder, TranscoderFactory};
use crate::core::voice::{PlaybackStream, VoiceSink};

/// Frames held before playback starts (100ms).
pub const DEFAULT_JITTER_FRAMES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    /// Collecting the jitter buffer
    Buffering,
    /// Audio is flowing to the sink
    Streaming,
}

struct ActivePlayback {
    transcoder: BoxedTranscoder,
    frames: mpsc::UnboundedSender<Bytes>,
}

/// Plays endpoint audio deltas into the voice sink.
///
/// Each response gets its own transcoder and [`PlaybackStream`]; both are
/// torn down by [`AudioOutputRelay::reset`].
pub struct AudioOutputRelay {
    sink: Arc<dyn VoiceSink>,
    transcoders: TranscoderFactory,
    input_format: PcmFormat,
    output_format: PcmFormat,
    jitter_frames: usize,
    state: PlaybackState,
    chunker: FrameChunker,
    pending: VecDeque<Bytes>,
    active: Option<ActivePlayback>,
    /// Set when the pipeline could not be built; cleared by `reset`
    pipeline_failed: bool,
}

impl AudioOutputRelay {
    pub fn new(
        sink: Arc<dyn VoiceSink>,
        transcoders: TranscoderFactory,
        input_format: PcmFormat,
        output_format: PcmFormat,
        jitter_frames: usize,
    ) -> Self {
        Self {
            sink,
            transcoders,
            input_format,
            output_format,
            jitter_frames: jitter_frames.max(1),
            state: PlaybackState::Idle,
            chunker: FrameChunker::new(input_format.frame_bytes()),
            pending: VecDeque::new(),
            active: None,
            pipeline_failed: false,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Accepts one decoded audio delta.
    pub async fn handle(&mut self, delta: &[u8]) {
        if !self.sink.is_available() || self.pipeline_failed {
            return;
        }
        if self.state == PlaybackState::Idle {
            tracing::debug!("Response audio started, buffering");
            self.state = PlaybackState::Buffering;
        }

        let frames = self.chunker.push(delta);
        match self.state {
            PlaybackState::Buffering => {
                self.pending.extend(frames);
                if self.pending.len() >= self.jitter_frames {
                    self.start().await;
                }
            }
            PlaybackState::Streaming => self.feed(frames).await,
            PlaybackState::Idle => {}
        }
    }

    /// Ends the current response: pads and flushes the tail, then releases the
    /// pipeline. Does nothing when idle.
    pub async fn reset(&mut self) {
        if self.state == PlaybackState::Idle {
            return;
        }

        let tail = self.chunker.flush_padded();
        if self.state == PlaybackState::Buffering
            && !self.pipeline_failed
            && (!self.pending.is_empty() || tail.is_some())
        {
            // Shorter than the jitter buffer; play it anyway
            self.start().await;
        }
        self.feed(tail.into_iter().collect()).await;

        if let Some(mut active) = self.active.take() {
            match active.transcoder.flush().await {
                Ok(frames) => {
                    for frame in frames {
                        let _ = active.frames.send(frame);
                    }
                }
                Err(e) => tracing::warn!("Failed to flush playback pipeline: {}", e),
            }
            active.transcoder.shutdown().await;
        }

        self.pending.clear();
        self.chunker.clear();
        self.pipeline_failed = false;
        self.state = PlaybackState::Idle;
        tracing::debug!("Playback pipeline released");
    }

    async fn start(&mut self) {
        if !self.sink.is_available() {
            self.pending.clear();
            return;
        }
        let transcoder = match (self.transcoders)(self.input_format, self.output_format) {
            Ok(transcoder) => transcoder,
            Err(e) => {
                tracing::error!("Failed to create playback pipeline, dropping this response: {}", e);
                self.pending.clear();
                self.chunker.clear();
                self.pipeline_failed = true;
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.sink.play_resource(PlaybackStream::new(self.output_format, rx));
        self.active = Some(ActivePlayback {
            transcoder,
            frames: tx,
        });
        self.state = PlaybackState::Streaming;
        tracing::debug!("Playback started after {} buffered frame(s)", self.pending.len());

        let buffered: Vec<Bytes> = self.pending.drain(..).collect();
        self.feed(buffered).await;
    }

    async fn feed(&mut self, frames: Vec<Bytes>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        for frame in frames {
            match active.transcoder.process(&frame).await {
                Ok(out) => {
                    for frame in out {
                        if active.frames.send(frame).is_err() {
                            tracing::debug!("Playback stream dropped by sink");
                        }
                    }
                }
                Err(e) => tracing::warn!("Playback transcode failed: {}", e),
            }
        }
    }
}
