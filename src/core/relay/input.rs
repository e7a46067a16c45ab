//! Uplink path: per-speaker decode and transcode, arbitration, then send.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::arbiter::{FrameRoute, SpeakerArbiter, StartOutcome};
use crate::core::audio::PcmFormat;
use crate::core::realtime::RealtimeResult;
use crate::core::transcode::{BoxedDecoder, BoxedTranscoder, DecoderFactory, TranscoderFactory};
use crate::core::voice::SpeakerId;
use crate::errors::RelayResult;

/// Log one warning per this many frames dropped on a closed socket.
const DROPPED_FRAME_LOG_INTERVAL: u64 = 50;

/// Log one warning per this many frames evicted from the uplink backlog.
const BACKLOG_OVERFLOW_LOG_INTERVAL: u64 = 50;

/// Destination for arbitrated uplink frames.
#[async_trait]
pub trait UplinkSink: Send + Sync {
    fn is_open(&self) -> bool;

    /// True while the outbound queue is above its high watermark.
    fn is_paused(&self) -> bool {
        false
    }

    /// Queues one frame. Never waits.
    fn send_frame(&self, speaker: Option<String>, frame: Bytes) -> RealtimeResult<()>;

    /// Resolves once a paused uplink accepts frames again.
    async fn resumed(&self) {}
}

struct SpeakerPipeline {
    decoder: BoxedDecoder,
    transcoder: BoxedTranscoder,
    label: String,
}

/// Turns concurrent per-speaker voice packets into one uplink frame stream.
pub struct AudioInputRelay {
    arbiter: SpeakerArbiter,
    pipelines: HashMap<SpeakerId, SpeakerPipeline>,
    decoders: DecoderFactory,
    transcoders: TranscoderFactory,
    platform_format: PcmFormat,
    uplink_format: PcmFormat,
    uplink: Arc<dyn UplinkSink>,
    /// Arbitrated frames held while the uplink is paused, oldest first
    backlog: VecDeque<(String, Bytes)>,
    backlog_limit: usize,
    backlog_evicted: u64,
    dropped_while_closed: u64,
    last_active: Option<SpeakerId>,
}

impl AudioInputRelay {
    pub fn new(
        uplink: Arc<dyn UplinkSink>,
        decoders: DecoderFactory,
        transcoders: TranscoderFactory,
        platform_format: PcmFormat,
        uplink_format: PcmFormat,
        max_queued_frames: usize,
    ) -> Self {
        Self {
            arbiter: SpeakerArbiter::new(max_queued_frames),
            pipelines: HashMap::new(),
            decoders,
            transcoders,
            platform_format,
            uplink_format,
            uplink,
            backlog: VecDeque::new(),
            backlog_limit: max_queued_frames.max(1),
            backlog_evicted: 0,
            dropped_while_closed: 0,
            last_active: None,
        }
    }

    pub fn arbiter(&self) -> &SpeakerArbiter {
        &self.arbiter
    }

    /// The speaker who most recently owned the uplink. Used to attribute transcripts.
    pub fn last_active_speaker(&self) -> Option<&SpeakerId> {
        self.last_active.as_ref()
    }

    /// Frames dropped because the socket was not open.
    pub fn dropped_while_closed(&self) -> u64 {
        self.dropped_while_closed
    }

    /// Frames waiting for a paused uplink.
    pub fn uplink_backlog(&self) -> usize {
        self.backlog.len()
    }

    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    pub fn uplink(&self) -> Arc<dyn UplinkSink> {
        self.uplink.clone()
    }

    /// Sends held frames in order until the uplink pauses again. Frames
    /// held when the socket closed are dropped.
    pub fn drain_backlog(&mut self) {
        while !self.uplink.is_paused() {
            let Some((label, frame)) = self.backlog.pop_front() else {
                break;
            };
            if !self.uplink.is_open() {
                self.note_dropped();
                continue;
            }
            if let Err(e) = self.uplink.send_frame(Some(label.clone()), frame) {
                tracing::warn!("Failed to send frame for {}: {}", label, e);
            }
        }
    }

    fn ensure_pipeline(&mut self, speaker: &SpeakerId, label: Option<String>) -> RelayResult<()> {
        if let Some(pipeline) = self.pipelines.get_mut(speaker) {
            if let Some(label) = label {
                pipeline.label = label;
            }
            return Ok(());
        }

        let decoder = (self.decoders)(self.platform_format)?;
        let transcoder = (self.transcoders)(decoder.format(), self.uplink_format)?;
        tracing::debug!(
            "Created pipeline for speaker {}: {} -> {}",
            speaker,
            decoder.format(),
            self.uplink_format
        );
        self.pipelines.insert(
            speaker.clone(),
            SpeakerPipeline {
                decoder,
                transcoder,
                label: label.unwrap_or_else(|| speaker.to_string()),
            },
        );
        Ok(())
    }

    /// Allocates or reuses the speaker's pipeline and registers the start.
    pub fn on_speech_start(&mut self, speaker: &SpeakerId, label: Option<String>) -> RelayResult<()> {
        self.ensure_pipeline(speaker, label)?;
        if self.arbiter.on_speech_start(speaker) == StartOutcome::Activated {
            self.last_active = Some(speaker.clone());
        }
        Ok(())
    }

    /// Decodes and transcodes one packet, then routes the resulting frames.
    ///
    /// Decode and transcode failures drop the packet. A process-backed
    /// transcoder respawns on the next packet.
    pub async fn on_packet(&mut self, speaker: &SpeakerId, packet: &[u8]) -> RelayResult<()> {
        self.ensure_pipeline(speaker, None)?;
        let Some(pipeline) = self.pipelines.get_mut(speaker) else {
            return Ok(());
        };

        let pcm = match pipeline.decoder.decode(packet) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!("Dropping undecodable packet from {}: {}", speaker, e);
                return Ok(());
            }
        };
        let frames = match pipeline.transcoder.process(&pcm).await {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!("Transcoding failed for {}: {}", speaker, e);
                return Ok(());
            }
        };

        for frame in frames {
            self.route(speaker, frame);
        }
        Ok(())
    }

    /// Flushes the speaker's tail, releases the uplink if they held it, and
    /// sends whatever the next speakers had queued.
    pub async fn on_speech_end(&mut self, speaker: &SpeakerId) {
        let tail = match self.pipelines.get_mut(speaker) {
            Some(pipeline) => pipeline.transcoder.flush().await.unwrap_or_else(|e| {
                tracing::warn!("Failed to flush pipeline for {}: {}", speaker, e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        for frame in tail {
            self.route(speaker, frame);
        }

        for handoff in self.arbiter.on_speech_end(speaker) {
            self.last_active = Some(handoff.speaker.clone());
            for frame in handoff.frames {
                self.forward(&handoff.speaker, frame);
            }
        }
    }

    fn route(&mut self, speaker: &SpeakerId, frame: Bytes) {
        if !self.uplink.is_open() {
            self.arbiter.touch(speaker);
            self.note_dropped();
            return;
        }
        match self.arbiter.on_frame(speaker, frame) {
            FrameRoute::Forward(frame) => {
                self.last_active = Some(speaker.clone());
                self.forward(speaker, frame);
            }
            FrameRoute::Queued { .. } => {}
        }
    }

    /// Appends to the backlog and sends as much of it as the uplink takes.
    fn forward(&mut self, speaker: &SpeakerId, frame: Bytes) {
        if !self.uplink.is_open() {
            self.note_dropped();
            return;
        }
        let label = self
            .pipelines
            .get(speaker)
            .map(|p| p.label.clone())
            .unwrap_or_else(|| speaker.to_string());

        if self.backlog.len() >= self.backlog_limit {
            self.backlog.pop_front();
            self.backlog_evicted += 1;
            if self.backlog_evicted % BACKLOG_OVERFLOW_LOG_INTERVAL == 1 {
                tracing::warn!(
                    "Uplink paused, evicted oldest held frame ({} so far)",
                    self.backlog_evicted
                );
            }
        }
        self.backlog.push_back((label, frame));
        self.drain_backlog();
    }

    fn note_dropped(&mut self) {
        self.dropped_while_closed += 1;
        if self.dropped_while_closed % DROPPED_FRAME_LOG_INTERVAL == 1 {
            tracing::warn!(
                "Realtime socket not open, dropping audio ({} frame(s) so far)",
                self.dropped_while_closed
            );
        }
    }

    /// Stops every pipeline and forgets all speakers.
    pub async fn shutdown(&mut self) {
        for (speaker, mut pipeline) in self.pipelines.drain() {
            tracing::debug!("Stopping pipeline for speaker {}", speaker);
            pipeline.transcoder.shutdown().await;
        }
        self.arbiter.reset();
        self.backlog.clear();
        self.last_active = None;
    }
}
