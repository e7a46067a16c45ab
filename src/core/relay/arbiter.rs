//! Single-speaker uplink arbitration.
//!
//! Exactly one speaker owns the uplink at a time. Everyone else who speaks
//! meanwhile waits in a FIFO, with their frames held in a bounded per-speaker
//! queue that drops its oldest frame on overflow. When the active speaker
//! stops, the next waiting speaker takes over and its held frames are handed
//! off in their original order before any live frame of theirs is forwarded.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

use crate::core::voice::SpeakerId;
use crate::errors::RelayError;

/// Held frames per waiting speaker: 2s of 20ms frames.
pub const DEFAULT_MAX_QUEUED_FRAMES: usize = 100;

#[derive(Debug, Default)]
struct SpeakerSlot {
    queue: VecDeque<Bytes>,
    speaking: bool,
    dropped: usize,
}

/// Result of a speech-start event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The speaker now owns the uplink
    Activated,
    /// Another speaker is active; this one waits its turn
    Queued,
    AlreadyActive,
    AlreadyQueued,
}

/// Where a frame should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRoute {
    /// Send now
    Forward(Bytes),
    /// Held until the speaker's turn
    Queued { overflowed: bool },
}

/// Frames released to the uplink when a waiting speaker takes its turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub speaker: SpeakerId,
    pub frames: Vec<Bytes>,
}

/// Decides which speaker's audio reaches the uplink.
#[derive(Debug)]
pub struct SpeakerArbiter {
    slots: HashMap<SpeakerId, SpeakerSlot>,
    active: Option<SpeakerId>,
    waiting: VecDeque<SpeakerId>,
    max_queued_frames: usize,
}

impl Default for SpeakerArbiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUED_FRAMES)
    }
}

impl SpeakerArbiter {
    pub fn new(max_queued_frames: usize) -> Self {
        Self {
            slots: HashMap::new(),
            active: None,
            waiting: VecDeque::new(),
            max_queued_frames: max_queued_frames.max(1),
        }
    }

    pub fn active_speaker(&self) -> Option<&SpeakerId> {
        self.active.as_ref()
    }

    pub fn is_active(&self, speaker: &SpeakerId) -> bool {
        self.active.as_ref() == Some(speaker)
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Frames currently held for `speaker`.
    pub fn queued_frames(&self, speaker: &SpeakerId) -> usize {
        self.slots.get(speaker).map_or(0, |slot| slot.queue.len())
    }

    /// Total frames dropped to overflow across all speakers.
    pub fn dropped_frames(&self) -> usize {
        self.slots.values().map(|slot| slot.dropped).sum()
    }

    fn enqueue(&mut self, speaker: &SpeakerId) {
        if !self.waiting.contains(speaker) {
            self.waiting.push_back(speaker.clone());
        }
    }

    pub fn on_speech_start(&mut self, speaker: &SpeakerId) -> StartOutcome {
        self.slots.entry(speaker.clone()).or_default().speaking = true;

        if self.is_active(speaker) {
            return StartOutcome::AlreadyActive;
        }
        if self.active.is_none() {
            tracing::debug!("Speaker {} takes the uplink", speaker);
            self.active = Some(speaker.clone());
            return StartOutcome::Activated;
        }
        if self.waiting.contains(speaker) {
            return StartOutcome::AlreadyQueued;
        }
        tracing::debug!(
            "Speaker {} queued behind {:?} ({} waiting)",
            speaker,
            self.active,
            self.waiting.len()
        );
        self.waiting.push_back(speaker.clone());
        StartOutcome::Queued
    }

    /// Records activity from `speaker` without holding a frame, so turn order
    /// stays the same whether or not audio can be sent.
    pub fn touch(&mut self, speaker: &SpeakerId) {
        if self.active.is_none() {
            self.on_speech_start(speaker);
        } else if !self.is_active(speaker) {
            self.enqueue(speaker);
        }
    }

    /// Routes one transcoded frame. A frame from a speaker with no start event
    /// is treated as an implicit start.
    pub fn on_frame(&mut self, speaker: &SpeakerId, frame: Bytes) -> FrameRoute {
        if self.active.is_none() {
            self.on_speech_start(speaker);
        }
        if self.is_active(speaker) {
            return FrameRoute::Forward(frame);
        }

        self.enqueue(speaker);
        let max = self.max_queued_frames;
        let slot = self.slots.entry(speaker.clone()).or_default();
        slot.queue.push_back(frame);
        if slot.queue.len() <= max {
            return FrameRoute::Queued { overflowed: false };
        }

        slot.queue.pop_front();
        slot.dropped += 1;
        tracing::warn!(
            "{}",
            RelayError::ArbitrationOverflow {
                speaker: speaker.to_string(),
                dropped: slot.dropped,
            }
        );
        FrameRoute::Queued { overflowed: true }
    }

    /// Handles a speech-end event and returns the frames to flush, in order.
    ///
    /// When the active speaker ends, waiting speakers are promoted in FIFO
    /// order. A promoted speaker that has itself already stopped only hands
    /// off its held frames, and promotion moves on to the next one.
    pub fn on_speech_end(&mut self, speaker: &SpeakerId) -> Vec<Handoff> {
        if let Some(slot) = self.slots.get_mut(speaker) {
            slot.speaking = false;
        }

        if !self.is_active(speaker) {
            // A waiting speaker with nothing held gives up its place
            if self.queued_frames(speaker) == 0 {
                self.waiting.retain(|s| s != speaker);
            }
            return Vec::new();
        }

        self.active = None;
        let mut handoffs = Vec::new();
        while let Some(next) = self.waiting.pop_front() {
            let slot = self.slots.entry(next.clone()).or_default();
            let frames: Vec<Bytes> = slot.queue.drain(..).collect();
            let still_speaking = slot.speaking;

            if still_speaking {
                tracing::debug!(
                    "Speaker {} takes the uplink with {} held frame(s)",
                    next,
                    frames.len()
                );
                self.active = Some(next.clone());
                handoffs.push(Handoff {
                    speaker: next,
                    frames,
                });
                break;
            }
            if !frames.is_empty() {
                handoffs.push(Handoff {
                    speaker: next,
                    frames,
                });
            }
        }
        handoffs
    }

    /// Forgets every speaker.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.waiting.clear();
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SpeakerId {
        SpeakerId::from(s)
    }

    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 4])
    }

    #[test]
    fn test_first_speaker_activates_on_first_frame() {
        let mut arbiter = SpeakerArbiter::default();
        let x = id("x");
        assert_eq!(arbiter.on_frame(&x, frame(1)), FrameRoute::Forward(frame(1)));
        assert!(arbiter.is_active(&x));
    }

    #[test]
    fn test_second_speaker_waits_until_first_ends() {
        let mut arbiter = SpeakerArbiter::default();
        let (x, y) = (id("x"), id("y"));

        assert_eq!(arbiter.on_speech_start(&x), StartOutcome::Activated);
        assert_eq!(arbiter.on_speech_start(&y), StartOutcome::Queued);
        assert_eq!(arbiter.on_speech_start(&y), StartOutcome::AlreadyQueued);

        assert_eq!(
            arbiter.on_frame(&y, frame(1)),
            FrameRoute::Queued { overflowed: false }
        );
        assert_eq!(arbiter.on_frame(&x, frame(9)), FrameRoute::Forward(frame(9)));
        arbiter.on_frame(&y, frame(2));
        assert!(arbiter.is_active(&x));

        let handoffs = arbiter.on_speech_end(&x);
        assert_eq!(
            handoffs,
            vec![Handoff {
                speaker: y.clone(),
                frames: vec![frame(1), frame(2)],
            }]
        );
        assert!(arbiter.is_active(&y));
        assert_eq!(arbiter.on_frame(&y, frame(3)), FrameRoute::Forward(frame(3)));
    }

    #[test]
    fn test_waiting_speakers_promoted_in_fifo_order() {
        let mut arbiter = SpeakerArbiter::default();
        let (a, b, c) = (id("a"), id("b"), id("c"));

        arbiter.on_speech_start(&c);
        arbiter.on_speech_start(&a);
        arbiter.on_speech_start(&b);
        assert_eq!(arbiter.waiting_len(), 2);

        arbiter.on_speech_end(&c);
        assert!(arbiter.is_active(&a));
        arbiter.on_speech_end(&a);
        assert!(arbiter.is_active(&b));
        arbiter.on_speech_end(&b);
        assert!(arbiter.active_speaker().is_none());
    }

    #[test]
    fn test_finished_waiter_hands_off_then_next_promoted() {
        let mut arbiter = SpeakerArbiter::default();
        let (x, y, z) = (id("x"), id("y"), id("z"));

        arbiter.on_speech_start(&x);
        arbiter.on_speech_start(&y);
        arbiter.on_frame(&y, frame(1));
        arbiter.on_speech_end(&y);
        arbiter.on_speech_start(&z);
        arbiter.on_frame(&z, frame(2));

        let handoffs = arbiter.on_speech_end(&x);
        assert_eq!(handoffs.len(), 2);
        assert_eq!(handoffs[0].speaker, y);
        assert_eq!(handoffs[0].frames, vec![frame(1)]);
        assert_eq!(handoffs[1].speaker, z);
        assert!(arbiter.is_active(&z));
    }

    #[test]
    fn test_silent_waiter_leaves_queue_on_end() {
        let mut arbiter = SpeakerArbiter::default();
        let (x, y) = (id("x"), id("y"));
        arbiter.on_speech_start(&x);
        arbiter.on_speech_start(&y);
        assert!(arbiter.on_speech_end(&y).is_empty());
        assert_eq!(arbiter.waiting_len(), 0);
        assert!(arbiter.on_speech_end(&x).is_empty());
        assert!(arbiter.active_speaker().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut arbiter = SpeakerArbiter::new(3);
        let (x, y) = (id("x"), id("y"));
        arbiter.on_speech_start(&x);
        arbiter.on_speech_start(&y);

        for tag in 1..=3 {
            arbiter.on_frame(&y, frame(tag));
        }
        assert_eq!(
            arbiter.on_frame(&y, frame(4)),
            FrameRoute::Queued { overflowed: true }
        );
        assert_eq!(arbiter.queued_frames(&y), 3);
        assert_eq!(arbiter.dropped_frames(), 1);

        let handoffs = arbiter.on_speech_end(&x);
        assert_eq!(handoffs[0].frames, vec![frame(2), frame(3), frame(4)]);
    }

    /// Deterministic pseudo-random event stream; the active speaker is never
    /// shared and forwarded frames of each speaker stay in order.
    #[test]
    fn test_single_active_under_random_events() {
        let speakers: Vec<SpeakerId> = ["a", "b", "c", "d"].iter().map(|s| id(s)).collect();
        let mut arbiter = SpeakerArbiter::new(8);
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next_seq = [0u16; 4];
        let mut last_forwarded: HashMap<SpeakerId, u16> = HashMap::new();

        let mut check = |speaker: &SpeakerId, f: &Bytes| {
            let seq = u16::from_le_bytes([f[0], f[1]]);
            if let Some(prev) = last_forwarded.insert(speaker.clone(), seq) {
                assert!(seq > prev, "frame order broken for {}", speaker);
            }
        };

        for _ in 0..2000 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let who = ((state >> 33) % 4) as usize;
            let speaker = &speakers[who];
            match (state >> 40) % 3 {
                0 => {
                    arbiter.on_speech_start(speaker);
                }
                1 => {
                    next_seq[who] += 1;
                    let payload = Bytes::copy_from_slice(&next_seq[who].to_le_bytes());
                    if let FrameRoute::Forward(f) = arbiter.on_frame(speaker, payload)
                    {
                        check(speaker, &f);
                    }
                }
                _ => {
                    for handoff in arbiter.on_speech_end(speaker) {
                        for f in &handoff.frames {
                            check(&handoff.speaker, f);
                        }
                    }
                }
            }
            let active = speakers.iter().filter(|s| arbiter.is_active(s)).count();
            assert!(active <= 1);
            if arbiter.active_speaker().is_none() {
                assert_eq!(arbiter.waiting_len(), 0);
            }
        }
    }
}
