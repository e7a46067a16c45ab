//! Collaborator interfaces consumed by the relay.
//!
//! The voice platform, the notification channel, and the transcript consumer
//! live outside this crate. The relay only sees the traits below.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::core::audio::PcmFormat;
use crate::errors::{RelayError, RelayResult};

/// Platform user id of a speaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeakerId(String);

impl SpeakerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpeakerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SpeakerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Voice activity reported by the platform.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    SpeechStart(SpeakerId),
    /// One encoded (or raw PCM) packet from a speaker
    Audio { speaker: SpeakerId, packet: Bytes },
    SpeechEnd(SpeakerId),
}

// =============================================================================
// Subscription Handle
// =============================================================================

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Handle returned by [`VoiceSink::subscribe_speaking_events`].
///
/// Events stop when the handle is dropped; the release hook runs exactly once.
pub struct SpeakingSubscription {
    rx: mpsc::UnboundedReceiver<VoiceEvent>,
    release: Option<ReleaseFn>,
}

impl SpeakingSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<VoiceEvent>) -> Self {
        Self { rx, release: None }
    }

    /// Registers a hook run when the subscription is dropped.
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// A subscription that never yields.
    pub fn closed() -> Self {
        let (_tx, rx) = mpsc::unbounded_channel();
        Self::new(rx)
    }

    /// Next event, or `None` once the platform side has gone away.
    pub async fn recv(&mut self) -> Option<VoiceEvent> {
        self.rx.recv().await
    }
}

impl Drop for SpeakingSubscription {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for SpeakingSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeakingSubscription")
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

// =============================================================================
// Playback Resource
// =============================================================================

/// Continuous PCM resource handed to the voice sink for one response.
///
/// Yields 20ms frames in `format` and ends when the response is complete.
pub struct PlaybackStream {
    format: PcmFormat,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl PlaybackStream {
    pub fn new(format: PcmFormat, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { format, rx }
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Returns a frame if one is ready without waiting.
    pub fn try_next_frame(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl Stream for PlaybackStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// =============================================================================
// Collaborator Traits
// =============================================================================

/// The voice platform connection.
#[async_trait]
pub trait VoiceSink: Send + Sync {
    /// Joins the target voice channel.
    async fn join(&self, channel_id: &str) -> RelayResult<()>;

    fn subscribe_speaking_events(&self) -> SpeakingSubscription;

    /// Starts playing `stream` into the channel.
    fn play_resource(&self, stream: PlaybackStream);

    /// Whether audio can currently be played.
    fn is_available(&self) -> bool;

    /// Display name for a speaker, if the platform knows one.
    fn speaker_label(&self, _speaker: &SpeakerId) -> Option<String> {
        None
    }

    /// Leaves the channel and releases platform resources.
    async fn destroy(&self);
}

/// Out-of-band operator notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str);
}

/// Consumer of completed user transcripts.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn on_transcript(&self, speaker: Option<&SpeakerId>, text: &str);
}

// =============================================================================
// Default Implementations
// =============================================================================

/// Notifier that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) {
        tracing::error!("Notification: {}", text);
    }
}

/// Transcript sink that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTranscriptSink;

#[async_trait]
impl TranscriptSink for LogTranscriptSink {
    async fn on_transcript(&self, speaker: Option<&SpeakerId>, text: &str) {
        match speaker {
            Some(id) => tracing::info!("[{}] {}", id, text),
            None => tracing::info!("[unknown] {}", text),
        }
    }
}

/// Sink for running without a voice platform (text-only sessions).
///
/// Never yields speaking events and reports itself unavailable, so response
/// audio is discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedVoiceSink;

#[async_trait]
impl VoiceSink for DetachedVoiceSink {
    async fn join(&self, channel_id: &str) -> RelayResult<()> {
        if channel_id.is_empty() {
            return Err(RelayError::VoiceSink("empty channel id".to_string()));
        }
        tracing::info!("Running detached from voice channel {}", channel_id);
        Ok(())
    }

    fn subscribe_speaking_events(&self) -> SpeakingSubscription {
        SpeakingSubscription::closed()
    }

    fn play_resource(&self, _stream: PlaybackStream) {}

    fn is_available(&self) -> bool {
        false
    }

    async fn destroy(&self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory voice sink for unit tests.

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct RecordingVoiceSink {
        pub available: AtomicBool,
        pub streams: Mutex<Vec<PlaybackStream>>,
        pub destroyed: AtomicBool,
    }

    impl RecordingVoiceSink {
        pub fn available() -> Self {
            let sink = Self::default();
            sink.available.store(true, Ordering::SeqCst);
            sink
        }

        pub fn stream_count(&self) -> usize {
            self.streams.lock().unwrap().len()
        }

        /// Every frame queued on stream `index` so far.
        pub fn drain_frames(&self, index: usize) -> Vec<Bytes> {
            let mut streams = self.streams.lock().unwrap();
            let stream = &mut streams[index];
            std::iter::from_fn(|| stream.try_next_frame()).collect()
        }
    }

    #[async_trait]
    impl VoiceSink for RecordingVoiceSink {
        async fn join(&self, _channel_id: &str) -> RelayResult<()> {
            Ok(())
        }

        fn subscribe_speaking_events(&self) -> SpeakingSubscription {
            SpeakingSubscription::closed()
        }

        fn play_resource(&self, stream: PlaybackStream) {
            self.streams.lock().unwrap().push(stream);
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn speaker_label(&self, speaker: &SpeakerId) -> Option<String> {
            Some(format!("user-{}", speaker))
        }

        async fn destroy(&self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_subscription_release_runs_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = released.clone();
        let mut sub = SpeakingSubscription::new(rx).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(VoiceEvent::SpeechStart("a".into())).unwrap();
        assert!(matches!(sub.recv().await, Some(VoiceEvent::SpeechStart(_))));

        drop(sub);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        // The producer observes the closed subscription
        assert!(tx.send(VoiceEvent::SpeechEnd("a".into())).is_err());
    }

    #[tokio::test]
    async fn test_playback_stream_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = PlaybackStream::new(PcmFormat::stereo(48000), rx);
        tx.send(Bytes::from_static(&[1, 2])).unwrap();
        drop(tx);

        assert_eq!(stream.next().await, Some(Bytes::from_static(&[1, 2])));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_detached_sink() {
        let sink = DetachedVoiceSink;
        assert!(!sink.is_available());
        assert!(sink.join("").await.is_err());
        assert!(sink.join("chan").await.is_ok());
        let mut sub = sink.subscribe_speaking_events();
        assert!(sub.recv().await.is_none());
    }
}
