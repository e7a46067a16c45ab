//! The relay control loop.
//!
//! A [`VoiceRelay`] joins a voice channel, opens a realtime session, and then
//! runs one event loop that owns arbitration and playback state:
//!
//! ```text
//! voice events -> AudioInputRelay -> SessionHandle -> realtime endpoint
//! realtime endpoint -> SessionEvent -> { AudioOutputRelay | ToolDispatcher | TranscriptSink }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

pub mod arbiter;
mod input;
mod playback;

pub use arbiter::{DEFAULT_MAX_QUEUED_FRAMES, FrameRoute, Handoff, SpeakerArbiter, StartOutcome};
pub use input::{AudioInputRelay, UplinkSink};
pub use playback::{AudioOutputRelay, DEFAULT_JITTER_FRAMES, PlaybackState};

use crate::config::RelayConfig;
use crate::core::realtime::{
    RealtimeError, RealtimeResult, SessionEvent, SessionHandle, SessionManager, SessionState,
};
use crate::core::tools::{
    DispatchOutcome, HttpToolClient, RemoteToolClient, ToolDispatcher, ToolRegistry,
};
use crate::core::transcode::{
    DecoderFactory, TranscoderFactory, pcm_decoder_factory, transcoder_factory,
};
use crate::core::voice::{
    DetachedVoiceSink, LogNotifier, LogTranscriptSink, Notifier, SpeakingSubscription,
    TranscriptSink, VoiceEvent, VoiceSink,
};
use crate::errors::{RelayError, RelayResult};

/// How long shutdown waits for the session task to close the socket.
const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`VoiceRelay`] from configuration and collaborators.
pub struct VoiceRelayBuilder {
    config: RelayConfig,
    sink: Arc<dyn VoiceSink>,
    notifier: Arc<dyn Notifier>,
    transcripts: Arc<dyn TranscriptSink>,
    registry: ToolRegistry,
    remote: Option<Arc<dyn RemoteToolClient>>,
    decoders: Option<DecoderFactory>,
    transcoders: Option<TranscoderFactory>,
}

impl VoiceRelayBuilder {
    pub fn voice_sink(mut self, sink: Arc<dyn VoiceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn transcript_sink(mut self, transcripts: Arc<dyn TranscriptSink>) -> Self {
        self.transcripts = transcripts;
        self
    }

    /// Local tools. Defaults to the built-in set.
    pub fn tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Remote tool client. Overrides `remote_tools_url`.
    pub fn remote_tools(mut self, client: Arc<dyn RemoteToolClient>) -> Self {
        self.remote = Some(client);
        self
    }

    pub fn decoder_factory(mut self, decoders: DecoderFactory) -> Self {
        self.decoders = Some(decoders);
        self
    }

    /// Transcoder factory for both directions. Overrides the configured kind.
    pub fn transcoder_factory(mut self, transcoders: TranscoderFactory) -> Self {
        self.transcoders = Some(transcoders);
        self
    }

    /// Loads instructions and remote tools, then wires the relay together.
    ///
    /// Nothing is connected yet; call [`VoiceRelay::start`].
    pub async fn build(self) -> RelayResult<VoiceRelay> {
        let config = self.config;

        let remote = match (self.remote, &config.remote_tools_url) {
            (Some(client), _) => Some(client),
            (None, Some(url)) => Some(
                Arc::new(HttpToolClient::new(url, config.tool_timeout())?) as Arc<dyn RemoteToolClient>
            ),
            (None, None) => None,
        };

        let mut dispatcher = ToolDispatcher::new(self.registry, config.tool_timeout());
        if let Some(remote) = remote {
            dispatcher = dispatcher.with_remote(remote);
            if let Err(e) = dispatcher.load_remote_tools().await {
                tracing::error!("Failed to load remote tools, continuing without them: {}", e);
            }
        }

        let session = config.declared_session(config.load_instructions(), dispatcher.declared_tools());
        let manager_config = config.session_manager_config(session)?;
        let cancel = CancellationToken::new();
        let (manager, handle, events) =
            SessionManager::new(manager_config, self.notifier, cancel.clone());

        let decoders = self.decoders.unwrap_or_else(default_decoder_factory);
        let (uplink_transcoders, playback_transcoders) = match self.transcoders {
            Some(factory) => (factory.clone(), factory),
            None => (
                transcoder_factory(config.transcoder, config.ffmpeg_path.clone(), None),
                transcoder_factory(
                    config.transcoder,
                    config.ffmpeg_path.clone(),
                    config.playback_filter.clone(),
                ),
            ),
        };

        let input = AudioInputRelay::new(
            Arc::new(handle.clone()),
            decoders,
            uplink_transcoders,
            config.platform_format(),
            config.endpoint_format(),
            config.max_queued_frames,
        );
        let playback = AudioOutputRelay::new(
            self.sink.clone(),
            playback_transcoders,
            config.endpoint_format(),
            config.platform_format(),
            config.jitter_frames,
        );

        Ok(VoiceRelay {
            channel_id: config.channel_id.clone(),
            sink: self.sink,
            transcripts: self.transcripts,
            session: handle,
            events,
            manager: Some(manager),
            manager_task: None,
            dispatcher: Arc::new(dispatcher),
            input,
            playback,
            subscription: None,
            tool_tasks: JoinSet::new(),
            cancel,
            stopped: false,
        })
    }
}

#[cfg(feature = "opus")]
fn default_decoder_factory() -> DecoderFactory {
    crate::core::transcode::opus_decoder_factory()
}

#[cfg(not(feature = "opus"))]
fn default_decoder_factory() -> DecoderFactory {
    pcm_decoder_factory()
}

// =============================================================================
// Relay
// =============================================================================

/// One relay instance: a voice channel bridged to one realtime session.
pub struct VoiceRelay {
    channel_id: String,
    sink: Arc<dyn VoiceSink>,
    transcripts: Arc<dyn TranscriptSink>,
    session: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    manager: Option<SessionManager>,
    manager_task: Option<JoinHandle<RealtimeResult<()>>>,
    dispatcher: Arc<ToolDispatcher>,
    input: AudioInputRelay,
    playback: AudioOutputRelay,
    subscription: Option<SpeakingSubscription>,
    tool_tasks: JoinSet<DispatchOutcome>,
    cancel: CancellationToken,
    stopped: bool,
}

impl VoiceRelay {
    /// Starts a builder with log-only collaborators and no voice platform.
    pub fn builder(config: RelayConfig) -> VoiceRelayBuilder {
        VoiceRelayBuilder {
            config,
            sink: Arc::new(DetachedVoiceSink),
            notifier: Arc::new(LogNotifier),
            transcripts: Arc::new(LogTranscriptSink),
            registry: ToolRegistry::with_builtins(),
            remote: None,
            decoders: None,
            transcoders: None,
        }
    }

    /// Handle for sending text or controlling the session from elsewhere.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Cancelling this token stops [`VoiceRelay::run`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Joins the voice channel, subscribes to speaking events, and starts the
    /// session task.
    pub async fn start(&mut self) -> RelayResult<()> {
        let Some(manager) = self.manager.take() else {
            return Ok(());
        };
        self.sink.join(&self.channel_id).await?;
        self.subscription = Some(self.sink.subscribe_speaking_events());
        self.manager_task = Some(tokio::spawn(manager.run()));
        tracing::info!("Relay started for channel {}", self.channel_id);
        Ok(())
    }

    /// Runs the control loop until cancelled or the session gives up, then
    /// shuts down.
    pub async fn run(&mut self) -> RelayResult<()> {
        self.start().await?;

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),

                event = next_voice_event(&mut self.subscription) => match event {
                    Some(event) => self.handle_voice_event(event).await,
                    None => {
                        tracing::info!("Speaking events ended");
                        self.subscription = None;
                    }
                },

                event = self.events.recv() => match event {
                    Some(event) => self.handle_session_event(event).await,
                    None => break self.session_result().await,
                },

                Some(joined) = self.tool_tasks.join_next(), if !self.tool_tasks.is_empty() => {
                    match joined {
                        Ok(outcome) => tracing::debug!("Tool batch finished: {:?}", outcome),
                        Err(e) => tracing::error!("Tool batch task failed: {}", e),
                    }
                }

                _ = uplink_resumed(self.input.uplink()), if self.input.has_backlog() => {
                    self.input.drain_backlog();
                }
            }
        };

        self.shutdown().await;
        result
    }

    async fn handle_voice_event(&mut self, event: VoiceEvent) {
        match event {
            VoiceEvent::SpeechStart(speaker) => {
                let label = self.sink.speaker_label(&speaker);
                if let Err(e) = self.input.on_speech_start(&speaker, label) {
                    tracing::error!("Failed to start pipeline for {}: {}", speaker, e);
                }
            }
            VoiceEvent::Audio { speaker, packet } => {
                if let Err(e) = self.input.on_packet(&speaker, &packet).await {
                    tracing::error!("Failed to relay audio for {}: {}", speaker, e);
                }
            }
            VoiceEvent::SpeechEnd(speaker) => self.input.on_speech_end(&speaker).await,
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Transcript(text) => {
                self.transcripts
                    .on_transcript(self.input.last_active_speaker(), &text)
                    .await;
            }
            SessionEvent::AudioDelta(audio) => self.playback.handle(&audio).await,
            SessionEvent::AudioDone => self.playback.reset().await,
            SessionEvent::ToolCalls(calls) => {
                tracing::debug!("Dispatching {} tool call(s)", calls.len());
                let dispatcher = self.dispatcher.clone();
                let session = self.session.clone();
                self.tool_tasks
                    .spawn(async move { dispatcher.dispatch(calls, &session).await });
            }
            SessionEvent::StateChanged(SessionState::Disconnected) => {
                // Audio from a dead session will never get its done event
                self.playback.reset().await;
            }
            SessionEvent::StateChanged(state) => tracing::debug!("Session state: {}", state),
            SessionEvent::Reconnecting { attempt, delay } => {
                tracing::debug!("Reconnect attempt {} scheduled in {:?}", attempt, delay);
            }
        }
    }

    async fn session_result(&mut self) -> RelayResult<()> {
        let Some(task) = self.manager_task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::Connection(e)),
            Err(e) => Err(RelayError::Connection(RealtimeError::ProviderError(format!(
                "session task failed: {}",
                e
            )))),
        }
    }

    /// Closes the socket, releases subscriptions and pipelines, and destroys
    /// the voice sink. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        tracing::info!("Shutting down relay for channel {}", self.channel_id);

        let _ = self.session.shutdown();
        self.subscription = None;
        self.tool_tasks.abort_all();
        self.input.shutdown().await;
        self.playback.reset().await;

        if let Some(mut task) = self.manager_task.take() {
            match tokio::time::timeout(SESSION_SHUTDOWN_TIMEOUT, &mut task).await {
                Ok(Ok(Err(e))) => tracing::debug!("Session ended with: {}", e),
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("Session task did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        self.manager = None;

        self.sink.destroy().await;
        self.cancel.cancel();
    }
}

async fn uplink_resumed(uplink: Arc<dyn UplinkSink>) {
    uplink.resumed().await
}

async fn next_voice_event(subscription: &mut Option<SpeakingSubscription>) -> Option<VoiceEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
