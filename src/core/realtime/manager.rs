//! Socket owner for the realtime session.
//!
//! [`SessionManager::run`] is a single control loop: connect, declare the
//! session, exchange events until the socket closes, then back off and
//! reconnect. Everything else talks to it through a cloneable
//! [`SessionHandle`] and hears back on a [`SessionEvent`] channel.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::base::{ReconnectionConfig, RealtimeError, RealtimeResult, SessionState};
use super::openai::{ClientEvent, OPENAI_BETA_HEADER, ServerEvent, SessionConfig};
use super::session::{OutboundRequest, Session, SessionEvent};
use crate::core::backpressure::{GaugeTicket, OutboundGauge};
use crate::core::relay::UplinkSink;
use crate::core::voice::Notifier;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings for one [`SessionManager`].
#[derive(Clone)]
pub struct SessionManagerConfig {
    /// Full WebSocket URL including the model query
    pub url: String,
    pub api_key: Zeroizing<String>,
    /// Declared in `session.update` on every connect
    pub session: SessionConfig,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Open time after which the retry count resets
    pub stable_period: Duration,
    pub reconnection: ReconnectionConfig,
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl std::fmt::Debug for SessionManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManagerConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("stable_period", &self.stable_period)
            .field("reconnection", &self.reconnection)
            .finish()
    }
}

/// Commands accepted by the session loop.
#[derive(Debug)]
pub enum SessionCommand {
    /// Send a request. Audio carries a backpressure ticket released once written.
    Outbound {
        request: OutboundRequest,
        ticket: Option<GaugeTicket>,
    },
    /// Tear down and recreate the session without backoff
    Restart,
    Shutdown,
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to a running [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    open: Arc<AtomicBool>,
    gauge: OutboundGauge,
}

impl SessionHandle {
    pub(crate) fn from_parts(
        commands: mpsc::UnboundedSender<SessionCommand>,
        open: Arc<AtomicBool>,
        gauge: OutboundGauge,
    ) -> Self {
        Self {
            commands,
            open,
            gauge,
        }
    }

    /// Whether the socket is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn gauge(&self) -> &OutboundGauge {
        &self.gauge
    }

    fn command(&self, command: SessionCommand) -> RealtimeResult<()> {
        self.commands
            .send(command)
            .map_err(|_| RealtimeError::SessionClosed)
    }

    fn outbound(&self, request: OutboundRequest) -> RealtimeResult<()> {
        self.command(SessionCommand::Outbound {
            request,
            ticket: None,
        })
    }

    /// Queues one audio frame and reserves its bytes on the gauge. Never
    /// waits; producers hold frames while the gauge is paused. Frames are
    /// refused while the socket is not open.
    pub fn send_audio(&self, frame: Bytes, speaker: Option<String>) -> RealtimeResult<()> {
        if !self.is_open() {
            return Err(RealtimeError::NotConnected);
        }
        let ticket = self.gauge.reserve(frame.len());
        self.command(SessionCommand::Outbound {
            request: OutboundRequest::Audio { frame, speaker },
            ticket: Some(ticket),
        })
    }

    /// Sends a user text message followed by a response request.
    pub fn send_text(&self, text: impl Into<String>) -> RealtimeResult<()> {
        self.outbound(OutboundRequest::Text(text.into()))
    }

    pub fn submit_tool_output(&self, call_id: &str, output: String) -> RealtimeResult<()> {
        self.outbound(OutboundRequest::ToolOutput {
            call_id: call_id.to_string(),
            output,
        })
    }

    pub fn submit_tool_message(&self, call_id: &str, text: String) -> RealtimeResult<()> {
        self.outbound(OutboundRequest::ToolMessage {
            call_id: call_id.to_string(),
            text,
        })
    }

    pub fn suppress_followup(&self, call_id: &str) -> RealtimeResult<()> {
        self.outbound(OutboundRequest::SuppressFollowup {
            call_id: call_id.to_string(),
        })
    }

    /// Requests a response. With a call id, the request is skipped if that
    /// call was suppressed.
    pub fn request_response(&self, call_id: Option<&str>) -> RealtimeResult<()> {
        self.outbound(OutboundRequest::CreateResponse {
            call_id: call_id.map(str::to_string),
        })
    }

    pub fn restart(&self) -> RealtimeResult<()> {
        self.command(SessionCommand::Restart)
    }

    pub fn shutdown(&self) -> RealtimeResult<()> {
        self.command(SessionCommand::Shutdown)
    }
}

#[async_trait]
impl UplinkSink for SessionHandle {
    fn is_open(&self) -> bool {
        SessionHandle::is_open(self)
    }

    fn is_paused(&self) -> bool {
        self.gauge.is_paused()
    }

    fn send_frame(&self, speaker: Option<String>, frame: Bytes) -> RealtimeResult<()> {
        self.send_audio(frame, speaker)
    }

    async fn resumed(&self) {
        self.gauge.wait_for_capacity().await
    }
}

// =============================================================================
// Manager
// =============================================================================

enum DriveOutcome {
    Closed(String),
    Restart,
    Shutdown,
}

/// Owns the realtime WebSocket and the current [`Session`].
pub struct SessionManager {
    config: SessionManagerConfig,
    session: Session,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    open: Arc<AtomicBool>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        notifier: Arc<dyn Notifier>,
        cancel: CancellationToken,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let gauge = OutboundGauge::new(config.high_watermark, config.low_watermark);

        let handle = SessionHandle::from_parts(command_tx, open.clone(), gauge);
        let manager = Self {
            session: Session::new(config.session.clone()),
            config,
            commands: command_rx,
            events: event_tx,
            open,
            notifier,
            cancel,
        };
        (manager, handle, event_rx)
    }

    /// Runs until shutdown, cancellation, or retries are exhausted.
    pub async fn run(mut self) -> RealtimeResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            self.set_state(SessionState::Connecting);
            match self.connect().await {
                Ok(ws) => {
                    let outcome = self.drive(ws).await;
                    self.open.store(false, Ordering::Release);
                    self.session.mark_closed(self.config.stable_period);
                    self.emit(SessionEvent::StateChanged(SessionState::Disconnected));

                    match outcome {
                        DriveOutcome::Shutdown => {
                            tracing::info!("Realtime session {} shut down", self.session.id());
                            return Ok(());
                        }
                        DriveOutcome::Restart => {
                            tracing::info!("Recreating realtime session");
                            self.session = self.session.successor();
                            continue;
                        }
                        DriveOutcome::Closed(reason) => {
                            tracing::warn!("Realtime connection lost: {}", reason);
                            self.session = self.session.successor();
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Realtime connection attempt failed: {}", e);
                    self.set_state(SessionState::Disconnected);
                }
            }

            if !self.config.reconnection.should_retry(self.session.retry_count()) {
                let attempts = self.session.retry_count();
                tracing::error!("Giving up on realtime endpoint after {} attempt(s)", attempts);
                self.notifier
                    .send(&format!(
                        "Realtime voice session lost: reconnection failed after {} attempt(s).",
                        attempts
                    ))
                    .await;
                return Err(RealtimeError::RetriesExhausted(attempts));
            }

            let attempt = self.session.record_retry();
            let delay = Duration::from_millis(self.config.reconnection.calculate_delay(attempt));
            tracing::info!(
                "Attempting reconnection {}/{} in {}ms",
                attempt,
                if self.config.reconnection.max_attempts == 0 {
                    "unlimited".to_string()
                } else {
                    self.config.reconnection.max_attempts.to_string()
                },
                delay.as_millis()
            );
            self.emit(SessionEvent::Reconnecting { attempt, delay });

            if !self.wait_backoff(delay).await {
                return Ok(());
            }
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.session.transition(state) {
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // The relay may already be gone during shutdown
        let _ = self.events.send(event);
    }

    async fn connect(&self) -> RealtimeResult<WsStream> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;

        let auth = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key.as_str()))
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", auth);
        headers.insert("OpenAI-Beta", HeaderValue::from_static(OPENAI_BETA_HEADER));

        let (ws, _response) =
            tokio::time::timeout(self.config.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    RealtimeError::Timeout(format!(
                        "connect after {}ms",
                        self.config.connect_timeout.as_millis()
                    ))
                })?
                .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connected to realtime endpoint");
        Ok(ws)
    }

    async fn drive(&mut self, ws: WsStream) -> DriveOutcome {
        let (mut sink, mut stream) = ws.split();

        let update = self.session.mark_open();
        self.open.store(true, Ordering::Release);
        self.emit(SessionEvent::StateChanged(SessionState::Open));
        if let Err(e) = send_event(&mut sink, &update).await {
            return DriveOutcome::Closed(format!("session.update failed: {}", e));
        }
        tracing::info!("Realtime session {} open", self.session.id());

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(SessionState::Closing);
                    let _ = sink.send(Message::Close(None)).await;
                    return DriveOutcome::Shutdown;
                }

                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => {
                        self.set_state(SessionState::Closing);
                        let _ = sink.send(Message::Close(None)).await;
                        return DriveOutcome::Shutdown;
                    }
                    Some(SessionCommand::Restart) => {
                        self.set_state(SessionState::Closing);
                        let _ = sink.send(Message::Close(None)).await;
                        return DriveOutcome::Restart;
                    }
                    Some(SessionCommand::Outbound { request, ticket }) => {
                        for event in self.session.prepare_outbound(request) {
                            let sent = tokio::select! {
                                _ = self.cancel.cancelled() => {
                                    tracing::debug!("Cancelled while writing {}", event.event_type());
                                    return DriveOutcome::Shutdown;
                                }
                                sent = send_event(&mut sink, &event) => sent,
                            };
                            if let Err(e) = sent {
                                return DriveOutcome::Closed(format!(
                                    "send {} failed: {}",
                                    event.event_type(),
                                    e
                                ));
                            }
                        }
                        drop(ticket);
                    }
                },

                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return DriveOutcome::Closed(format!("pong failed: {}", e));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by server ({}): {}", f.code, f.reason.as_str()))
                            .unwrap_or_else(|| "closed by server".to_string());
                        return DriveOutcome::Closed(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return DriveOutcome::Closed(format!("WebSocket error: {}", e)),
                    None => return DriveOutcome::Closed("stream ended".to_string()),
                },

                _ = heartbeat.tick() => {
                    tracing::trace!("Sending heartbeat ping");
                    if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                        return DriveOutcome::Closed(format!("heartbeat failed: {}", e));
                    }
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => {
                if let Some(classified) = self.session.classify(event) {
                    self.emit(classified);
                }
            }
            Err(e) => tracing::warn!("Failed to parse server event: {}", e),
        }
    }

    /// Sleeps for `delay`, discarding outbound requests meanwhile.
    /// Returns false if the manager should stop.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut discarded = 0usize;

        let keep_going = loop {
            tokio::select! {
                _ = &mut sleep => break true,
                _ = self.cancel.cancelled() => break false,
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => break false,
                    Some(SessionCommand::Restart) => break true,
                    Some(SessionCommand::Outbound { .. }) => discarded += 1,
                },
            }
        };

        if discarded > 0 {
            tracing::debug!("Discarded {} outbound request(s) while disconnected", discarded);
        }
        keep_going
    }
}

async fn send_event<S>(sink: &mut S, event: &ClientEvent) -> RealtimeResult<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(event)
        .map_err(|e| RealtimeError::SerializationError(e.to_string()))?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| RealtimeError::WebSocketError(e.to_string()))
}
