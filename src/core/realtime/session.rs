//! The realtime session object: lifecycle state, continuity, and pending calls.
//!
//! A `Session` owns everything that must not outlive one WebSocket
//! connection. It translates outbound requests into client events and
//! classifies inbound server events. It performs no I/O, so every rule here
//! is testable without a socket.

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::base::SessionState;
use super::openai::{ClientEvent, ConversationItem, ServerEvent, SessionConfig};
use crate::core::tools::{FunctionCall, NO_RESPONSE_TOOL};

/// A function call awaiting its result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallContext {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
    /// Skip the `response.create` that would normally follow this call's output
    pub suppress_followup: bool,
}

/// Something the relay wants sent to the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRequest {
    /// One uplink audio frame
    Audio { frame: Bytes, speaker: Option<String> },
    /// A typed user message
    Text(String),
    /// Structured result for a local tool call
    ToolOutput { call_id: String, output: String },
    /// Plain conversational summary for a remote tool call
    ToolMessage { call_id: String, text: String },
    /// Mark a call's follow-up response as suppressed
    SuppressFollowup { call_id: String },
    /// Request a new response, optionally on behalf of a tool call
    CreateResponse { call_id: Option<String> },
}

/// What a session reports to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A completed user transcript
    Transcript(String),
    /// Decoded response audio
    AudioDelta(Bytes),
    /// Response audio finished
    AudioDone,
    /// Function calls from a completed response, in array order
    ToolCalls(Vec<FunctionCall>),
    StateChanged(SessionState),
    /// A reconnect is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
}

/// One logical conversation over one connection.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    state: SessionState,
    declared: SessionConfig,
    pending_calls: HashMap<String, ToolCallContext>,
    last_item_id: Option<String>,
    retry_count: u32,
    opened_at: Option<Instant>,
}

impl Session {
    pub fn new(declared: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Disconnected,
            declared,
            pending_calls: HashMap::new(),
            last_item_id: None,
            retry_count: 0,
            opened_at: None,
        }
    }

    /// A fresh session replacing this one. Only the retry count carries over.
    pub fn successor(&self) -> Self {
        Self {
            retry_count: self.retry_count,
            ..Self::new(self.declared.clone())
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn declared(&self) -> &SessionConfig {
        &self.declared
    }

    pub fn last_item_id(&self) -> Option<&str> {
        self.last_item_id.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Counts one more reconnect attempt and returns the new total.
    pub fn record_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    pub fn pending_call(&self, call_id: &str) -> Option<&ToolCallContext> {
        self.pending_calls.get(call_id)
    }

    pub fn pending_call_count(&self) -> usize {
        self.pending_calls.len()
    }

    /// Moves to `next`. Illegal transitions are logged and ignored.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!("Ignoring session transition {} -> {}", self.state, next);
            return false;
        }
        tracing::debug!("Session {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        true
    }

    /// Marks the socket open and returns the `session.update` to send first.
    pub fn mark_open(&mut self) -> ClientEvent {
        self.transition(SessionState::Open);
        self.opened_at = Some(Instant::now());
        ClientEvent::SessionUpdate {
            session: self.declared.clone(),
        }
    }

    /// Marks the socket closed. A session that stayed open for at least
    /// `stable_period` clears its retry count.
    pub fn mark_closed(&mut self, stable_period: Duration) {
        if let Some(opened_at) = self.opened_at.take() {
            if opened_at.elapsed() >= stable_period && self.retry_count > 0 {
                tracing::debug!(
                    "Session was stable for {:?}, resetting retry count from {}",
                    opened_at.elapsed(),
                    self.retry_count
                );
                self.retry_count = 0;
            }
        }
        self.transition(SessionState::Disconnected);
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Classifies a server event. Events arriving outside `Open` are dropped.
    pub fn classify(&mut self, event: ServerEvent) -> Option<SessionEvent> {
        if self.state != SessionState::Open {
            tracing::debug!("Dropping server event while {}", self.state);
            return None;
        }

        match event {
            ServerEvent::TranscriptionCompleted { transcript, .. } => {
                Some(SessionEvent::Transcript(transcript))
            }
            ServerEvent::AudioDelta { delta, .. } => match ServerEvent::decode_audio_delta(&delta) {
                Ok(audio) if !audio.is_empty() => Some(SessionEvent::AudioDelta(Bytes::from(audio))),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("Discarding undecodable audio delta: {}", e);
                    None
                }
            },
            ServerEvent::AudioDone { .. } => Some(SessionEvent::AudioDone),
            ServerEvent::ResponseDone { response } => {
                if let Some(id) = response.last_item_id() {
                    self.last_item_id = Some(id.to_string());
                }
                let calls: Vec<FunctionCall> = response
                    .output
                    .iter()
                    .filter_map(FunctionCall::from_item)
                    .collect();
                if calls.is_empty() {
                    return None;
                }
                for call in &calls {
                    let arguments = call.parsed_arguments().unwrap_or(Value::Null);
                    self.pending_calls.insert(
                        call.call_id.clone(),
                        ToolCallContext {
                            call_id: call.call_id.clone(),
                            name: call.name.clone(),
                            arguments,
                            suppress_followup: false,
                        },
                    );
                }
                Some(SessionEvent::ToolCalls(calls))
            }
            ServerEvent::Error { error } => {
                tracing::error!(
                    "Realtime endpoint error ({}): {}",
                    error.error_type,
                    error.message
                );
                None
            }
            ServerEvent::SessionCreated { .. } => {
                tracing::debug!("Session {} created", self.id);
                None
            }
            ServerEvent::SessionUpdated { .. } => {
                tracing::debug!("Session {} configuration acknowledged", self.id);
                None
            }
            ServerEvent::Unknown => None,
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Translates a request into the client events to send, in order.
    pub fn prepare_outbound(&mut self, request: OutboundRequest) -> Vec<ClientEvent> {
        match request {
            OutboundRequest::Audio { frame, speaker } => {
                vec![ClientEvent::audio_append(&frame, speaker)]
            }
            OutboundRequest::Text(text) => vec![
                ClientEvent::ConversationItemCreate {
                    item: ConversationItem::user_text(text),
                    previous_item_id: self.last_item_id.clone(),
                },
                ClientEvent::ResponseCreate,
            ],
            OutboundRequest::ToolOutput { call_id, output } => {
                vec![ClientEvent::ConversationItemCreate {
                    item: ConversationItem::function_call_output(call_id, output),
                    previous_item_id: None,
                }]
            }
            OutboundRequest::ToolMessage { call_id, text } => {
                let mut events = vec![ClientEvent::ConversationItemCreate {
                    item: ConversationItem::user_text(text),
                    previous_item_id: self.last_item_id.clone(),
                }];
                if self.take_followup(&call_id) {
                    events.push(ClientEvent::ResponseCreate);
                }
                events
            }
            OutboundRequest::SuppressFollowup { call_id } => {
                self.pending_calls
                    .entry(call_id.clone())
                    .or_insert_with(|| ToolCallContext {
                        call_id,
                        name: NO_RESPONSE_TOOL.to_string(),
                        arguments: Value::Null,
                        suppress_followup: false,
                    })
                    .suppress_followup = true;
                Vec::new()
            }
            OutboundRequest::CreateResponse { call_id: None } => vec![ClientEvent::ResponseCreate],
            OutboundRequest::CreateResponse {
                call_id: Some(call_id),
            } => {
                if self.take_followup(&call_id) {
                    vec![ClientEvent::ResponseCreate]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Removes the call's context and reports whether a follow-up response
    /// may be requested for it.
    fn take_followup(&mut self, call_id: &str) -> bool {
        match self.pending_calls.remove(call_id) {
            Some(ctx) if ctx.suppress_followup => {
                tracing::debug!("Suppressing follow-up response for call {}", call_id);
                false
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::prelude::*;

    fn open_session() -> Session {
        let mut session = Session::new(SessionConfig::default());
        session.transition(SessionState::Connecting);
        session.mark_open();
        session
    }

    fn response_done(json: &str) -> ServerEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_mark_open_returns_declared_config() {
        let declared = SessionConfig {
            voice: Some("ballad".to_string()),
            ..Default::default()
        };
        let mut session = Session::new(declared.clone());
        session.transition(SessionState::Connecting);
        match session.mark_open() {
            ClientEvent::SessionUpdate { session: sent } => assert_eq!(sent, declared),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn test_events_ignored_unless_open() {
        let mut session = Session::new(SessionConfig::default());
        let event = ServerEvent::AudioDone { response_id: None };
        assert!(session.classify(event).is_none());
    }

    #[test]
    fn test_classify_audio_and_transcript() {
        let mut session = open_session();
        let delta = ServerEvent::AudioDelta {
            response_id: None,
            delta: BASE64_STANDARD.encode([1u8, 2, 3, 4]),
        };
        assert_eq!(
            session.classify(delta),
            Some(SessionEvent::AudioDelta(Bytes::from_static(&[1, 2, 3, 4])))
        );

        let transcript = ServerEvent::TranscriptionCompleted {
            item_id: None,
            transcript: "hello".to_string(),
        };
        assert_eq!(
            session.classify(transcript),
            Some(SessionEvent::Transcript("hello".to_string()))
        );
        assert!(session.classify(ServerEvent::Unknown).is_none());
    }

    #[test]
    fn test_response_done_tracks_last_item_and_calls() {
        let mut session = open_session();
        let event = response_done(
            r#"{"type":"response.done","response":{"output":[
                {"id":"item_a","type":"function_call","call_id":"c1","name":"first","arguments":"{\"a\":1}"},
                {"id":"item_b","type":"function_call","call_id":"c2","name":"second","arguments":""}
            ]}}"#,
        );
        let Some(SessionEvent::ToolCalls(calls)) = session.classify(event) else {
            panic!("expected tool calls");
        };
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(session.last_item_id(), Some("item_b"));
        assert_eq!(session.pending_call_count(), 2);
        assert_eq!(
            session.pending_call("c1").unwrap().arguments,
            serde_json::json!({"a": 1})
        );
    }

    #[test]
    fn test_text_message_chains_previous_item() {
        let mut session = open_session();
        session.classify(response_done(
            r#"{"type":"response.done","response":{"output":[{"id":"item_9","type":"message"}]}}"#,
        ));

        let events = session.prepare_outbound(OutboundRequest::Text("hi".to_string()));
        assert_eq!(events.len(), 2);
        match &events[0] {
            ClientEvent::ConversationItemCreate {
                previous_item_id, ..
            } => assert_eq!(previous_item_id.as_deref(), Some("item_9")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events[1], ClientEvent::ResponseCreate);
    }

    #[test]
    fn test_suppressed_call_gets_no_followup() {
        let mut session = open_session();
        session.classify(response_done(
            r#"{"type":"response.done","response":{"output":[
                {"type":"function_call","call_id":"quiet","name":"no_response","arguments":"{}"}
            ]}}"#,
        ));

        assert!(session
            .prepare_outbound(OutboundRequest::SuppressFollowup {
                call_id: "quiet".to_string()
            })
            .is_empty());
        let output = session.prepare_outbound(OutboundRequest::ToolOutput {
            call_id: "quiet".to_string(),
            output: r#"{"ok":true}"#.to_string(),
        });
        assert_eq!(output.len(), 1);

        let followup = session.prepare_outbound(OutboundRequest::CreateResponse {
            call_id: Some("quiet".to_string()),
        });
        assert!(followup.is_empty());
        assert_eq!(session.pending_call_count(), 0);
    }

    #[test]
    fn test_unsuppressed_call_gets_followup_and_is_removed() {
        let mut session = open_session();
        session.classify(response_done(
            r#"{"type":"response.done","response":{"output":[
                {"type":"function_call","call_id":"c1","name":"get_current_datetime","arguments":"{}"}
            ]}}"#,
        ));
        let followup = session.prepare_outbound(OutboundRequest::CreateResponse {
            call_id: Some("c1".to_string()),
        });
        assert_eq!(followup, vec![ClientEvent::ResponseCreate]);
        assert!(session.pending_call("c1").is_none());
    }

    #[test]
    fn test_tool_message_issues_single_response_create() {
        let mut session = open_session();
        let events = session.prepare_outbound(OutboundRequest::ToolMessage {
            call_id: "r1".to_string(),
            text: "Result of weather: Sunny".to_string(),
        });
        let creates = events
            .iter()
            .filter(|e| matches!(e, ClientEvent::ResponseCreate))
            .count();
        assert_eq!(events.len(), 2);
        assert_eq!(creates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_resets_only_after_stable_period() {
        let stable = Duration::from_secs(30);
        let mut session = open_session();
        session.record_retry();
        session.record_retry();

        tokio::time::advance(Duration::from_secs(5)).await;
        session.mark_closed(stable);
        assert_eq!(session.retry_count(), 2);
        assert_eq!(session.state(), SessionState::Disconnected);

        let mut next = session.successor();
        assert_eq!(next.retry_count(), 2);
        assert_ne!(next.id(), session.id());
        next.transition(SessionState::Connecting);
        next.mark_open();
        tokio::time::advance(Duration::from_secs(31)).await;
        next.mark_closed(stable);
        assert_eq!(next.retry_count(), 0);
    }

    #[test]
    fn test_successor_starts_clean() {
        let mut session = open_session();
        session.classify(response_done(
            r#"{"type":"response.done","response":{"output":[
                {"id":"i1","type":"function_call","call_id":"c1","name":"x","arguments":"{}"}
            ]}}"#,
        ));
        let next = session.successor();
        assert_eq!(next.state(), SessionState::Disconnected);
        assert!(next.last_item_id().is_none());
        assert_eq!(next.pending_call_count(), 0);
    }
}
