//! Mock realtime endpoint
//!
//! A local WebSocket server that records every client event as JSON and
//! answers through a caller-supplied responder. Each accepted connection is
//! counted so reconnects and restarts can be observed, and so is every
//! WebSocket ping.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Maps one received client event to the server events sent back.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

/// A client event together with the connection it arrived on (1-based).
#[derive(Debug, Clone)]
pub struct Received {
    pub connection: usize,
    pub event: Value,
}

impl Received {
    pub fn event_type(&self) -> &str {
        self.event["type"].as_str().unwrap_or_default()
    }
}

pub struct MockRealtimeServer {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Received>,
    connections: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockRealtimeServer {
    /// Server that never sends anything.
    pub async fn silent() -> Self {
        Self::start(Arc::new(|_| Vec::new())).await
    }

    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let pings = Arc::new(AtomicUsize::new(0));

        let counter = connections.clone();
        let ping_counter = pings.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(handle_connection(
                    stream,
                    connection,
                    responder.clone(),
                    tx.clone(),
                    ping_counter.clone(),
                ));
            }
        });

        Self {
            addr,
            received: rx,
            connections,
            pings,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Pings received across all connections.
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Next client event, failing the test after five seconds.
    pub async fn next_event(&mut self) -> Received {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("mock server stopped")
    }

    /// Skips events until one of `event_type` arrives.
    pub async fn next_event_of_type(&mut self, event_type: &str) -> Received {
        loop {
            let received = self.next_event().await;
            if received.event_type() == event_type {
                return received;
            }
        }
    }

    /// Asserts nothing else arrives within `wait`.
    pub async fn assert_quiet(&mut self, wait: Duration) {
        if let Ok(Some(received)) = tokio::time::timeout(wait, self.received.recv()).await {
            panic!("unexpected client event: {}", received.event);
        }
    }
}

impl Drop for MockRealtimeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    connection: usize,
    responder: Responder,
    tx: mpsc::UnboundedSender<Received>,
    pings: Arc<AtomicUsize>,
) {
    let Ok(ws_stream) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let Ok(event) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let replies = responder(&event);
                let _ = tx.send(Received { connection, event });
                for reply in replies {
                    if write
                        .send(Message::Text(reply.to_string().into()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                pings.fetch_add(1, Ordering::SeqCst);
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
}

// =============================================================================
// Server event builders
// =============================================================================

pub fn function_call(call_id: &str, name: &str, arguments: Value) -> Value {
    json!({
        "id": format!("item_{}", call_id),
        "type": "function_call",
        "call_id": call_id,
        "name": name,
        "arguments": arguments.to_string(),
    })
}

pub fn response_done(output: Vec<Value>) -> Value {
    json!({
        "type": "response.done",
        "response": { "id": "resp_1", "status": "completed", "output": output }
    })
}

pub fn audio_delta(pcm: &[u8]) -> Value {
    use base64::prelude::*;
    json!({ "type": "response.audio.delta", "response_id": "resp_1", "delta": BASE64_STANDARD.encode(pcm) })
}

pub fn audio_done() -> Value {
    json!({ "type": "response.audio.done", "response_id": "resp_1" })
}

pub fn transcript(text: &str) -> Value {
    json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "item_id": "item_user",
        "transcript": text,
    })
}

/// An address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
