//! In-memory transport that behaves like a small SFS broker.
//!
//! Supports any number of concurrent client connections (two coexist during
//! every player handoff), auto-acks play requests with a fresh guid, serves
//! an init segment on media-topic subscription, and exposes scripting hooks
//! for connection drops, host detachment, and additional media segments.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::topics::{PLAY_REQUEST_TOPIC, StreamTopics, response_topic};
use super::transport::{
    InboundMessage, MqttConnection, MqttTransport, TransportError, TransportEvent, TransportResult,
};

/// MIME codec string the simulated server negotiates.
pub const SIMULATED_MIME_CODEC: &str = "video/mp4; codecs=\"avc1.42E01E\"";

/// Returns a minimal byte sequence shaped like an fMP4 init segment.
pub fn fmp4_init_stub() -> Bytes {
    Bytes::from_static(&[
        0x00, 0x00, 0x00, 0x10, b'f', b't', b'y', b'p', b'i', b's', b'o', b'm', 0x00, 0x00, 0x00,
        0x01, 0x00, 0x00, 0x00, 0x08, b'm', b'o', b'o', b'v',
    ])
}

/// Returns a minimal byte sequence shaped like an fMP4 media segment.
pub fn fmp4_media_stub() -> Bytes {
    Bytes::from_static(&[
        0x00, 0x00, 0x00, 0x08, b'm', b'o', b'o', b'f', 0x00, 0x00, 0x00, 0x08, b'm', b'd', b'a',
        b't',
    ])
}

/// Returns a payload that fails the fMP4 sanity check.
pub fn malformed_stub() -> Bytes {
    Bytes::from_static(b"not-an-fmp4-box!")
}

struct ConnectionState {
    client_id: String,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<u64, ConnectionState>,
    next_connection_id: u64,
    published: Vec<(String, Bytes)>,
    guids: Vec<String>,
    fail_next_connect: bool,
    auto_media_segments: u32,
}

/// Scriptable in-memory broker implementing [`MqttTransport`].
pub struct SimulatedTransport {
    state: Arc<Mutex<BrokerState>>,
}

impl SimulatedTransport {
    /// Creates a broker that auto-serves three media segments after every
    /// init segment.
    pub fn new() -> Self {
        let state = BrokerState {
            auto_media_segments: 3,
            ..BrokerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Overrides how many media segments follow the init segment
    /// automatically on media-topic subscription.
    pub fn set_auto_media_segments(&self, count: u32) {
        self.lock().auto_media_segments = count;
    }

    /// Scripts the next connect attempt to fail.
    pub fn fail_next_connect(&self) {
        self.lock().fail_next_connect = true;
    }

    /// Pushes `count` media segments to every connection subscribed to a
    /// negotiated media topic.
    pub fn push_media_segments(&self, count: u32) {
        let guids = self.guids();
        for guid in guids {
            self.push_media_segments_to(&guid, count);
        }
    }

    /// Pushes `count` media segments for one negotiated stream guid only.
    pub fn push_media_segments_to(&self, guid: &str, count: u32) {
        let state = self.lock();
        let media_topic = StreamTopics::for_guid(guid).media;
        for connection in state.connections.values() {
            if !connection.subscriptions.contains(&media_topic) {
                continue;
            }
            for _ in 0..count {
                let _ = connection.event_tx.send(TransportEvent::Message(InboundMessage {
                    topic: media_topic.clone(),
                    payload: fmp4_media_stub(),
                }));
            }
        }
    }

    /// Returns every guid negotiated so far, oldest first.
    pub fn guids(&self) -> Vec<String> {
        self.lock().guids.clone()
    }

    /// Pushes a malformed payload to every media subscriber.
    pub fn push_malformed_media(&self) {
        let state = self.lock();
        for guid in &state.guids {
            let media_topic = StreamTopics::for_guid(guid).media;
            for connection in state.connections.values() {
                if connection.subscriptions.contains(&media_topic) {
                    let _ = connection.event_tx.send(TransportEvent::Message(InboundMessage {
                        topic: media_topic.clone(),
                        payload: malformed_stub(),
                    }));
                }
            }
        }
    }

    /// Pushes an arbitrary message to every connection subscribed to
    /// `topic`.
    pub fn push_message(&self, topic: &str, payload: Bytes) {
        let state = self.lock();
        for connection in state.connections.values() {
            if connection.subscriptions.contains(topic) {
                let _ = connection.event_tx.send(TransportEvent::Message(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                }));
            }
        }
    }

    /// Simulates a broker-side drop of every connection.
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.lock();
        for (_, connection) in state.connections.drain() {
            let _ = connection.event_tx.send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Simulates out-of-band removal of the transport's host element.
    pub fn detach_host(&self) {
        let mut state = self.lock();
        for (_, connection) in state.connections.drain() {
            let _ = connection.event_tx.send(TransportEvent::HostDetached);
        }
    }

    /// Returns every publish seen so far as `(topic, payload)`.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.lock().published.clone()
    }

    /// Returns the union of every connection's subscribed topics.
    pub fn subscriptions(&self) -> HashSet<String> {
        self.lock()
            .connections
            .values()
            .flat_map(|connection| connection.subscriptions.iter().cloned())
            .collect()
    }

    /// Returns how many connections are currently established.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Returns true while at least one connection is established.
    pub fn is_connected(&self) -> bool {
        self.connection_count() > 0
    }

    /// Returns the guid assigned to the most recent play request.
    pub fn negotiated_guid(&self) -> Option<String> {
        self.lock().guids.last().cloned()
    }
}

/// Answers a play request with a fresh guid on the requester's response
/// topic.
fn answer_play_request(state: &Mutex<BrokerState>, payload: &[u8]) {
    let request: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => return,
    };
    let Some(client_id) = request.get("clientId").and_then(|v| v.as_str()) else {
        return;
    };

    let guid = Uuid::new_v4().to_string();
    let response = serde_json::json!({
        "guid": guid,
        "mimeCodec": SIMULATED_MIME_CODEC,
    });
    let topic = response_topic(client_id);

    let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
    state.guids.push(guid);
    for connection in state.connections.values() {
        if connection.client_id == client_id && connection.subscriptions.contains(&topic) {
            let _ = connection.event_tx.send(TransportEvent::Message(InboundMessage {
                topic: topic.clone(),
                payload: Bytes::from(response.to_string()),
            }));
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MqttTransport for SimulatedTransport {
    async fn connect(
        &self,
        client_id: &str,
        _keep_alive: Duration,
    ) -> TransportResult<(
        Arc<dyn MqttConnection>,
        mpsc::UnboundedReceiver<TransportEvent>,
    )> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = {
            let mut state = self.lock();
            if state.fail_next_connect {
                state.fail_next_connect = false;
                return Err(TransportError::ConnectionFailed {
                    reason: "simulated connect failure".to_string(),
                });
            }
            let connection_id = state.next_connection_id;
            state.next_connection_id += 1;
            state.connections.insert(
                connection_id,
                ConnectionState {
                    client_id: client_id.to_string(),
                    event_tx: tx,
                    subscriptions: HashSet::new(),
                },
            );
            connection_id
        };

        let connection = Arc::new(SimulatedConnection {
            state: Arc::clone(&self.state),
            connection_id,
        });
        Ok((connection, rx))
    }
}

/// One client connection on the simulated broker.
pub struct SimulatedConnection {
    state: Arc<Mutex<BrokerState>>,
    connection_id: u64,
}

impl SimulatedConnection {
    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl MqttConnection for SimulatedConnection {
    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        let mut state = self.lock();
        let auto_segments = state.auto_media_segments;
        let is_media_topic = state
            .guids
            .iter()
            .any(|guid| StreamTopics::for_guid(guid).media == topic);

        let Some(connection) = state.connections.get_mut(&self.connection_id) else {
            return Err(TransportError::NotConnected);
        };
        connection.subscriptions.insert(topic.to_string());

        // Subscribing to a negotiated media topic starts the stream: the
        // server sends the init segment first, then media.
        if is_media_topic {
            let _ = connection.event_tx.send(TransportEvent::Message(InboundMessage {
                topic: topic.to_string(),
                payload: fmp4_init_stub(),
            }));
            for _ in 0..auto_segments {
                let _ = connection.event_tx.send(TransportEvent::Message(InboundMessage {
                    topic: topic.to_string(),
                    payload: fmp4_media_stub(),
                }));
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> TransportResult<()> {
        let mut state = self.lock();
        let Some(connection) = state.connections.get_mut(&self.connection_id) else {
            return Err(TransportError::NotConnected);
        };
        connection.subscriptions.remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> TransportResult<()> {
        {
            let mut state = self.lock();
            if !state.connections.contains_key(&self.connection_id) {
                return Err(TransportError::NotConnected);
            }
            state.published.push((topic.to_string(), payload.clone()));
        }
        if topic == PLAY_REQUEST_TOPIC {
            answer_play_request(&self.state, &payload);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.lock().connections.remove(&self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEEP_ALIVE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_play_request_is_answered_with_guid() {
        let transport = SimulatedTransport::new();
        let (connection, mut rx) = transport.connect("clsp-test", KEEP_ALIVE).await.unwrap();
        connection
            .subscribe(&response_topic("clsp-test"))
            .await
            .unwrap();
        connection
            .publish(
                PLAY_REQUEST_TOPIC,
                Bytes::from(r#"{"clientId":"clsp-test","streamName":"lobby"}"#),
            )
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        match event {
            TransportEvent::Message(msg) => {
                assert_eq!(msg.topic, "clsp-test/response");
                let value: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
                assert!(value.get("guid").is_some());
                assert_eq!(
                    value.get("mimeCodec").and_then(|v| v.as_str()),
                    Some(SIMULATED_MIME_CODEC)
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_media_subscription_serves_init_first() {
        let transport = SimulatedTransport::new();
        transport.set_auto_media_segments(2);
        let (connection, mut rx) = transport.connect("clsp-test", KEEP_ALIVE).await.unwrap();
        connection
            .publish(
                PLAY_REQUEST_TOPIC,
                Bytes::from(r#"{"clientId":"clsp-test"}"#),
            )
            .await
            .unwrap();

        let guid = transport.negotiated_guid().unwrap();
        let media_topic = StreamTopics::for_guid(&guid).media;
        connection.subscribe(&media_topic).await.unwrap();

        let mut payloads = Vec::new();
        // init + 2 media (no response subscription on this connection)
        for _ in 0..3 {
            if let Some(TransportEvent::Message(msg)) = rx.recv().await {
                payloads.push(msg.payload);
            }
        }
        assert_eq!(payloads[0], fmp4_init_stub());
        assert_eq!(payloads[1], fmp4_media_stub());
        assert_eq!(payloads[2], fmp4_media_stub());
    }

    #[tokio::test]
    async fn test_connections_are_independent() {
        let transport = SimulatedTransport::new();
        let (first, mut first_rx) = transport.connect("clsp-a", KEEP_ALIVE).await.unwrap();
        let (_second, _second_rx) = transport.connect("clsp-b", KEEP_ALIVE).await.unwrap();
        assert_eq!(transport.connection_count(), 2);

        first.subscribe("some/topic").await.unwrap();
        transport.push_message("some/topic", Bytes::from_static(b"payload"));
        assert!(matches!(
            first_rx.recv().await,
            Some(TransportEvent::Message(_))
        ));

        first.disconnect().await;
        assert_eq!(transport.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_emits_disconnect() {
        let transport = SimulatedTransport::new();
        let (_connection, mut rx) = transport.connect("clsp-test", KEEP_ALIVE).await.unwrap();
        transport.drop_connection("broker restart");
        match rx.recv().await.unwrap() {
            TransportEvent::Disconnected { reason } => assert_eq!(reason, "broker restart"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!transport.is_connected());
    }
}
