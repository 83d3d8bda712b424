//! MQTT conduit: stream negotiation and ordered payload delivery.
//!
//! One conduit owns one MQTT-over-WebSocket connection. It generates a
//! fresh client id on every connect, negotiates a per-session stream guid,
//! subscribes to the guid-derived topics, and delivers inbound payloads in
//! FIFO order. Malformed payloads are logged and dropped; they never kill
//! the conduit.

pub mod simulation;
pub mod topics;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use self::topics::{PLAY_REQUEST_TOPIC, StreamTopics, response_topic};
use self::transport::{
    InboundMessage, MqttConnection, MqttTransport, TransportError, TransportEvent, TransportResult,
};
use crate::config::TransportConfig;
use crate::lifecycle::Lifecycle;
use crate::stream_config::StreamConfiguration;

/// Events a conduit delivers to its player, in arrival order.
#[derive(Debug, Clone)]
pub enum ConduitEvent {
    /// The connection is established and the play handshake is in flight
    Connected,
    /// The connection was lost
    Disconnected,
    /// The stream's init segment arrived
    InitSegment {
        /// The MP4 initialization data
        data: Bytes,
        /// Negotiated MIME type and codec string
        mime_codec: String,
    },
    /// One media segment arrived
    MediaSegment {
        /// The opaque fMP4 fragment
        data: Bytes,
        /// Seconds since the previous media segment arrived, zero for the
        /// first
        duration_secs: f64,
    },
    /// The connection dropped; emitted exactly once per connection
    ReconnectNeeded {
        /// Description of why reconnection is needed
        reason: String,
    },
    /// The transport's host element was removed out-of-band
    IframeDestroyedExternally,
}

/// Counters describing conduit activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConduitStats {
    /// Inbound segments delivered (init and media)
    pub segments_received: u64,
    /// Inbound payload bytes delivered
    pub bytes_received: u64,
    /// Inbound payloads dropped as malformed
    pub malformed_dropped: u64,
    /// Resync requests published
    pub resync_requests: u64,
}

#[derive(Default)]
struct StatsCells {
    segments_received: AtomicU64,
    bytes_received: AtomicU64,
    malformed_dropped: AtomicU64,
    resync_requests: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> ConduitStats {
        ConduitStats {
            segments_received: self.segments_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            resync_requests: self.resync_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayRequest<'a> {
    client_id: &'a str,
    stream_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayResponse {
    guid: String,
    mime_codec: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest<'a> {
    client_id: &'a str,
}

/// Returns true when `payload` starts with a plausible fMP4 box.
fn looks_like_fmp4(payload: &[u8]) -> bool {
    if payload.len() < 8 {
        return false;
    }
    matches!(
        &payload[4..8],
        b"ftyp" | b"styp" | b"moov" | b"moof" | b"sidx"
    )
}

/// One MQTT conduit between a player and an SFS.
pub struct Conduit {
    transport: Arc<dyn MqttTransport>,
    config: TransportConfig,
    stream: StreamConfiguration,
    client_id: Mutex<Option<String>>,
    connection: Mutex<Option<Arc<dyn MqttConnection>>>,
    topics: Arc<Mutex<Option<StreamTopics>>>,
    subscribed: Arc<Mutex<Vec<String>>>,
    stats: Arc<StatsCells>,
    lifecycle: Lifecycle,
}

impl Conduit {
    /// Creates a conduit for `stream` over `transport`.
    pub fn new(
        transport: Arc<dyn MqttTransport>,
        config: TransportConfig,
        stream: StreamConfiguration,
    ) -> Self {
        Self {
            transport,
            config,
            stream,
            client_id: Mutex::new(None),
            connection: Mutex::new(None),
            topics: Arc::new(Mutex::new(None)),
            subscribed: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(StatsCells::default()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Connects, publishes the play request, and returns the ordered event
    /// stream.
    ///
    /// # Errors
    ///
    /// - `TransportError::AlreadyDestroyed` - The conduit was destroyed
    /// - `TransportError::ConnectionFailed` - The broker was unreachable or
    ///   the connect timed out
    /// - `TransportError::SubscribeFailed` - The response topic subscription
    ///   was rejected
    /// - `TransportError::PublishFailed` - The play request was rejected
    pub async fn start(&self) -> TransportResult<mpsc::UnboundedReceiver<ConduitEvent>> {
        if !self.lifecycle.is_active() {
            return Err(TransportError::AlreadyDestroyed);
        }

        // A fresh client id every connect keeps response topics
        // collision-free across reconnects of the same stream.
        let client_id = format!("{}{}", self.config.client_id_prefix, Uuid::new_v4());
        let (connection, transport_rx) = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.connect(&client_id, self.config.keep_alive),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed {
            reason: format!("connect timed out after {:?}", self.config.connect_timeout),
        })??;

        let reply_topic = response_topic(&client_id);
        connection.subscribe(&reply_topic).await?;
        self.record_subscription(&reply_topic);

        let request = PlayRequest {
            client_id: &client_id,
            stream_name: self.stream.stream_name(),
            token: self.stream.token(),
        };
        let body = serde_json::to_vec(&request).map_err(|e| TransportError::PublishFailed {
            topic: PLAY_REQUEST_TOPIC.to_string(),
            reason: e.to_string(),
        })?;
        connection.publish(PLAY_REQUEST_TOPIC, Bytes::from(body)).await?;

        *self.client_id.lock().unwrap_or_else(|p| p.into_inner()) = Some(client_id);
        *self.connection.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(Arc::clone(&connection));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(ConduitEvent::Connected);

        tokio::spawn(translate_inbound(TranslateContext {
            connection,
            reply_topic,
            topics: Arc::clone(&self.topics),
            subscribed: Arc::clone(&self.subscribed),
            stats: Arc::clone(&self.stats),
            transport_rx,
            event_tx,
        }));

        Ok(event_rx)
    }

    /// Publishes a resync request for the negotiated stream.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotConnected` - The stream is not negotiated yet
    /// - `TransportError::PublishFailed` - The broker rejected the publish
    pub async fn request_resync(&self) -> TransportResult<()> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let topic = {
            let topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
            topics
                .as_ref()
                .map(|t| t.resync.clone())
                .ok_or(TransportError::NotConnected)?
        };
        self.stats.resync_requests.fetch_add(1, Ordering::Relaxed);
        debug!("Requesting stream resync on {}", topic);
        connection.publish(&topic, Bytes::new()).await
    }

    /// Publishes the stop request, unsubscribes every topic, and
    /// disconnects. Failures are logged; teardown always completes.
    pub async fn stop(&self) {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(connection) = connection else {
            return;
        };
        let client_id = self
            .client_id
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let stop_topic = {
            let topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
            topics.as_ref().map(|t| t.stop.clone())
        };

        if let (Some(client_id), Some(stop_topic)) = (client_id, stop_topic) {
            let request = StopRequest {
                client_id: &client_id,
            };
            match serde_json::to_vec(&request) {
                Ok(body) => {
                    if let Err(e) = connection.publish(&stop_topic, Bytes::from(body)).await {
                        warn!("Stop publish failed: {}", e);
                    }
                }
                Err(e) => warn!("Stop request serialization failed: {}", e),
            }
        }

        let subscribed: Vec<String> = self
            .subscribed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for topic in subscribed {
            if let Err(e) = connection.unsubscribe(&topic).await {
                debug!("Unsubscribe from {} failed: {}", topic, e);
            }
        }

        connection.disconnect().await;
    }

    /// Stops the conduit and marks it destroyed. Idempotent.
    pub async fn destroy(&self) {
        if !self.lifecycle.begin_destroy() {
            self.lifecycle.wait_destroy_complete().await;
            return;
        }
        self.stop().await;
        self.lifecycle.finish_destroy();
    }

    /// Returns a snapshot of the conduit's activity counters.
    pub fn stats(&self) -> ConduitStats {
        self.stats.snapshot()
    }

    /// Returns the stream this conduit was built for.
    pub fn stream(&self) -> &StreamConfiguration {
        &self.stream
    }

    fn record_subscription(&self, topic: &str) {
        self.subscribed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(topic.to_string());
    }
}

struct TranslateContext {
    connection: Arc<dyn MqttConnection>,
    reply_topic: String,
    topics: Arc<Mutex<Option<StreamTopics>>>,
    subscribed: Arc<Mutex<Vec<String>>>,
    stats: Arc<StatsCells>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    event_tx: mpsc::UnboundedSender<ConduitEvent>,
}

/// Translates raw transport events into ordered conduit events.
async fn translate_inbound(mut ctx: TranslateContext) {
    let mut mime_codec: Option<String> = None;
    let mut media_topic: Option<String> = None;
    let mut init_delivered = false;
    let mut last_media_at: Option<Instant> = None;

    while let Some(event) = ctx.transport_rx.recv().await {
        match event {
            TransportEvent::Disconnected { reason } => {
                debug!("Transport disconnected: {}", reason);
                let _ = ctx.event_tx.send(ConduitEvent::Disconnected);
                let _ = ctx.event_tx.send(ConduitEvent::ReconnectNeeded { reason });
                break;
            }
            TransportEvent::HostDetached => {
                warn!("Transport host element removed out-of-band");
                let _ = ctx.event_tx.send(ConduitEvent::IframeDestroyedExternally);
                break;
            }
            TransportEvent::Message(msg) => {
                if msg.topic == ctx.reply_topic {
                    if media_topic.is_some() {
                        continue;
                    }
                    match handle_play_response(&mut ctx, &msg).await {
                        Ok(Some(response)) => {
                            media_topic = Some(StreamTopics::for_guid(&response.guid).media);
                            mime_codec = Some(response.mime_codec);
                        }
                        // Malformed response: dropped, keep waiting.
                        Ok(None) => {}
                        Err(reason) => {
                            let _ = ctx.event_tx.send(ConduitEvent::ReconnectNeeded { reason });
                            break;
                        }
                    }
                } else if media_topic.as_deref() == Some(msg.topic.as_str()) {
                    if !looks_like_fmp4(&msg.payload) {
                        ctx.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Dropping malformed payload on {} ({} bytes)",
                            msg.topic,
                            msg.payload.len()
                        );
                        continue;
                    }

                    ctx.stats.segments_received.fetch_add(1, Ordering::Relaxed);
                    ctx.stats
                        .bytes_received
                        .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);

                    if init_delivered {
                        let duration_secs = last_media_at
                            .map(|at| at.elapsed().as_secs_f64())
                            .unwrap_or(0.0);
                        last_media_at = Some(Instant::now());
                        if ctx
                            .event_tx
                            .send(ConduitEvent::MediaSegment {
                                data: msg.payload,
                                duration_secs,
                            })
                            .is_err()
                        {
                            break;
                        }
                    } else {
                        init_delivered = true;
                        last_media_at = Some(Instant::now());
                        let codec = mime_codec.clone().unwrap_or_default();
                        if ctx
                            .event_tx
                            .send(ConduitEvent::InitSegment {
                                data: msg.payload,
                                mime_codec: codec,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                } else {
                    debug!("Ignoring message on unexpected topic {}", msg.topic);
                }
            }
        }
    }
}

/// Parses a play response and subscribes to the guid-derived topics.
///
/// A malformed response is dropped (`Ok(None)`); a failed stream-topic
/// subscription is fatal for the connection (`Err`).
async fn handle_play_response(
    ctx: &mut TranslateContext,
    msg: &InboundMessage,
) -> Result<Option<PlayResponse>, String> {
    let response: PlayResponse = match serde_json::from_slice(&msg.payload) {
        Ok(response) => response,
        Err(e) => {
            ctx.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping malformed play response: {}", e);
            return Ok(None);
        }
    };

    let stream_topics = StreamTopics::for_guid(&response.guid);
    for topic in [&stream_topics.media, &stream_topics.resync] {
        ctx.connection
            .subscribe(topic)
            .await
            .map_err(|e| format!("subscribe to {topic} failed: {e}"))?;
        ctx.subscribed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(topic.clone());
    }
    *ctx.topics.lock().unwrap_or_else(|p| p.into_inner()) = Some(stream_topics);

    debug!(
        "Stream negotiated: guid={} mime_codec={}",
        response.guid, response.mime_codec
    );
    Ok(Some(response))
}

#[cfg(test)]
mod tests {
    use super::simulation::{SIMULATED_MIME_CODEC, SimulatedTransport};
    use super::*;

    fn test_stream() -> StreamConfiguration {
        StreamConfiguration::from_url("clsp://sfs.example.com/lobby").unwrap()
    }

    async fn drain_until_init(
        rx: &mut mpsc::UnboundedReceiver<ConduitEvent>,
    ) -> Option<(Bytes, String)> {
        while let Some(event) = rx.recv().await {
            if let ConduitEvent::InitSegment { data, mime_codec } = event {
                return Some((data, mime_codec));
            }
        }
        None
    }

    fn play_client_ids(transport: &SimulatedTransport) -> Vec<String> {
        transport
            .published()
            .iter()
            .filter(|(topic, _)| topic == PLAY_REQUEST_TOPIC)
            .map(|(_, payload)| {
                let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
                value["clientId"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_start_negotiates_and_delivers_init_then_media() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_auto_media_segments(2);
        let conduit = Conduit::new(transport.clone(), TransportConfig::default(), test_stream());

        let mut rx = conduit.start().await.unwrap();

        assert!(matches!(rx.recv().await, Some(ConduitEvent::Connected)));
        let (data, mime_codec) = drain_until_init(&mut rx).await.unwrap();
        assert_eq!(data, simulation::fmp4_init_stub());
        assert_eq!(mime_codec, SIMULATED_MIME_CODEC);

        for _ in 0..2 {
            assert!(matches!(
                rx.recv().await,
                Some(ConduitEvent::MediaSegment { .. })
            ));
        }
        assert_eq!(conduit.stats().segments_received, 3);
    }

    #[tokio::test]
    async fn test_fresh_client_id_every_connect() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_auto_media_segments(0);

        let conduit = Conduit::new(transport.clone(), TransportConfig::default(), test_stream());
        let _rx = conduit.start().await.unwrap();
        conduit.stop().await;
        let _rx = conduit.start().await.unwrap();

        let ids = play_client_ids(&transport);
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_malformed_media_is_dropped_not_fatal() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_auto_media_segments(0);
        let conduit = Conduit::new(transport.clone(), TransportConfig::default(), test_stream());

        let mut rx = conduit.start().await.unwrap();
        let _ = drain_until_init(&mut rx).await.unwrap();

        transport.push_malformed_media();
        transport.push_media_segments(1);

        assert!(matches!(
            rx.recv().await,
            Some(ConduitEvent::MediaSegment { .. })
        ));
        assert_eq!(conduit.stats().malformed_dropped, 1);
    }

    #[tokio::test]
    async fn test_disconnect_emits_reconnect_needed_once() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_auto_media_segments(0);
        let conduit = Conduit::new(transport.clone(), TransportConfig::default(), test_stream());

        let mut rx = conduit.start().await.unwrap();
        let _ = drain_until_init(&mut rx).await.unwrap();
        transport.drop_connection("broker restart");

        let mut reconnects = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, ConduitEvent::ReconnectNeeded { .. }) {
                reconnects += 1;
            }
        }
        assert_eq!(reconnects, 1);
    }

    #[tokio::test]
    async fn test_stop_unsubscribes_everything() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_auto_media_segments(0);
        let conduit = Conduit::new(transport.clone(), TransportConfig::default(), test_stream());

        let mut rx = conduit.start().await.unwrap();
        let _ = drain_until_init(&mut rx).await.unwrap();
        assert!(!transport.subscriptions().is_empty());

        conduit.stop().await;
        assert!(transport.subscriptions().is_empty());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_resync_publishes_on_negotiated_topic() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_auto_media_segments(0);
        let conduit = Conduit::new(transport.clone(), TransportConfig::default(), test_stream());

        let mut rx = conduit.start().await.unwrap();
        let _ = drain_until_init(&mut rx).await.unwrap();

        conduit.request_resync().await.unwrap();
        assert_eq!(conduit.stats().resync_requests, 1);

        let guid = transport.negotiated_guid().unwrap();
        let resync_topic = StreamTopics::for_guid(&guid).resync;
        assert!(
            transport
                .published()
                .iter()
                .any(|(topic, _)| *topic == resync_topic)
        );
    }

    #[tokio::test]
    async fn test_start_after_destroy_fails() {
        let transport = Arc::new(SimulatedTransport::new());
        let conduit = Conduit::new(transport, TransportConfig::default(), test_stream());
        conduit.destroy().await;
        assert!(matches!(
            conduit.start().await,
            Err(TransportError::AlreadyDestroyed)
        ));
    }
}
