//! MQTT-over-WebSocket transport contract.
//!
//! The actual MQTT client library is external to this crate. The conduit
//! drives it through these traits: [`MqttTransport`] is the library handle
//! sessions share, and every `connect` yields an [`MqttConnection`] owned
//! by exactly one conduit. The [`super::simulation`] module provides an
//! in-memory implementation that behaves like a small SFS broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Errors reported by the transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established
    #[error("Transport connection failed: {reason}")]
    ConnectionFailed {
        /// Description of the connection failure
        reason: String,
    },

    /// An operation required an established connection
    #[error("Transport not connected")]
    NotConnected,

    /// A topic subscription was rejected
    #[error("Subscribe to {topic} failed: {reason}")]
    SubscribeFailed {
        /// The topic that could not be subscribed
        topic: String,
        /// Description of the failure
        reason: String,
    },

    /// A publish was rejected
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed {
        /// The topic the publish targeted
        topic: String,
        /// Description of the failure
        reason: String,
    },

    /// The owning conduit has already been destroyed
    #[error("Conduit already destroyed")]
    AlreadyDestroyed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One inbound MQTT message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The topic the message arrived on
    pub topic: String,
    /// The opaque payload
    pub payload: Bytes,
}

/// Events delivered by an established transport connection.
///
/// Message order is the broker's delivery order; the conduit and player rely
/// on FIFO from this layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An inbound message on a subscribed topic
    Message(InboundMessage),
    /// The connection was lost without the client asking for it
    Disconnected {
        /// Description of why the connection dropped
        reason: String,
    },
    /// The element hosting the transport was removed from the document
    /// out-of-band
    HostDetached,
}

/// Handle to the MQTT-over-WebSocket client library.
///
/// Shared across a session's conduits; every `connect` creates an
/// independent client connection.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Establishes a connection under `client_id` with the given MQTT
    /// keep-alive interval.
    ///
    /// Returns the connection handle and its inbound event stream.
    ///
    /// # Errors
    ///
    /// - `TransportError::ConnectionFailed` - The broker was unreachable or
    ///   rejected the connection
    async fn connect(
        &self,
        client_id: &str,
        keep_alive: Duration,
    ) -> TransportResult<(
        Arc<dyn MqttConnection>,
        mpsc::UnboundedReceiver<TransportEvent>,
    )>;
}

/// One established MQTT connection, owned by exactly one conduit.
///
/// No two conduits share a connection.
#[async_trait]
pub trait MqttConnection: Send + Sync {
    /// Subscribes to `topic`. Returning `Ok` is the subscribe-ack.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotConnected` - The connection is gone
    /// - `TransportError::SubscribeFailed` - The broker rejected the
    ///   subscription
    async fn subscribe(&self, topic: &str) -> TransportResult<()>;

    /// Unsubscribes from `topic`.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotConnected` - The connection is gone
    async fn unsubscribe(&self, topic: &str) -> TransportResult<()>;

    /// Publishes `payload` to `topic`.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotConnected` - The connection is gone
    /// - `TransportError::PublishFailed` - The broker rejected the publish
    async fn publish(&self, topic: &str, payload: Bytes) -> TransportResult<()>;

    /// Closes the connection. Safe to call when already disconnected.
    ///
    /// A locally initiated disconnect must end the event stream without a
    /// [`TransportEvent::Disconnected`]; that event is reserved for drops
    /// the client did not ask for.
    async fn disconnect(&self);
}
