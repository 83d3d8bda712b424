//! CLSP Player Core - session lifecycle and transport for CLSP streams

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! This crate provides the core of a streaming video client for CLSP
//! (CLear Stream Protocol): fragmented MP4 tunneled over MQTT carried on
//! WebSockets. It manages session lifecycles, player handoff on source
//! changes, the MQTT conduit that negotiates per-stream topics, and the
//! bounded buffer feeder that appends segments to a media surface.
//!
//! The rendering surface, the MQTT-over-WebSocket transport, and the host
//! document are external collaborators expressed as traits; simulation
//! implementations are provided for tests and development.

pub mod conduit;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod media;
pub mod player;
pub mod registry;
pub mod session;
pub mod stream_config;

pub use conduit::transport::{MqttConnection, MqttTransport, TransportError};
// Re-export main types for convenient access
pub use conduit::{Conduit, ConduitEvent, ConduitStats};
pub use config::ClspConfig;
pub use events::{EventBus, EventError, SessionEvent};
pub use media::{MediaBuffer, SurfaceHost, SurfaceResolver, VideoSurface};
pub use player::{Player, PlayerError, PlayerId, PlayerState};
pub use registry::{IovRegistry, RegistryError, RegistryEvent, SessionId};
pub use session::{ChangeSrcTarget, IovSession, SessionError, SurfaceConfig};
pub use stream_config::{StreamConfiguration, StreamConfigurationError};

/// Core errors that can bubble up from any subsystem of the player.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum ClspError {
    /// Stream URL parsing or validation errors
    #[error("Stream configuration error: {0}")]
    StreamConfiguration(#[from] StreamConfigurationError),

    /// Event bus errors (unknown event names, missing handlers)
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// MQTT transport errors (connect, subscribe, publish failures)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Media buffer errors (append, quota, eviction failures)
    #[error("Buffer error: {0}")]
    Buffer(#[from] media::BufferError),

    /// Rendering surface errors (creation, fullscreen, detachment)
    #[error("Surface error: {0}")]
    Surface(#[from] media::SurfaceError),

    /// Player state machine errors
    #[error("Player error: {0}")]
    Player(#[from] PlayerError),

    /// Session lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Convenience Result type using ClspError as the error type
pub type Result<T> = std::result::Result<T, ClspError>;
