//! Whitelisted-name event bus and the session event sum type.
//!
//! Each stateful component declares the closed set of event names it can
//! emit. Registering a listener for a name outside that set is an error, not
//! a silent no-op. Delivery is registration order; a failing handler is
//! logged and the remaining handlers still run.

use std::sync::Mutex;

use tracing::warn;

use crate::player::PlayerId;

/// Errors produced by listener registration.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    /// The event name is not in the emitter's declared set
    #[error("Unknown event name: {name}")]
    UnknownEvent {
        /// The rejected event name
        name: String,
    },

    /// No handler was supplied for the subscription
    #[error("Missing handler for event: {name}")]
    MissingHandler {
        /// The event name the registration targeted
        name: String,
    },
}

/// Wire-level event names emitted by a session.
pub mod names {
    /// Periodic metric sample (only with metrics enabled)
    pub const METRIC: &str = "metric";
    /// A player rendered its first frame
    pub const FIRST_FRAME_SHOWN: &str = "firstFrameShown";
    /// A media segment was appended
    pub const VIDEO_RECEIVED: &str = "videoReceived";
    /// Codec and dimensions became known
    pub const VIDEO_INFO_RECEIVED: &str = "videoInfoReceived";
    /// The transport host element was removed out-of-band
    pub const IFRAME_DESTROYED_EXTERNALLY: &str = "iframeDestroyedExternally";
    /// The media buffer could not recover and needs reinitialization.
    /// The spelling matches the wire-level name existing SFS-side tooling
    /// consumes.
    pub const REINITIALIZE_ERROR: &str = "REINITIALZE_ERROR";
    /// A restart was requested with no stream configuration committed
    pub const NO_STREAM_CONFIGURATION: &str = "noStreamConfiguration";
    /// The player exhausted its append retries
    pub const RETRY_ERROR: &str = "RETRY_ERROR";
}

/// The closed set of event names a session may emit.
pub const SESSION_EVENT_NAMES: &[&str] = &[
    names::METRIC,
    names::FIRST_FRAME_SHOWN,
    names::VIDEO_RECEIVED,
    names::VIDEO_INFO_RECEIVED,
    names::IFRAME_DESTROYED_EXTERNALLY,
    names::REINITIALIZE_ERROR,
    names::NO_STREAM_CONFIGURATION,
    names::RETRY_ERROR,
];

/// Events observable on a session's bus.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Metric sample, emitted only when metrics are enabled
    Metric {
        /// Metric name, e.g. `video.segments.received`
        name: String,
        /// Sampled value
        value: f64,
    },
    /// A player rendered its first frame
    FirstFrameShown {
        /// The player that rendered the frame
        player_id: PlayerId,
    },
    /// A media segment was appended to the buffer
    VideoReceived {
        /// The player that appended the segment
        player_id: PlayerId,
        /// Appended payload size in bytes
        byte_len: usize,
    },
    /// Codec and surface dimensions became known
    VideoInfoReceived {
        /// MIME type and codec string from the stream negotiation
        mime_codec: String,
        /// Surface width in pixels, zero when unknown
        width: u32,
        /// Surface height in pixels, zero when unknown
        height: u32,
    },
    /// The transport host element was removed out-of-band
    IframeDestroyedExternally,
    /// The media buffer could not recover and needs reinitialization
    ReinitializeError {
        /// Description of the unrecoverable buffer condition
        reason: String,
    },
    /// A restart was requested with no stream configuration committed
    NoStreamConfiguration,
    /// The player exhausted its append retries
    RetryError {
        /// Description of the exhausted retry condition
        reason: String,
    },
}

impl SessionEvent {
    /// Returns the wire-level name this event is delivered under.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Metric { .. } => names::METRIC,
            SessionEvent::FirstFrameShown { .. } => names::FIRST_FRAME_SHOWN,
            SessionEvent::VideoReceived { .. } => names::VIDEO_RECEIVED,
            SessionEvent::VideoInfoReceived { .. } => names::VIDEO_INFO_RECEIVED,
            SessionEvent::IframeDestroyedExternally => names::IFRAME_DESTROYED_EXTERNALLY,
            SessionEvent::ReinitializeError { .. } => names::REINITIALIZE_ERROR,
            SessionEvent::NoStreamConfiguration => names::NO_STREAM_CONFIGURATION,
            SessionEvent::RetryError { .. } => names::RETRY_ERROR,
        }
    }
}

/// Boxed listener callback.
///
/// A handler returning an error does not abort delivery to later handlers;
/// the error is logged and delivery continues.
pub type EventHandler = Box<
    dyn Fn(&SessionEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
>;

/// Registration-ordered pub/sub over a closed set of event names.
pub struct EventBus {
    allowed: &'static [&'static str],
    handlers: Mutex<Vec<(String, EventHandler)>>,
}

impl EventBus {
    /// Creates a bus that accepts listeners only for `allowed` names.
    pub fn new(allowed: &'static [&'static str]) -> Self {
        Self {
            allowed,
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a listener through the object-safe path.
    ///
    /// # Errors
    ///
    /// - `EventError::UnknownEvent` - `name` is outside the declared set
    /// - `EventError::MissingHandler` - `handler` is `None`
    pub fn register(&self, name: &str, handler: Option<EventHandler>) -> Result<(), EventError> {
        if !self.allowed.contains(&name) {
            return Err(EventError::UnknownEvent {
                name: name.to_string(),
            });
        }
        let handler = handler.ok_or_else(|| EventError::MissingHandler {
            name: name.to_string(),
        })?;
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((name.to_string(), handler));
        Ok(())
    }

    /// Registers a listener for `name`.
    ///
    /// # Errors
    ///
    /// - `EventError::UnknownEvent` - `name` is outside the declared set
    pub fn on<F>(&self, name: &str, handler: F) -> Result<(), EventError>
    where
        F: Fn(&SessionEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Some(Box::new(handler)))
    }

    /// Delivers `event` to every listener registered for its name, in
    /// registration order. Handler failures are logged, never propagated.
    pub fn emit(&self, event: &SessionEvent) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (name, handler) in handlers.iter() {
            if name != event.name() {
                continue;
            }
            if let Err(e) = handler(event) {
                warn!("Event handler for {} failed: {}", name, e);
            }
        }
    }

    /// Drops every registered listener. Called exactly once, during the
    /// owning component's destruction.
    pub fn remove_all_listeners(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Returns how many listeners are currently registered.
    pub fn listener_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("allowed", &self.allowed)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_unknown_event_rejected() {
        let bus = EventBus::new(SESSION_EVENT_NAMES);
        let result = bus.on("nonsense", |_| Ok(()));
        assert_eq!(
            result,
            Err(EventError::UnknownEvent {
                name: "nonsense".to_string()
            })
        );
    }

    #[test]
    fn test_missing_handler_rejected() {
        let bus = EventBus::new(SESSION_EVENT_NAMES);
        let result = bus.register(names::METRIC, None);
        assert_eq!(
            result,
            Err(EventError::MissingHandler {
                name: names::METRIC.to_string()
            })
        );
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new(SESSION_EVENT_NAMES);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(names::IFRAME_DESTROYED_EXTERNALLY, move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            })
            .unwrap();
        }

        bus.emit(&SessionEvent::IframeDestroyedExternally);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_handler_does_not_abort_delivery() {
        let bus = EventBus::new(SESSION_EVENT_NAMES);
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.on(names::RETRY_ERROR, |_| Err("boom".into())).unwrap();
        {
            let delivered = Arc::clone(&delivered);
            bus.on(names::RETRY_ERROR, move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }

        bus.emit(&SessionEvent::RetryError {
            reason: "test".to_string(),
        });
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_all_listeners() {
        let bus = EventBus::new(SESSION_EVENT_NAMES);
        bus.on(names::METRIC, |_| Ok(())).unwrap();
        assert_eq!(bus.listener_count(), 1);
        bus.remove_all_listeners();
        assert_eq!(bus.listener_count(), 0);
    }
}
