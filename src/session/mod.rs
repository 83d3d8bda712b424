//! IOV session: the user-facing handle for one rendering surface.
//!
//! A session owns one player collection, reacts to environment events
//! (document visibility, network connectivity), and exposes the play
//! surface API: `change_src`, `stop`, `restart`, and fullscreen control.
//! Fatal conditions are reported to the supervising registry, which
//! replaces the whole session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::conduit::transport::MqttTransport;
use crate::config::ClspConfig;
use crate::events::{EventBus, EventError, SESSION_EVENT_NAMES, SessionEvent, names};
use crate::lifecycle::Lifecycle;
use crate::media::{
    CONTAINER_CLASS, SURFACE_CLASS, SurfaceHost, SurfaceResolver, VideoSurface,
};
use crate::player::PlayerEvent;
use crate::player::collection::PlayerCollection;
use crate::registry::SessionId;
use crate::stream_config::{StreamConfiguration, StreamConfigurationError};

/// Errors reported by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `change_src` was called with an empty target
    #[error("Missing stream url")]
    MissingUrl,

    /// Neither a container nor a video surface could be established
    #[error("No rendering surface could be established")]
    NoSurface,

    /// The session was already destroyed
    #[error("Session already destroyed")]
    AlreadyDestroyed,

    /// The new player could not be created or never showed a frame
    #[error("Source change failed: {reason}")]
    ChangeSrcFailed {
        /// Description of the failure
        reason: String,
    },

    /// The host environment lacks a required capability
    #[error("Unsupported environment: {reason}")]
    UnsupportedEnvironment {
        /// The missing capability
        reason: String,
    },

    /// The stream URL could not be parsed
    #[error(transparent)]
    InvalidUrl(#[from] StreamConfigurationError),
}

/// Target of a `change_src` call: a URL to parse or an already-validated
/// configuration accepted verbatim.
#[derive(Debug, Clone)]
pub enum ChangeSrcTarget {
    /// A CLSP URL string
    Url(String),
    /// An already-validated configuration
    Config(StreamConfiguration),
}

impl From<&str> for ChangeSrcTarget {
    fn from(url: &str) -> Self {
        ChangeSrcTarget::Url(url.to_string())
    }
}

impl From<String> for ChangeSrcTarget {
    fn from(url: String) -> Self {
        ChangeSrcTarget::Url(url)
    }
}

impl From<StreamConfiguration> for ChangeSrcTarget {
    fn from(config: StreamConfiguration) -> Self {
        ChangeSrcTarget::Config(config)
    }
}

/// Surface wiring for a new session: any one of the four inputs.
///
/// Supplying a video element (by handle or id) marks the surface as
/// caller-owned; it survives session teardown.
#[derive(Clone, Default)]
pub struct SurfaceConfig {
    /// Container element id, resolved through the [`SurfaceResolver`]
    pub container_element_id: Option<String>,
    /// Container element handle
    pub container_element: Option<Arc<dyn SurfaceHost>>,
    /// Video element id, resolved through the [`SurfaceResolver`]
    pub video_element_id: Option<String>,
    /// Video element handle
    pub video_element: Option<Arc<dyn VideoSurface>>,
}

/// Fatal session condition reported to the supervising registry.
#[derive(Debug, Clone)]
pub struct FatalReport {
    /// The reporting session
    pub session_id: SessionId,
    /// Wire-level name of the triggering event
    pub event_name: &'static str,
}

#[derive(Default)]
struct SessionState {
    stream_configuration: Option<StreamConfiguration>,
    pending_change_src: Option<StreamConfiguration>,
    hidden: bool,
    // Bumped by every source change; a change whose generation is stale at
    // commit time has been superseded and must not resolve.
    change_src_generation: u64,
}

/// One IOV session: a rendering surface, a player collection, and the
/// environment handlers around them.
pub struct IovSession {
    id: SessionId,
    config: ClspConfig,
    bus: Arc<EventBus>,
    collection: PlayerCollection,
    surface_config: SurfaceConfig,
    container: Option<Arc<dyn SurfaceHost>>,
    surface: Arc<dyn VideoSurface>,
    retain_surface: bool,
    state: Mutex<SessionState>,
    is_stopping: AtomicBool,
    fatal_tx: mpsc::UnboundedSender<FatalReport>,
    shutdown: watch::Sender<bool>,
    lifecycle: Lifecycle,
}

impl IovSession {
    /// Creates a session, resolves and initializes its surfaces, and wires
    /// event forwarding.
    ///
    /// # Errors
    ///
    /// - `SessionError::NoSurface` - Neither a container nor a video
    ///   surface could be established
    pub fn new(
        id: SessionId,
        surface_config: SurfaceConfig,
        transport: Arc<dyn MqttTransport>,
        resolver: Arc<dyn SurfaceResolver>,
        config: ClspConfig,
        fatal_tx: mpsc::UnboundedSender<FatalReport>,
    ) -> Result<Arc<Self>, SessionError> {
        let (container, surface, retain_surface) =
            initialize_elements(&surface_config, resolver.as_ref())?;

        let collection = PlayerCollection::new(
            transport,
            config.playback.clone(),
            config.transport.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        let session = Arc::new(Self {
            id,
            bus: Arc::new(EventBus::new(SESSION_EVENT_NAMES)),
            collection,
            surface_config,
            container,
            surface,
            retain_surface,
            state: Mutex::new(SessionState::default()),
            is_stopping: AtomicBool::new(false),
            fatal_tx,
            shutdown,
            config,
            lifecycle: Lifecycle::new(),
        });
        Self::spawn_event_forwarder(&session);
        debug!("{} created", session.id);
        Ok(session)
    }

    /// Returns this session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the committed stream configuration, if any.
    pub async fn stream_configuration(&self) -> Option<StreamConfiguration> {
        self.state.lock().await.stream_configuration.clone()
    }

    /// Returns the target the session should resume with: an in-flight
    /// source change wins over the committed configuration.
    pub async fn last_target(&self) -> Option<StreamConfiguration> {
        let state = self.state.lock().await;
        state
            .pending_change_src
            .clone()
            .or_else(|| state.stream_configuration.clone())
    }

    /// Returns the surface wiring this session was created with.
    pub fn surface_config(&self) -> &SurfaceConfig {
        &self.surface_config
    }

    /// Returns true when the surface is caller-owned and must survive
    /// teardown.
    pub fn retains_surface(&self) -> bool {
        self.retain_surface
    }

    /// Returns true once destruction has begun.
    pub fn is_destroyed(&self) -> bool {
        self.lifecycle.is_destroyed()
    }

    /// Returns true once destruction has fully completed.
    pub fn is_destroy_complete(&self) -> bool {
        self.lifecycle.is_destroy_complete()
    }

    /// Returns how many players the session currently holds.
    pub async fn player_count(&self) -> usize {
        self.collection.player_count().await
    }

    /// Registers a listener on the session's event bus.
    ///
    /// # Errors
    ///
    /// - `EventError::UnknownEvent` - The name is outside the session's
    ///   declared event set
    pub fn on<F>(&self, name: &str, handler: F) -> Result<(), EventError>
    where
        F: Fn(&SessionEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.bus.on(name, handler)
    }

    /// Switches the session to a new stream source.
    ///
    /// When the document is hidden the target is committed without starting
    /// a player; playback begins on the next visibility restore. Otherwise
    /// the call resolves once the new player reports its first rendered
    /// frame; frames from prior players are ignored. A call superseded by a
    /// newer `change_src` is cancelled even when its own player renders
    /// first.
    ///
    /// # Errors
    ///
    /// - `SessionError::AlreadyDestroyed` - The session was destroyed
    /// - `SessionError::MissingUrl` - The target was empty
    /// - `SessionError::InvalidUrl` - The URL could not be parsed
    /// - `SessionError::ChangeSrcFailed` - Player creation failed, the
    ///   player died before its first frame, the wait timed out, or a newer
    ///   source change superseded this one
    pub async fn change_src(&self, target: impl Into<ChangeSrcTarget>) -> Result<(), SessionError> {
        if !self.lifecycle.is_active() {
            return Err(SessionError::AlreadyDestroyed);
        }

        let stream = match target.into() {
            ChangeSrcTarget::Url(url) if url.trim().is_empty() => {
                return Err(SessionError::MissingUrl);
            }
            ChangeSrcTarget::Url(url) => StreamConfiguration::from_url(&url)?,
            ChangeSrcTarget::Config(config) => config,
        };

        let generation = {
            let mut state = self.state.lock().await;
            state.change_src_generation += 1;
            if state.hidden {
                debug!(
                    "{} hidden, deferring {} until visible",
                    self.id,
                    stream.stream_name()
                );
                state.stream_configuration = Some(stream);
                state.pending_change_src = None;
                return Ok(());
            }
            state.pending_change_src = Some(stream.clone());
            state.change_src_generation
        };

        let mut events = self.collection.subscribe();
        let player_id = self
            .collection
            .create(Arc::clone(&self.surface), stream.clone())
            .await
            .map_err(|e| SessionError::ChangeSrcFailed {
                reason: e.to_string(),
            })?;

        self.await_first_frame(&mut events, player_id).await?;

        let mut state = self.state.lock().await;
        if state.change_src_generation != generation {
            debug!("{} source change for {} superseded", self.id, player_id);
            return Err(SessionError::ChangeSrcFailed {
                reason: "superseded by a newer source change".to_string(),
            });
        }
        state.stream_configuration = Some(stream);
        state.pending_change_src = None;
        debug!("{} source change complete for {}", self.id, player_id);
        Ok(())
    }

    /// Stops playback and releases every player.
    ///
    /// Idempotent: a stop while another stop is in flight returns success
    /// without a second teardown.
    ///
    /// # Errors
    ///
    /// - `SessionError::AlreadyDestroyed` - The session was destroyed
    pub async fn stop(&self) -> Result<(), SessionError> {
        if !self.lifecycle.is_active() {
            return Err(SessionError::AlreadyDestroyed);
        }
        self.stop_inner().await;
        Ok(())
    }

    /// Stops, then resumes the committed stream configuration.
    ///
    /// Stop failures are logged and swallowed; source-change failures
    /// propagate.
    ///
    /// # Errors
    ///
    /// - `SessionError::AlreadyDestroyed` - The session was destroyed
    /// - `SessionError::ChangeSrcFailed` - No configuration was committed,
    ///   or the resumed source change failed
    pub async fn restart(&self) -> Result<(), SessionError> {
        if let Err(e) = self.stop().await {
            warn!("{} stop during restart failed: {}", self.id, e);
        }

        let Some(stream) = self.stream_configuration().await else {
            warn!("{} restart requested with no stream configuration", self.id);
            self.bus.emit(&SessionEvent::NoStreamConfiguration);
            self.report_fatal(names::NO_STREAM_CONFIGURATION);
            return Err(SessionError::ChangeSrcFailed {
                reason: "no stream configuration committed".to_string(),
            });
        };

        self.change_src(ChangeSrcTarget::Config(stream)).await
    }

    /// Reacts to a document visibility change: hidden stops playback,
    /// visible restarts it. Failures are logged, never thrown.
    pub async fn on_visibility_change(&self, hidden: bool) {
        {
            let mut state = self.state.lock().await;
            state.hidden = hidden;
        }
        if hidden {
            debug!("{} document hidden, stopping", self.id);
            if let Err(e) = self.stop().await {
                warn!("{} stop on visibility change failed: {}", self.id, e);
            }
        } else {
            debug!("{} document visible, restarting", self.id);
            if let Err(e) = self.restart().await {
                warn!("{} restart on visibility change failed: {}", self.id, e);
            }
        }
    }

    /// Reacts to a connectivity change: offline stops playback, online
    /// restarts it after the configured grace delay. Failures are logged,
    /// never thrown.
    pub async fn on_connection_change(&self, online: bool) {
        if !online {
            debug!("{} connection lost, stopping", self.id);
            if let Err(e) = self.stop().await {
                warn!("{} stop on connection change failed: {}", self.id, e);
            }
            return;
        }

        // Browser online events precede actual network readiness.
        let delay = self.config.playback.connection_change_play_delay;
        debug!("{} connection restored, restarting in {:?}", self.id, delay);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return,
        }

        if let Err(e) = self.restart().await {
            warn!("{} restart on connection change failed: {}", self.id, e);
        }
    }

    /// Requests fullscreen presentation of the session's container.
    ///
    /// # Errors
    ///
    /// - `SessionError::UnsupportedEnvironment` - The session has no
    ///   container, or the host document denied the request
    pub fn enter_fullscreen(&self) -> Result<(), SessionError> {
        let container = self.container.as_ref().ok_or_else(|| {
            SessionError::UnsupportedEnvironment {
                reason: "fullscreen requires a container element".to_string(),
            }
        })?;
        container
            .request_fullscreen()
            .map_err(|e| SessionError::UnsupportedEnvironment {
                reason: e.to_string(),
            })
    }

    /// Exits fullscreen via the host document.
    pub fn exit_fullscreen(&self) {
        if let Some(container) = &self.container {
            container.exit_fullscreen();
        }
    }

    /// Toggles fullscreen presentation.
    ///
    /// # Errors
    ///
    /// - `SessionError::UnsupportedEnvironment` - The session has no
    ///   container, or the host document denied the request
    pub fn toggle_fullscreen(&self) -> Result<(), SessionError> {
        match &self.container {
            Some(container) if container.is_fullscreen() => {
                container.exit_fullscreen();
                Ok(())
            }
            _ => self.enter_fullscreen(),
        }
    }

    /// Destroys the session: stops playback, tears down the collection,
    /// uninitializes the surfaces, and drops every listener. Idempotent.
    pub async fn destroy(&self) {
        if !self.lifecycle.begin_destroy() {
            self.lifecycle.wait_destroy_complete().await;
            return;
        }
        debug!("{} destroying", self.id);
        let _ = self.shutdown.send(true);

        self.stop_inner().await;
        self.collection.destroy().await;
        self.uninitialize_elements();
        self.bus.remove_all_listeners();

        self.lifecycle.finish_destroy();
        debug!("{} destroyed", self.id);
    }

    async fn stop_inner(&self) {
        if self.is_stopping.swap(true, Ordering::SeqCst) {
            debug!("{} stop already in flight", self.id);
            return;
        }
        self.collection.remove_all().await;
        // Empty-source sentinel: releases the media-buffer references the
        // surface still holds.
        self.surface.clear_source();
        self.is_stopping.store(false, Ordering::SeqCst);
    }

    /// Releases the surfaces. The source is cleared before the surface is
    /// detached; reversing the order leaks buffer-backed memory.
    fn uninitialize_elements(&self) {
        self.surface.clear_source();
        self.surface.remove_class(SURFACE_CLASS);

        if let Some(container) = &self.container {
            if !self.retain_surface {
                container.remove_video_surface(&self.surface);
            }
            container.remove_class(CONTAINER_CLASS);
        }
    }

    async fn await_first_frame(
        &self,
        events: &mut broadcast::Receiver<PlayerEvent>,
        player_id: crate::player::PlayerId,
    ) -> Result<(), SessionError> {
        let timeout = self.config.playback.first_frame_timeout;
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(PlayerEvent::FirstFrameShown { player_id: id }) if id == player_id => {
                        return Ok(());
                    }
                    Ok(PlayerEvent::Terminated { player_id: id }) if id == player_id => {
                        return Err(SessionError::ChangeSrcFailed {
                            reason: format!("{id} terminated before first frame"),
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("{} lagged {} player events", self.id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SessionError::ChangeSrcFailed {
                            reason: "player event channel closed".to_string(),
                        });
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ChangeSrcFailed {
                reason: format!("no first frame within {timeout:?}"),
            }),
        }
    }

    fn report_fatal(&self, event_name: &'static str) {
        if self.fatal_tx.is_closed() {
            debug!("{} fatal report {} dropped, registry gone", self.id, event_name);
            return;
        }
        let _ = self.fatal_tx.send(FatalReport {
            session_id: self.id,
            event_name,
        });
    }

    fn emit_metric(&self, name: &str, value: f64) {
        if self.config.playback.enable_metrics {
            self.bus.emit(&SessionEvent::Metric {
                name: name.to_string(),
                value,
            });
        }
    }

    fn spawn_event_forwarder(session: &Arc<Self>) {
        let mut events = session.collection.subscribe();
        let mut shutdown_rx = session.shutdown.subscribe();
        let session = Arc::downgrade(session);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = events.recv() => {
                        let Some(session) = session.upgrade() else { break };
                        match event {
                            Ok(event) => session.forward_player_event(event),
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }

    fn forward_player_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::FirstFrameShown { player_id } => {
                self.bus.emit(&SessionEvent::FirstFrameShown { player_id });
                self.emit_metric("video.first_frame_shown", 1.0);
            }
            PlayerEvent::VideoReceived {
                player_id,
                byte_len,
            } => {
                self.bus.emit(&SessionEvent::VideoReceived {
                    player_id,
                    byte_len,
                });
                self.emit_metric("video.bytes.received", byte_len as f64);
            }
            PlayerEvent::VideoInfoReceived {
                mime_codec,
                width,
                height,
                ..
            } => {
                self.bus.emit(&SessionEvent::VideoInfoReceived {
                    mime_codec,
                    width,
                    height,
                });
            }
            PlayerEvent::IframeDestroyedExternally { .. } => {
                self.bus.emit(&SessionEvent::IframeDestroyedExternally);
                self.report_fatal(names::IFRAME_DESTROYED_EXTERNALLY);
            }
            PlayerEvent::ReinitializeError { reason, .. } => {
                self.bus
                    .emit(&SessionEvent::ReinitializeError { reason });
                self.report_fatal(names::REINITIALIZE_ERROR);
            }
            PlayerEvent::RetryError { reason, .. } => {
                self.bus.emit(&SessionEvent::RetryError { reason });
                self.report_fatal(names::RETRY_ERROR);
            }
            PlayerEvent::Terminated { .. } => {}
        }
    }
}

/// Resolves the surface wiring into `(container, surface, retain)`.
///
/// A caller-supplied video surface (handle or id) takes precedence and is
/// retained across teardown; otherwise a fresh surface is created inside
/// the container and owned by the session.
fn initialize_elements(
    surface_config: &SurfaceConfig,
    resolver: &dyn SurfaceResolver,
) -> Result<(Option<Arc<dyn SurfaceHost>>, Arc<dyn VideoSurface>, bool), SessionError> {
    let container = surface_config.container_element.clone().or_else(|| {
        surface_config
            .container_element_id
            .as_deref()
            .and_then(|id| resolver.container_by_id(id))
    });

    let supplied_video = surface_config.video_element.clone().or_else(|| {
        surface_config
            .video_element_id
            .as_deref()
            .and_then(|id| resolver.video_by_id(id))
    });

    let (surface, retain) = match supplied_video {
        Some(surface) => (surface, true),
        None => {
            let container = container.as_ref().ok_or(SessionError::NoSurface)?;
            let surface = container
                .create_video_surface()
                .map_err(|_| SessionError::NoSurface)?;
            (surface, false)
        }
    };

    if let Some(container) = &container {
        container.add_class(CONTAINER_CLASS);
    }
    surface.add_class(SURFACE_CLASS);
    surface.set_muted(true);
    surface.set_playsinline(true);

    Ok((container, surface, retain))
}
