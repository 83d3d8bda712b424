//! Player: one conduit and one media buffer bound to a video surface.
//!
//! A player is created for exactly one play flow. Its driver task consumes
//! conduit events in order, feeds segments through the bounded feeder, and
//! reports progress over a broadcast channel. Players are never restarted;
//! a source change creates a fresh player and the collection retires the
//! old one after handoff.

pub mod collection;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::conduit::transport::TransportError;
use crate::conduit::{Conduit, ConduitEvent};
use crate::config::PlaybackConfig;
use crate::lifecycle::Lifecycle;
use crate::media::feeder::{EnqueueOutcome, FeederError, SegmentFeeder};
use crate::media::{MediaBuffer, SurfaceError, VideoSurface};

// One allocator for the whole process: player ids stay unambiguous when
// events from several sessions' players meet in one place.
static NEXT_PLAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one player, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u64);

impl PlayerId {
    /// Allocates the next process-unique player id.
    pub fn next() -> Self {
        PlayerId(NEXT_PLAYER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player-{}", self.0)
    }
}

/// Player state machine.
///
/// `Created → Connecting → Subscribed → ReceivingInit → Streaming`, with
/// `Stalled`, `Stopping`, and `Dead` as the off-ramps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Constructed, play not yet requested
    Created,
    /// Conduit connect in flight
    Connecting,
    /// Connected and subscribed, waiting for the first inbound payload
    Subscribed,
    /// Init segment received, media source attaching
    ReceivingInit,
    /// Media segments flowing to the buffer
    Streaming,
    /// The buffer rejected appends beyond recovery; awaiting replacement
    Stalled,
    /// Stop requested, teardown in progress
    Stopping,
    /// Terminal state
    Dead,
}

impl PlayerState {
    /// Returns true when play may be requested from this state.
    pub fn can_play(self) -> bool {
        matches!(self, PlayerState::Created)
    }

    /// Returns true for states that accept no further media.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlayerState::Stalled | PlayerState::Stopping | PlayerState::Dead
        )
    }
}

/// Events a player broadcasts to its collection and session.
///
/// Every variant carries the player id; consumers correlate on it because
/// events from retired players keep arriving during handoff.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// The surface rendered its first frame for this player; emitted at
    /// most once per player
    FirstFrameShown {
        /// The player that rendered the frame
        player_id: PlayerId,
    },
    /// Media was appended to the buffer
    VideoReceived {
        /// The appending player
        player_id: PlayerId,
        /// Appended payload size in bytes
        byte_len: usize,
    },
    /// Codec and dimensions became known
    VideoInfoReceived {
        /// The reporting player
        player_id: PlayerId,
        /// Negotiated MIME type and codec string
        mime_codec: String,
        /// Surface width in pixels, zero when unknown
        width: u32,
        /// Surface height in pixels, zero when unknown
        height: u32,
    },
    /// The surface or transport host was removed out-of-band
    IframeDestroyedExternally {
        /// The affected player
        player_id: PlayerId,
    },
    /// The media buffer could not recover and needs reinitialization
    ReinitializeError {
        /// The affected player
        player_id: PlayerId,
        /// Description of the unrecoverable condition
        reason: String,
    },
    /// The player exhausted its retry budget
    RetryError {
        /// The affected player
        player_id: PlayerId,
        /// Description of the exhausted condition
        reason: String,
    },
    /// The player's driver task ended; no further events will follow
    Terminated {
        /// The terminated player
        player_id: PlayerId,
    },
}

impl PlayerEvent {
    /// Returns the id of the player this event belongs to.
    pub fn player_id(&self) -> PlayerId {
        match self {
            PlayerEvent::FirstFrameShown { player_id }
            | PlayerEvent::VideoReceived { player_id, .. }
            | PlayerEvent::VideoInfoReceived { player_id, .. }
            | PlayerEvent::IframeDestroyedExternally { player_id }
            | PlayerEvent::ReinitializeError { player_id, .. }
            | PlayerEvent::RetryError { player_id, .. }
            | PlayerEvent::Terminated { player_id } => *player_id,
        }
    }
}

/// Errors reported by player operations.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// The player was already destroyed
    #[error("Player already destroyed")]
    AlreadyDestroyed,

    /// The operation is not valid in the player's current state
    #[error("Operation invalid in state {state:?}")]
    InvalidState {
        /// The state the player was in
        state: PlayerState,
    },

    /// The conduit could not start
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The surface rejected the media source
    #[error("Surface error: {0}")]
    Surface(#[from] SurfaceError),
}

/// One player: a conduit, a feeder, and a leased video surface.
pub struct Player {
    id: PlayerId,
    surface: Arc<dyn VideoSurface>,
    conduit: Arc<Conduit>,
    config: PlaybackConfig,
    state: Arc<RwLock<PlayerState>>,
    events: broadcast::Sender<PlayerEvent>,
    buffer: Arc<Mutex<Option<Arc<dyn MediaBuffer>>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    first_frame_emitted: Arc<AtomicBool>,
    lifecycle: Lifecycle,
}

impl Player {
    /// Creates a player leasing `surface`, ready for one play flow.
    pub fn new(
        id: PlayerId,
        surface: Arc<dyn VideoSurface>,
        conduit: Conduit,
        config: PlaybackConfig,
        events: broadcast::Sender<PlayerEvent>,
    ) -> Self {
        Self {
            id,
            surface,
            conduit: Arc::new(conduit),
            config,
            state: Arc::new(RwLock::new(PlayerState::Created)),
            events,
            buffer: Arc::new(Mutex::new(None)),
            shutdown_tx: Mutex::new(None),
            first_frame_emitted: Arc::new(AtomicBool::new(false)),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Returns this player's id.
    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// Returns the current state.
    pub fn state(&self) -> PlayerState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Connects the conduit and spawns the driver task.
    ///
    /// Returns as soon as the play request is published; the first frame is
    /// reported later through the event channel.
    ///
    /// # Errors
    ///
    /// - `PlayerError::AlreadyDestroyed` - The player was destroyed
    /// - `PlayerError::InvalidState` - Play was already requested
    /// - `PlayerError::Transport` - The conduit could not connect or publish
    pub async fn play(&self) -> Result<(), PlayerError> {
        if !self.lifecycle.is_active() {
            return Err(PlayerError::AlreadyDestroyed);
        }
        {
            let state = self.state();
            if !state.can_play() {
                return Err(PlayerError::InvalidState { state });
            }
        }

        self.set_state(PlayerState::Connecting);
        let conduit_rx = match self.conduit.start().await {
            Ok(rx) => rx,
            Err(e) => {
                self.set_state(PlayerState::Dead);
                let _ = self.events.send(PlayerEvent::Terminated { player_id: self.id });
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(shutdown_tx);

        tokio::spawn(run_driver(DriverContext {
            id: self.id,
            surface: Arc::clone(&self.surface),
            conduit: Arc::clone(&self.conduit),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            buffer: Arc::clone(&self.buffer),
            first_frame_emitted: Arc::clone(&self.first_frame_emitted),
            conduit_rx,
            shutdown_rx,
        }));

        Ok(())
    }

    /// Stops the play flow: publishes stop, disconnects, and releases the
    /// buffer.
    ///
    /// The surface itself is leased, not owned: clearing its source and
    /// detaching it stay with the session, which knows whether a newer
    /// player has already taken over the lease.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            if matches!(*state, PlayerState::Stopping | PlayerState::Dead) {
                return;
            }
            *state = PlayerState::Stopping;
        }
        debug!("{} stopping", self.id);

        if let Some(shutdown_tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            let _ = shutdown_tx.send(());
        }

        self.conduit.stop().await;

        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(buffer) = buffer {
            buffer.close().await;
        }

        self.set_state(PlayerState::Dead);
    }

    /// Stops and destroys the player. Idempotent.
    pub async fn destroy(&self) {
        if !self.lifecycle.begin_destroy() {
            self.lifecycle.wait_destroy_complete().await;
            return;
        }
        self.stop().await;
        self.conduit.destroy().await;
        self.lifecycle.finish_destroy();
    }

    fn set_state(&self, next: PlayerState) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if *state != next {
            debug!("{} state {:?} -> {:?}", self.id, *state, next);
            *state = next;
        }
    }
}

struct DriverContext {
    id: PlayerId,
    surface: Arc<dyn VideoSurface>,
    conduit: Arc<Conduit>,
    config: PlaybackConfig,
    state: Arc<RwLock<PlayerState>>,
    events: broadcast::Sender<PlayerEvent>,
    buffer: Arc<Mutex<Option<Arc<dyn MediaBuffer>>>>,
    first_frame_emitted: Arc<AtomicBool>,
    conduit_rx: mpsc::UnboundedReceiver<ConduitEvent>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl DriverContext {
    fn state(&self) -> PlayerState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: PlayerState) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if *state != next {
            debug!("{} state {:?} -> {:?}", self.id, *state, next);
            *state = next;
        }
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }
}

/// Awaits a change on the player's own frame counter, or forever while no
/// media source is attached yet.
async fn frames_changed(
    frames_rx: &mut Option<watch::Receiver<u64>>,
) -> Result<(), watch::error::RecvError> {
    match frames_rx {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}

/// The player's single owner task: consumes conduit events in order and
/// watches its media source for rendered frames and the surface for
/// detachment.
#[allow(clippy::too_many_lines)]
async fn run_driver(mut ctx: DriverContext) {
    let mut feeder: Option<SegmentFeeder> = None;
    let mut frames_rx: Option<watch::Receiver<u64>> = None;
    let mut attachment = ctx.surface.attachment();

    loop {
        tokio::select! {
            _ = &mut ctx.shutdown_rx => {
                break;
            }

            changed = frames_changed(&mut frames_rx) => {
                if changed.is_err() {
                    // The buffer is gone; frames can no longer arrive.
                    frames_rx = None;
                    continue;
                }
                let rendered = frames_rx
                    .as_mut()
                    .map(|rx| *rx.borrow_and_update())
                    .unwrap_or(0);
                if rendered > 0
                    && ctx.state() == PlayerState::Streaming
                    && !ctx.first_frame_emitted.swap(true, Ordering::SeqCst)
                {
                    debug!("{} first frame shown", ctx.id);
                    ctx.emit(PlayerEvent::FirstFrameShown { player_id: ctx.id });
                }
            }

            changed = attachment.changed() => {
                let detached = changed.is_err() || !*attachment.borrow_and_update();
                if detached {
                    warn!("{} surface removed from document", ctx.id);
                    ctx.emit(PlayerEvent::IframeDestroyedExternally { player_id: ctx.id });
                    break;
                }
            }

            event = ctx.conduit_rx.recv() => {
                let Some(event) = event else { break };
                if !handle_conduit_event(&mut ctx, &mut feeder, &mut frames_rx, event).await {
                    break;
                }
            }
        }
    }

    if let Some(mut feeder) = feeder.take() {
        feeder.close().await;
    }

    // A stall is observable until the supervising layer replaces the
    // session; everything else collapses to Dead.
    if ctx.state() != PlayerState::Stalled {
        ctx.set_state(PlayerState::Dead);
    }
    ctx.emit(PlayerEvent::Terminated { player_id: ctx.id });
    debug!("{} driver stopped", ctx.id);
}

/// Applies one conduit event. Returns false when the driver must stop.
async fn handle_conduit_event(
    ctx: &mut DriverContext,
    feeder: &mut Option<SegmentFeeder>,
    frames_rx: &mut Option<watch::Receiver<u64>>,
    event: ConduitEvent,
) -> bool {
    match event {
        ConduitEvent::Connected => {
            ctx.set_state(PlayerState::Subscribed);
            true
        }

        ConduitEvent::Disconnected => {
            debug!("{} conduit disconnected", ctx.id);
            true
        }

        ConduitEvent::ReconnectNeeded { reason } => {
            if ctx.state() == PlayerState::Stopping {
                return false;
            }
            // Reconnection is delegated to the supervising registry, which
            // replaces the whole session.
            ctx.emit(PlayerEvent::RetryError {
                player_id: ctx.id,
                reason,
            });
            false
        }

        ConduitEvent::IframeDestroyedExternally => {
            ctx.emit(PlayerEvent::IframeDestroyedExternally { player_id: ctx.id });
            false
        }

        ConduitEvent::InitSegment { data, mime_codec } => {
            ctx.set_state(PlayerState::ReceivingInit);
            let buffer = match ctx.surface.attach_media_source(&mime_codec) {
                Ok(buffer) => buffer,
                Err(e) => {
                    warn!("{} media source attach failed: {}", ctx.id, e);
                    ctx.emit(PlayerEvent::ReinitializeError {
                        player_id: ctx.id,
                        reason: e.to_string(),
                    });
                    ctx.set_state(PlayerState::Stalled);
                    return false;
                }
            };
            *ctx.buffer.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&buffer));
            *frames_rx = Some(buffer.frames());

            let mut new_feeder = SegmentFeeder::new(buffer, &ctx.config);
            match new_feeder.append_init(data).await {
                Ok(()) => {
                    *feeder = Some(new_feeder);
                    ctx.set_state(PlayerState::Streaming);
                    let (width, height) = ctx.surface.dimensions().unwrap_or((0, 0));
                    ctx.emit(PlayerEvent::VideoInfoReceived {
                        player_id: ctx.id,
                        mime_codec,
                        width,
                        height,
                    });
                    true
                }
                Err(e) => {
                    report_feeder_error(ctx, e);
                    false
                }
            }
        }

        ConduitEvent::MediaSegment {
            data,
            duration_secs,
        } => {
            let Some(feeder) = feeder.as_mut() else {
                debug!("{} media segment before init, ignoring", ctx.id);
                return true;
            };

            if let EnqueueOutcome::OverrunDropped { dropped } =
                feeder.enqueue(data, duration_secs)
            {
                debug!("{} overran queue by {}, requesting resync", ctx.id, dropped);
                if let Err(e) = ctx.conduit.request_resync().await {
                    warn!("{} resync request failed: {}", ctx.id, e);
                }
            }

            match feeder.drain().await {
                Ok(0) => true,
                Ok(byte_len) => {
                    ctx.emit(PlayerEvent::VideoReceived {
                        player_id: ctx.id,
                        byte_len,
                    });
                    true
                }
                Err(e) => {
                    report_feeder_error(ctx, e);
                    false
                }
            }
        }
    }
}

fn report_feeder_error(ctx: &DriverContext, error: FeederError) {
    match error {
        FeederError::ReinitializeNeeded { reason } => {
            warn!("{} buffer needs reinitialization: {}", ctx.id, reason);
            ctx.set_state(PlayerState::Stalled);
            ctx.emit(PlayerEvent::ReinitializeError {
                player_id: ctx.id,
                reason,
            });
        }
        FeederError::RetriesExhausted { attempts } => {
            warn!("{} append retries exhausted after {}", ctx.id, attempts);
            ctx.emit(PlayerEvent::RetryError {
                player_id: ctx.id,
                reason: format!("append retries exhausted after {attempts} attempts"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::conduit::simulation::SimulatedTransport;
    use crate::config::TransportConfig;
    use crate::media::simulation::SimulatedSurface;
    use crate::stream_config::StreamConfiguration;

    fn test_stream() -> StreamConfiguration {
        StreamConfiguration::from_url("clsp://sfs.example.com/lobby").unwrap()
    }

    fn build_player(
        transport: &Arc<SimulatedTransport>,
        surface: &Arc<SimulatedSurface>,
    ) -> (Player, broadcast::Receiver<PlayerEvent>) {
        let (events_tx, events_rx) = broadcast::channel(64);
        let conduit = Conduit::new(
            Arc::clone(transport) as Arc<dyn crate::conduit::transport::MqttTransport>,
            TransportConfig::default(),
            test_stream(),
        );
        let player = Player::new(
            PlayerId(1),
            Arc::clone(surface) as Arc<dyn VideoSurface>,
            conduit,
            PlaybackConfig::default(),
            events_tx,
        );
        (player, events_rx)
    }

    async fn wait_for_event<F>(
        rx: &mut broadcast::Receiver<PlayerEvent>,
        mut predicate: F,
    ) -> PlayerEvent
    where
        F: FnMut(&PlayerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event channel closed before expected event")
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for player event")
    }

    #[tokio::test]
    async fn test_play_reaches_streaming_and_first_frame() {
        let transport = Arc::new(SimulatedTransport::new());
        let surface = Arc::new(SimulatedSurface::new());
        let (player, mut events) = build_player(&transport, &surface);

        player.play().await.unwrap();

        let event = wait_for_event(&mut events, |e| {
            matches!(e, PlayerEvent::FirstFrameShown { .. })
        })
        .await;
        assert_eq!(event.player_id(), PlayerId(1));
        assert_eq!(player.state(), PlayerState::Streaming);

        player.destroy().await;
    }

    #[tokio::test]
    async fn test_first_frame_emitted_only_once() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_auto_media_segments(5);
        let surface = Arc::new(SimulatedSurface::new());
        let (player, mut events) = build_player(&transport, &surface);

        player.play().await.unwrap();
        wait_for_event(&mut events, |e| {
            matches!(e, PlayerEvent::VideoReceived { .. })
        })
        .await;
        transport.push_media_segments(3);

        // Collect until the channel drains; exactly one first-frame event.
        let mut first_frames = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(PlayerEvent::FirstFrameShown { .. })) => first_frames += 1,
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert_eq!(first_frames, 1);

        player.destroy().await;
    }

    #[tokio::test]
    async fn test_play_twice_is_invalid() {
        let transport = Arc::new(SimulatedTransport::new());
        let surface = Arc::new(SimulatedSurface::new());
        let (player, _events) = build_player(&transport, &surface);

        player.play().await.unwrap();
        let result = player.play().await;
        assert!(matches!(result, Err(PlayerError::InvalidState { .. })));

        player.destroy().await;
    }

    #[tokio::test]
    async fn test_stop_releases_buffer_and_disconnects() {
        let transport = Arc::new(SimulatedTransport::new());
        let surface = Arc::new(SimulatedSurface::new());
        let (player, mut events) = build_player(&transport, &surface);

        player.play().await.unwrap();
        wait_for_event(&mut events, |e| {
            matches!(e, PlayerEvent::FirstFrameShown { .. })
        })
        .await;

        player.stop().await;
        assert_eq!(player.state(), PlayerState::Dead);
        assert!(surface.attached_buffer().unwrap().is_closed());
        assert!(!transport.is_connected());

        player.destroy().await;
    }

    #[tokio::test]
    async fn test_reconnect_needed_becomes_retry_error() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_auto_media_segments(0);
        let surface = Arc::new(SimulatedSurface::new());
        let (player, mut events) = build_player(&transport, &surface);

        player.play().await.unwrap();
        wait_for_event(&mut events, |e| {
            matches!(e, PlayerEvent::VideoInfoReceived { .. })
        })
        .await;

        transport.drop_connection("broker restart");
        let event = wait_for_event(&mut events, |e| {
            matches!(e, PlayerEvent::RetryError { .. })
        })
        .await;
        assert_eq!(event.player_id(), PlayerId(1));

        wait_for_event(&mut events, |e| matches!(e, PlayerEvent::Terminated { .. })).await;
        player.destroy().await;
    }

    #[tokio::test]
    async fn test_surface_detach_reports_iframe_destroyed() {
        let transport = Arc::new(SimulatedTransport::new());
        let surface = Arc::new(SimulatedSurface::new());
        let (player, mut events) = build_player(&transport, &surface);

        player.play().await.unwrap();
        wait_for_event(&mut events, |e| {
            matches!(e, PlayerEvent::FirstFrameShown { .. })
        })
        .await;

        surface.detach_from_document();
        wait_for_event(&mut events, |e| {
            matches!(e, PlayerEvent::IframeDestroyedExternally { .. })
        })
        .await;

        player.destroy().await;
    }

    #[tokio::test]
    async fn test_attach_failure_reports_reinitialize_error() {
        let transport = Arc::new(SimulatedTransport::new());
        let surface = Arc::new(SimulatedSurface::new());
        surface.fail_next_attach();
        let (player, mut events) = build_player(&transport, &surface);

        player.play().await.unwrap();
        wait_for_event(&mut events, |e| {
            matches!(e, PlayerEvent::ReinitializeError { .. })
        })
        .await;
        assert_eq!(player.state(), PlayerState::Stalled);

        player.destroy().await;
    }

    #[tokio::test]
    async fn test_quota_stall_reports_reinitialize_error() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_auto_media_segments(0);
        let surface = Arc::new(SimulatedSurface::new());
        let (player, mut events) = build_player(&transport, &surface);

        player.play().await.unwrap();
        wait_for_event(&mut events, |e| {
            matches!(e, PlayerEvent::VideoInfoReceived { .. })
        })
        .await;

        let buffer = surface.attached_buffer().unwrap();
        buffer.fail_next_appends_with_quota(2);
        transport.push_media_segments(1);

        wait_for_event(&mut events, |e| {
            matches!(e, PlayerEvent::ReinitializeError { .. })
        })
        .await;
        assert_eq!(player.state(), PlayerState::Stalled);

        player.destroy().await;
    }
}
