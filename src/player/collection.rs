//! Player collection: serialized handoff between players on source change.
//!
//! `create` starts a new player without waiting for its first frame. When a
//! newer player reports `FirstFrameShown`, every older player is scheduled
//! for destruction after a configurable delay so the surface never goes
//! black between sources.

use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, warn};

use super::{Player, PlayerError, PlayerEvent, PlayerId};
use crate::conduit::Conduit;
use crate::conduit::transport::MqttTransport;
use crate::config::{PlaybackConfig, TransportConfig};
use crate::lifecycle::Lifecycle;
use crate::media::VideoSurface;
use crate::stream_config::StreamConfiguration;

/// Owns every player of one session and serializes their handoff.
pub struct PlayerCollection {
    players: Arc<RwLock<Vec<Arc<Player>>>>,
    events: broadcast::Sender<PlayerEvent>,
    playback: PlaybackConfig,
    transport_config: TransportConfig,
    transport: Arc<dyn MqttTransport>,
    shutdown: watch::Sender<bool>,
    lifecycle: Lifecycle,
}

impl PlayerCollection {
    /// Creates an empty collection that builds conduits over `transport`.
    pub fn new(
        transport: Arc<dyn MqttTransport>,
        playback: PlaybackConfig,
        transport_config: TransportConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        let collection = Self {
            players: Arc::new(RwLock::new(Vec::new())),
            events,
            playback,
            transport_config,
            transport,
            shutdown,
            lifecycle: Lifecycle::new(),
        };
        collection.spawn_handoff_watcher();
        collection
    }

    /// Subscribes to the events of every current and future player.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Creates a player for `stream` on `surface` and starts its play flow.
    ///
    /// Returns the new player's id without waiting for its first frame.
    ///
    /// # Errors
    ///
    /// - `PlayerError::AlreadyDestroyed` - The collection was destroyed
    /// - `PlayerError::Transport` - The player's conduit could not start
    pub async fn create(
        &self,
        surface: Arc<dyn VideoSurface>,
        stream: StreamConfiguration,
    ) -> Result<PlayerId, PlayerError> {
        if !self.lifecycle.is_active() {
            return Err(PlayerError::AlreadyDestroyed);
        }

        let id = PlayerId::next();
        let conduit = Conduit::new(
            Arc::clone(&self.transport),
            self.transport_config.clone(),
            stream,
        );
        let player = Arc::new(Player::new(
            id,
            surface,
            conduit,
            self.playback.clone(),
            self.events.clone(),
        ));

        self.players.write().await.push(Arc::clone(&player));
        debug!("Created {}", id);

        if let Err(e) = player.play().await {
            self.players
                .write()
                .await
                .retain(|existing| existing.id() != id);
            player.destroy().await;
            return Err(e);
        }

        Ok(id)
    }

    /// Returns how many players are currently held.
    pub async fn player_count(&self) -> usize {
        self.players.read().await.len()
    }

    /// Stops and destroys every player. Individual failures are logged and
    /// do not abort the sweep.
    pub async fn remove_all(&self) {
        let players: Vec<Arc<Player>> = self.players.write().await.drain(..).collect();
        for player in players {
            debug!("Removing {}", player.id());
            player.destroy().await;
        }
    }

    /// Destroys the collection and every player in it. Idempotent.
    pub async fn destroy(&self) {
        if !self.lifecycle.begin_destroy() {
            self.lifecycle.wait_destroy_complete().await;
            return;
        }
        let _ = self.shutdown.send(true);
        self.remove_all().await;
        self.lifecycle.finish_destroy();
    }

    /// Watches for first frames and retires superseded players.
    fn spawn_handoff_watcher(&self) {
        let mut events = self.events.subscribe();
        let players = Arc::clone(&self.players);
        let delay = self.playback.show_next_video_delay;
        let shutdown = self.shutdown.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = events.recv() => {
                        match event {
                            Ok(PlayerEvent::FirstFrameShown { player_id }) => {
                                retire_older_players(
                                    Arc::clone(&players),
                                    player_id,
                                    delay,
                                    shutdown.subscribe(),
                                )
                                .await;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Handoff watcher lagged by {} events", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }
}

/// Schedules destruction of every player older than `survivor_id`.
///
/// The delay keeps the previous stream on the surface until the new one has
/// visibly started. Destruction runs on its own task so the caller awaiting
/// the first frame is never blocked on old-player teardown.
async fn retire_older_players(
    players: Arc<RwLock<Vec<Arc<Player>>>>,
    survivor_id: PlayerId,
    delay: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let superseded: Vec<Arc<Player>> = players
        .read()
        .await
        .iter()
        .filter(|player| player.id() < survivor_id)
        .cloned()
        .collect();
    if superseded.is_empty() {
        return;
    }

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return,
        }

        for player in superseded {
            debug!("Retiring {} superseded by {}", player.id(), survivor_id);
            player.destroy().await;
            players
                .write()
                .await
                .retain(|existing| existing.id() != player.id());
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::conduit::simulation::SimulatedTransport;
    use crate::media::simulation::SimulatedSurface;

    fn test_stream(name: &str) -> StreamConfiguration {
        StreamConfiguration::from_url(&format!("clsp://sfs.example.com/{name}")).unwrap()
    }

    fn build_collection(transport: &Arc<SimulatedTransport>) -> PlayerCollection {
        let playback = PlaybackConfig {
            show_next_video_delay: Duration::from_millis(20),
            ..PlaybackConfig::default()
        };
        PlayerCollection::new(
            Arc::clone(transport) as Arc<dyn MqttTransport>,
            playback,
            TransportConfig::default(),
        )
    }

    async fn wait_for_first_frame(
        events: &mut broadcast::Receiver<PlayerEvent>,
        id: PlayerId,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(PlayerEvent::FirstFrameShown { player_id }) = events.recv().await {
                    if player_id == id {
                        return;
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for first frame");
    }

    #[tokio::test]
    async fn test_create_returns_before_first_frame() {
        let transport = Arc::new(SimulatedTransport::new());
        let collection = build_collection(&transport);
        let surface = Arc::new(SimulatedSurface::new()) as Arc<dyn VideoSurface>;

        let mut events = collection.subscribe();
        let id = collection
            .create(surface, test_stream("stream-a"))
            .await
            .unwrap();
        assert_eq!(collection.player_count().await, 1);

        wait_for_first_frame(&mut events, id).await;
        collection.destroy().await;
    }

    #[tokio::test]
    async fn test_handoff_retires_older_player() {
        let transport = Arc::new(SimulatedTransport::new());
        let collection = build_collection(&transport);
        let surface = Arc::new(SimulatedSurface::new());

        let mut events = collection.subscribe();
        let first = collection
            .create(
                Arc::clone(&surface) as Arc<dyn VideoSurface>,
                test_stream("stream-a"),
            )
            .await
            .unwrap();
        wait_for_first_frame(&mut events, first).await;

        let second = collection
            .create(
                Arc::clone(&surface) as Arc<dyn VideoSurface>,
                test_stream("stream-b"),
            )
            .await
            .unwrap();
        assert_eq!(collection.player_count().await, 2);

        wait_for_first_frame(&mut events, second).await;

        // After the handoff delay the superseded player is destroyed.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if collection.player_count().await == 1 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("superseded player was not retired");

        collection.destroy().await;
    }

    #[tokio::test]
    async fn test_remove_all_empties_collection() {
        let transport = Arc::new(SimulatedTransport::new());
        let collection = build_collection(&transport);
        let surface = Arc::new(SimulatedSurface::new());

        collection
            .create(
                Arc::clone(&surface) as Arc<dyn VideoSurface>,
                test_stream("stream-a"),
            )
            .await
            .unwrap();
        collection.remove_all().await;
        assert_eq!(collection.player_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_after_destroy_fails() {
        let transport = Arc::new(SimulatedTransport::new());
        let collection = build_collection(&transport);
        collection.destroy().await;

        let surface = Arc::new(SimulatedSurface::new()) as Arc<dyn VideoSurface>;
        let result = collection.create(surface, test_stream("stream-a")).await;
        assert!(matches!(result, Err(PlayerError::AlreadyDestroyed)));
    }

    #[tokio::test]
    async fn test_failed_create_rolls_back() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.fail_next_connect();
        let collection = build_collection(&transport);

        let surface = Arc::new(SimulatedSurface::new()) as Arc<dyn VideoSurface>;
        let result = collection.create(surface, test_stream("stream-a")).await;
        assert!(matches!(result, Err(PlayerError::Transport(_))));
        assert_eq!(collection.player_count().await, 0);
    }
}
