//! IOV registry: session ids, supervision, and removal semantics.
//!
//! The registry allocates stable session ids, maps them to live sessions,
//! and supervises retries: a fatal event on a session removes it and
//! creates a replacement bound to the same surface wiring, within a bounded
//! per-stream retry budget.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::conduit::transport::MqttTransport;
use crate::config::ClspConfig;
use crate::lifecycle::Lifecycle;
use crate::media::SurfaceResolver;
use crate::session::{ChangeSrcTarget, FatalReport, IovSession, SessionError, SurfaceConfig};

/// Identifier of one session, unique for the registry's whole lifetime.
///
/// Ids are never reused, even after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Errors reported by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry was already destroyed
    #[error("Registry already destroyed")]
    AlreadyDestroyed,

    /// Session construction failed
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Supervision events host applications can observe.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A fatal event replaced one session with a fresh one
    SessionReplaced {
        /// The removed session
        removed: SessionId,
        /// Its replacement
        replacement: SessionId,
    },
    /// The retry budget for a stream is exhausted; no further replacements
    /// will be created until the window slides
    RetryExhausted {
        /// The stream name whose budget ran out
        stream_name: String,
    },
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Arc<IovSession>>,
    pending_removal: HashSet<SessionId>,
}

struct RegistryInner {
    config: ClspConfig,
    transport: Arc<dyn MqttTransport>,
    resolver: Arc<dyn SurfaceResolver>,
    state: RwLock<RegistryState>,
    // u64 does not wrap in practice; wrapping would be a defect, not a
    // namespace rollover.
    next_id: AtomicU64,
    fatal_tx: mpsc::UnboundedSender<FatalReport>,
    events: broadcast::Sender<RegistryEvent>,
    attempts: Mutex<HashMap<String, VecDeque<Instant>>>,
    shutdown: watch::Sender<bool>,
    lifecycle: Lifecycle,
}

/// Process-wide session registry and retry supervisor.
#[derive(Clone)]
pub struct IovRegistry {
    inner: Arc<RegistryInner>,
}

impl IovRegistry {
    /// Creates a registry and starts its supervision task.
    pub fn new(
        config: ClspConfig,
        transport: Arc<dyn MqttTransport>,
        resolver: Arc<dyn SurfaceResolver>,
    ) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let (shutdown, _) = watch::channel(false);

        let registry = Self {
            inner: Arc::new(RegistryInner {
                config,
                transport,
                resolver,
                state: RwLock::new(RegistryState::default()),
                next_id: AtomicU64::new(1),
                fatal_tx,
                events,
                attempts: Mutex::new(HashMap::new()),
                shutdown,
                lifecycle: Lifecycle::new(),
            }),
        };
        registry.spawn_supervisor(fatal_rx);
        registry
    }

    /// Returns the process-wide registry, creating it on first call.
    ///
    /// The first caller's configuration and collaborators win; later calls
    /// return the existing instance. Teardown stays explicit through
    /// [`IovRegistry::destroy`].
    pub fn as_singleton(
        config: ClspConfig,
        transport: Arc<dyn MqttTransport>,
        resolver: Arc<dyn SurfaceResolver>,
    ) -> IovRegistry {
        static SINGLETON: OnceLock<IovRegistry> = OnceLock::new();
        SINGLETON
            .get_or_init(|| IovRegistry::new(config, transport, resolver))
            .clone()
    }

    /// Subscribes to supervision events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Creates a session bound to `surface_config` and registers it.
    ///
    /// # Errors
    ///
    /// - `RegistryError::AlreadyDestroyed` - The registry was destroyed
    /// - `RegistryError::Session` - Surface resolution failed
    pub async fn create(
        &self,
        surface_config: SurfaceConfig,
    ) -> Result<Arc<IovSession>, RegistryError> {
        if !self.inner.lifecycle.is_active() {
            return Err(RegistryError::AlreadyDestroyed);
        }

        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let session = IovSession::new(
            id,
            surface_config,
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.resolver),
            self.inner.config.clone(),
            self.inner.fatal_tx.clone(),
        )?;

        self.inner
            .state
            .write()
            .await
            .sessions
            .insert(id, Arc::clone(&session));
        info!("Registered {}", id);
        Ok(session)
    }

    /// Returns true iff `id` is registered and not mid-removal.
    pub async fn has(&self, id: SessionId) -> bool {
        let state = self.inner.state.read().await;
        !state.pending_removal.contains(&id) && state.sessions.contains_key(&id)
    }

    /// Returns the session registered under `id`, if any.
    pub async fn get(&self, id: SessionId) -> Option<Arc<IovSession>> {
        let state = self.inner.state.read().await;
        if state.pending_removal.contains(&id) {
            return None;
        }
        state.sessions.get(&id).cloned()
    }

    /// Returns how many sessions are registered.
    pub async fn session_count(&self) -> usize {
        self.inner.state.read().await.sessions.len()
    }

    /// Removes and destroys the session under `id`.
    ///
    /// Idempotent: an unknown or mid-removal id is a no-op. While the
    /// session destructor runs, the id reads as absent. Destroy failures
    /// are logged, never rethrown.
    pub async fn remove(&self, id: SessionId) {
        let session = {
            let mut state = self.inner.state.write().await;
            let Some(session) = state.sessions.remove(&id) else {
                debug!("Remove of unknown {} is a no-op", id);
                return;
            };
            state.pending_removal.insert(id);
            session
        };

        session.destroy().await;

        self.inner.state.write().await.pending_removal.remove(&id);
        info!("Removed {}", id);
    }

    /// Destroys the registry and every session in it. Idempotent; after
    /// destroy, `create` fails.
    pub async fn destroy(&self) {
        if !self.inner.lifecycle.begin_destroy() {
            self.inner.lifecycle.wait_destroy_complete().await;
            return;
        }
        let _ = self.inner.shutdown.send(true);

        let ids: Vec<SessionId> = self
            .inner
            .state
            .read()
            .await
            .sessions
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.remove(id).await;
        }

        self.inner.lifecycle.finish_destroy();
        info!("Registry destroyed");
    }

    fn spawn_supervisor(&self, mut fatal_rx: mpsc::UnboundedReceiver<FatalReport>) {
        let registry = self.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    report = fatal_rx.recv() => {
                        let Some(report) = report else { break };
                        registry.handle_fatal(report).await;
                    }
                }
            }
            debug!("Registry supervisor stopped");
        });
    }

    /// Replaces a session after a fatal event: remove, then one
    /// replacement bound to the same surface wiring, within the retry
    /// budget. Every failure here is logged and contained; the
    /// replacement's own failures trigger its own supervision cycle.
    async fn handle_fatal(&self, report: FatalReport) {
        let id = report.session_id;
        if !self.has(id).await {
            debug!("Fatal {} for absent {}, ignoring", report.event_name, id);
            return;
        }
        let Some(session) = self.get(id).await else {
            return;
        };

        warn!("Fatal {} on {}, replacing", report.event_name, id);
        let target = session.last_target().await;
        let surface_config = session.surface_config().clone();

        self.remove(id).await;

        let Some(target) = target else {
            debug!("{} had no stream target, not replacing", id);
            return;
        };

        if !self.consume_retry_budget(target.stream_name()).await {
            warn!(
                "Retry budget exhausted for stream {}, giving up",
                target.stream_name()
            );
            let _ = self.inner.events.send(RegistryEvent::RetryExhausted {
                stream_name: target.stream_name().to_string(),
            });
            return;
        }

        let replacement = match self.create(surface_config).await {
            Ok(replacement) => replacement,
            Err(e) => {
                warn!("Replacement for {} could not be created: {}", id, e);
                return;
            }
        };

        if let Err(e) = replacement
            .change_src(ChangeSrcTarget::Config(target))
            .await
        {
            warn!("Replacement {} failed to start: {}", replacement.id(), e);
        }
        let _ = self.inner.events.send(RegistryEvent::SessionReplaced {
            removed: id,
            replacement: replacement.id(),
        });
    }

    /// Consumes one attempt from the sliding-window budget for
    /// `stream_name`. Returns false when the budget is exhausted.
    async fn consume_retry_budget(&self, stream_name: &str) -> bool {
        let retry = &self.inner.config.retry;
        let mut attempts = self.inner.attempts.lock().await;
        let entry = attempts.entry(stream_name.to_string()).or_default();

        let now = Instant::now();
        while entry
            .front()
            .is_some_and(|at| now.duration_since(*at) > retry.window)
        {
            entry.pop_front();
        }

        if entry.len() >= retry.max_attempts {
            return false;
        }
        entry.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::conduit::simulation::SimulatedTransport;
    use crate::config::RetryConfig;
    use crate::media::SurfaceHost;
    use crate::media::simulation::{SimulatedResolver, SimulatedSurfaceHost};

    fn build_registry(config: ClspConfig) -> (IovRegistry, Arc<SimulatedTransport>) {
        let transport = Arc::new(SimulatedTransport::new());
        let resolver = Arc::new(SimulatedResolver::new());
        let registry = IovRegistry::new(
            config,
            Arc::clone(&transport) as Arc<dyn MqttTransport>,
            resolver as Arc<dyn SurfaceResolver>,
        );
        (registry, transport)
    }

    fn container_config() -> SurfaceConfig {
        SurfaceConfig {
            container_element: Some(
                Arc::new(SimulatedSurfaceHost::new()) as Arc<dyn SurfaceHost>
            ),
            ..SurfaceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_never_reused() {
        let (registry, _transport) = build_registry(ClspConfig::default());

        let first = registry.create(container_config()).await.unwrap();
        let second = registry.create(container_config()).await.unwrap();
        assert_eq!(first.id(), SessionId(1));
        assert_eq!(second.id(), SessionId(2));

        registry.remove(first.id()).await;
        let third = registry.create(container_config()).await.unwrap();
        assert_eq!(third.id(), SessionId(3));

        registry.destroy().await;
    }

    #[tokio::test]
    async fn test_remove_unknown_id_is_noop() {
        let (registry, _transport) = build_registry(ClspConfig::default());
        registry.remove(SessionId(42)).await;
        assert_eq!(registry.session_count().await, 0);
        registry.destroy().await;
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (registry, _transport) = build_registry(ClspConfig::default());
        let session = registry.create(container_config()).await.unwrap();
        let id = session.id();

        registry.remove(id).await;
        registry.remove(id).await;
        assert!(!registry.has(id).await);
        assert!(registry.get(id).await.is_none());
        assert!(session.is_destroy_complete());

        registry.destroy().await;
    }

    #[tokio::test]
    async fn test_fatal_event_replaces_session_with_same_target() {
        let (registry, transport) = build_registry(ClspConfig::default());
        let mut events = registry.subscribe();

        let container = Arc::new(SimulatedSurfaceHost::new());
        let session = registry
            .create(SurfaceConfig {
                container_element: Some(Arc::clone(&container) as Arc<dyn SurfaceHost>),
                ..SurfaceConfig::default()
            })
            .await
            .unwrap();
        let removed_id = session.id();

        session
            .change_src("clsp://sfs.example.com/stream-a")
            .await
            .unwrap();

        // Out-of-band removal of the transport host is fatal.
        transport.detach_host();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let RegistryEvent::SessionReplaced {
            removed,
            replacement,
        } = event
        else {
            panic!("expected replacement event, got {event:?}");
        };
        assert_eq!(removed, removed_id);
        assert_eq!(replacement, SessionId(removed_id.0 + 1));

        assert!(!registry.has(removed_id).await);
        let new_session = registry.get(replacement).await.unwrap();
        assert_eq!(
            new_session
                .stream_configuration()
                .await
                .unwrap()
                .stream_name(),
            "stream-a"
        );

        registry.destroy().await;
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_is_terminal() {
        let config = ClspConfig {
            retry: RetryConfig {
                max_attempts: 2,
                window: Duration::from_secs(60),
            },
            ..ClspConfig::default()
        };
        let (registry, _transport) = build_registry(config);

        assert!(registry.consume_retry_budget("stream-a").await);
        assert!(registry.consume_retry_budget("stream-a").await);
        assert!(!registry.consume_retry_budget("stream-a").await);
        // Budgets are per stream name.
        assert!(registry.consume_retry_budget("stream-b").await);

        registry.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_removes_every_session() {
        let (registry, _transport) = build_registry(ClspConfig::default());

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(registry.create(container_config()).await.unwrap().id());
        }
        assert_eq!(registry.session_count().await, 3);

        registry.destroy().await;
        assert_eq!(registry.session_count().await, 0);
        for id in ids {
            assert!(!registry.has(id).await);
        }

        let result = registry.create(container_config()).await;
        assert!(matches!(result, Err(RegistryError::AlreadyDestroyed)));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (registry, _transport) = build_registry(ClspConfig::default());
        registry.create(container_config()).await.unwrap();
        registry.destroy().await;
        registry.destroy().await;
        assert_eq!(registry.session_count().await, 0);
    }
}
