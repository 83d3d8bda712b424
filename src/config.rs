//! Centralized configuration for the CLSP player core.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all player components.
///
/// Groups related configuration settings into logical sections.
#[derive(Debug, Clone, Default)]
pub struct ClspConfig {
    /// Playback and buffering behavior
    pub playback: PlaybackConfig,
    /// MQTT transport parameters
    pub transport: TransportConfig,
    /// Registry retry supervision policy
    pub retry: RetryConfig,
}

/// Playback, handoff, and buffering configuration.
///
/// Controls the timers around source changes and environment events, and the
/// bounds of the segment append queue.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Emit metric events on the session bus
    pub enable_metrics: bool,
    /// Wait after a browser `online` signal before restarting playback.
    /// Browser-reported online events precede actual network readiness.
    pub connection_change_play_delay: Duration,
    /// Delay between a new player's first rendered frame and teardown of the
    /// player it replaces
    pub show_next_video_delay: Duration,
    /// Upper bound on the wait for a new player's first rendered frame
    pub first_frame_timeout: Duration,
    /// Maximum queued media segments before the feeder drops from the head
    /// and requests a resync
    pub max_segment_queue_len: usize,
    /// Buffered media older than this many seconds behind the live edge is
    /// eligible for eviction when the media buffer reports quota exhaustion
    pub buffer_evict_threshold_secs: f64,
    /// Consecutive append failures tolerated before the player gives up
    pub max_append_retries: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            connection_change_play_delay: Duration::from_secs(5),
            show_next_video_delay: Duration::from_millis(500),
            first_frame_timeout: Duration::from_secs(30),
            max_segment_queue_len: 30,
            buffer_evict_threshold_secs: 60.0,
            max_append_retries: 3,
        }
    }
}

/// MQTT-over-WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// MQTT keep-alive interval
    pub keep_alive: Duration,
    /// Prefix for generated per-connect client ids
    pub client_id_prefix: &'static str,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            client_id_prefix: "clsp-",
        }
    }
}

/// Bounded retry policy for registry-driven session replacement.
///
/// A fatal event on a freshly created replacement spawns another replacement;
/// without a budget that storm never terminates. The budget is a sliding
/// window per stream name.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum replacement sessions per stream name within `window`
    pub max_attempts: usize,
    /// Sliding window over which attempts are counted
    pub window: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_playback_delays() {
        let config = PlaybackConfig::default();
        assert_eq!(config.connection_change_play_delay, Duration::from_secs(5));
        assert_eq!(config.show_next_video_delay, Duration::from_millis(500));
        assert!(!config.enable_metrics);
    }

    #[test]
    fn test_default_retry_budget() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.window, Duration::from_secs(60));
    }
}
