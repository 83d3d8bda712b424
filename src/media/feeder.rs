//! Bounded append queue between the conduit and the media buffer.
//!
//! The feeder owns the policy around buffer pressure: a bounded segment
//! queue that drops from the head on overrun (the caller then requests a
//! resync), quota-exceeded recovery by evicting the oldest buffered range,
//! and a consecutive-failure budget after which the player must give up.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{BufferError, MediaBuffer};
use crate::config::PlaybackConfig;

/// Errors that end a feeder's usefulness.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeederError {
    /// The buffer rejected an append even after eviction; the media source
    /// must be rebuilt
    #[error("Media buffer needs reinitialization: {reason}")]
    ReinitializeNeeded {
        /// Description of the unrecoverable condition
        reason: String,
    },

    /// Consecutive append failures exhausted the retry budget
    #[error("Append retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Number of consecutive failed attempts
        attempts: u32,
    },
}

/// Outcome of queueing one media segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The segment was queued
    Queued,
    /// The queue was full; the oldest segments were dropped to make room
    /// and the conduit should be asked to resync
    OverrunDropped {
        /// Number of segments dropped from the head
        dropped: usize,
    },
}

/// Counters describing feeder activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeederStats {
    /// Segments appended to the media buffer
    pub segments_appended: u64,
    /// Bytes appended to the media buffer
    pub bytes_appended: u64,
    /// Segments dropped from the queue head on overrun
    pub segments_dropped: u64,
    /// Eviction passes run against the media buffer
    pub evictions: u64,
}

struct QueuedSegment {
    data: Bytes,
    duration_secs: f64,
}

/// Bounded segment queue feeding one media buffer.
///
/// Owned exclusively by a player's driver task; methods take `&mut self`
/// and need no internal locking.
pub struct SegmentFeeder {
    buffer: Arc<dyn MediaBuffer>,
    queue: VecDeque<QueuedSegment>,
    max_queue_len: usize,
    evict_threshold_secs: f64,
    max_append_retries: u32,
    consecutive_failures: u32,
    stats: FeederStats,
}

impl SegmentFeeder {
    /// Creates a feeder bound to `buffer` with the configured queue bounds.
    pub fn new(buffer: Arc<dyn MediaBuffer>, config: &PlaybackConfig) -> Self {
        Self {
            buffer,
            queue: VecDeque::new(),
            max_queue_len: config.max_segment_queue_len.max(1),
            evict_threshold_secs: config.buffer_evict_threshold_secs,
            max_append_retries: config.max_append_retries,
            consecutive_failures: 0,
            stats: FeederStats::default(),
        }
    }

    /// Appends the stream's init segment, recovering from quota pressure.
    ///
    /// # Errors
    ///
    /// - `FeederError::ReinitializeNeeded` - The buffer rejected the init
    ///   segment even after eviction
    pub async fn append_init(&mut self, data: Bytes) -> Result<(), FeederError> {
        let byte_len = data.len();
        self.append_with_quota_recovery(data).await?;
        self.stats.segments_appended += 1;
        self.stats.bytes_appended += byte_len as u64;
        Ok(())
    }

    /// Queues one media segment, dropping from the head when full.
    pub fn enqueue(&mut self, data: Bytes, duration_secs: f64) -> EnqueueOutcome {
        let mut dropped = 0;
        while self.queue.len() >= self.max_queue_len {
            self.queue.pop_front();
            dropped += 1;
        }
        self.queue.push_back(QueuedSegment {
            data,
            duration_secs,
        });

        if dropped > 0 {
            self.stats.segments_dropped += dropped as u64;
            warn!(
                "Segment queue overrun, dropped {} segments from the head",
                dropped
            );
            EnqueueOutcome::OverrunDropped { dropped }
        } else {
            EnqueueOutcome::Queued
        }
    }

    /// Appends every queued segment to the media buffer.
    ///
    /// A transient append failure leaves the segment at the head for the
    /// next drain; each failed drain counts against the retry budget.
    ///
    /// # Errors
    ///
    /// - `FeederError::ReinitializeNeeded` - Quota recovery failed
    /// - `FeederError::RetriesExhausted` - Too many consecutive failures
    pub async fn drain(&mut self) -> Result<usize, FeederError> {
        let mut appended_bytes = 0usize;

        while let Some(segment) = self.queue.pop_front() {
            let byte_len = segment.data.len();
            match self.buffer.append(segment.data.clone()).await {
                Ok(()) => {
                    self.consecutive_failures = 0;
                    self.stats.segments_appended += 1;
                    self.stats.bytes_appended += byte_len as u64;
                    appended_bytes += byte_len;
                }
                Err(BufferError::QuotaExceeded) => {
                    self.evict_oldest().await?;
                    match self.buffer.append(segment.data).await {
                        Ok(()) => {
                            self.consecutive_failures = 0;
                            self.stats.segments_appended += 1;
                            self.stats.bytes_appended += byte_len as u64;
                            appended_bytes += byte_len;
                        }
                        Err(e) => {
                            return Err(FeederError::ReinitializeNeeded {
                                reason: format!("append failed after eviction: {e}"),
                            });
                        }
                    }
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    debug!(
                        "Segment append failed ({} consecutive, duration {:.3}s): {}",
                        self.consecutive_failures, segment.duration_secs, e
                    );
                    if self.consecutive_failures >= self.max_append_retries {
                        return Err(FeederError::RetriesExhausted {
                            attempts: self.consecutive_failures,
                        });
                    }
                    self.queue.push_front(segment);
                    break;
                }
            }
        }

        Ok(appended_bytes)
    }

    /// Releases the media buffer.
    pub async fn close(&mut self) {
        self.queue.clear();
        self.buffer.close().await;
    }

    /// Returns feeder activity counters.
    pub fn stats(&self) -> FeederStats {
        self.stats
    }

    /// Returns how many segments are currently queued.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Appends `data` to the media buffer, evicting the oldest buffered
    /// range and retrying once if the buffer reports quota exceeded.
    async fn append_with_quota_recovery(&mut self, data: Bytes) -> Result<(), FeederError> {
        match self.buffer.append(data.clone()).await {
            Ok(()) => Ok(()),
            Err(BufferError::QuotaExceeded) => {
                self.evict_oldest().await?;
                self.buffer.append(data).await.map_err(|e| FeederError::ReinitializeNeeded {
                    reason: format!("append failed after eviction: {e}"),
                })
            }
            Err(e) => Err(FeederError::ReinitializeNeeded {
                reason: format!("append failed: {e}"),
            }),
        }
    }

    async fn evict_oldest(&mut self) -> Result<(), FeederError> {
        let ranges = self.buffer.buffered_ranges();
        let (Some(&(first_start, first_end)), Some(&(_, live_edge))) =
            (ranges.first(), ranges.last())
        else {
            return Err(FeederError::ReinitializeNeeded {
                reason: "quota exceeded with nothing buffered".to_string(),
            });
        };

        let cutoff = live_edge - self.evict_threshold_secs;
        let evict_end = if cutoff > first_start {
            cutoff.min(first_end)
        } else {
            first_end
        };

        self.stats.evictions += 1;
        debug!(
            "Evicting buffered range {:.3}..{:.3} (live edge {:.3})",
            first_start, evict_end, live_edge
        );
        self.buffer
            .evict(first_start, evict_end)
            .await
            .map_err(|e| FeederError::ReinitializeNeeded {
                reason: format!("eviction failed: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::simulation::SimulatedMediaBuffer;

    fn media_bytes() -> Bytes {
        crate::conduit::simulation::fmp4_media_stub()
    }

    #[tokio::test]
    async fn test_enqueue_and_drain() {
        let buffer = Arc::new(SimulatedMediaBuffer::new());
        let mut feeder = SegmentFeeder::new(buffer.clone(), &PlaybackConfig::default());

        assert_eq!(feeder.enqueue(media_bytes(), 0.5), EnqueueOutcome::Queued);
        assert_eq!(feeder.enqueue(media_bytes(), 0.5), EnqueueOutcome::Queued);
        let appended = feeder.drain().await.unwrap();
        assert!(appended > 0);
        assert_eq!(feeder.queued_len(), 0);
        assert_eq!(buffer.appended_count(), 2);
        assert_eq!(feeder.stats().segments_appended, 2);
    }

    #[tokio::test]
    async fn test_overrun_drops_from_head() {
        let buffer = Arc::new(SimulatedMediaBuffer::new());
        let config = PlaybackConfig {
            max_segment_queue_len: 2,
            ..PlaybackConfig::default()
        };
        let mut feeder = SegmentFeeder::new(buffer, &config);

        assert_eq!(feeder.enqueue(media_bytes(), 0.5), EnqueueOutcome::Queued);
        assert_eq!(feeder.enqueue(media_bytes(), 0.5), EnqueueOutcome::Queued);
        assert_eq!(
            feeder.enqueue(media_bytes(), 0.5),
            EnqueueOutcome::OverrunDropped { dropped: 1 }
        );
        assert_eq!(feeder.queued_len(), 2);
        assert_eq!(feeder.stats().segments_dropped, 1);
    }

    #[tokio::test]
    async fn test_quota_exceeded_evicts_and_retries_once() {
        let buffer = Arc::new(SimulatedMediaBuffer::new());
        let mut feeder = SegmentFeeder::new(buffer.clone(), &PlaybackConfig::default());

        // Build up some buffered media, then script a single quota rejection.
        feeder.enqueue(media_bytes(), 0.5);
        feeder.enqueue(media_bytes(), 0.5);
        feeder.drain().await.unwrap();

        buffer.fail_next_appends_with_quota(1);
        feeder.enqueue(media_bytes(), 0.5);
        feeder.drain().await.unwrap();

        assert_eq!(buffer.eviction_count(), 1);
        assert_eq!(buffer.appended_count(), 3);
    }

    #[tokio::test]
    async fn test_quota_exceeded_twice_needs_reinitialization() {
        let buffer = Arc::new(SimulatedMediaBuffer::new());
        let mut feeder = SegmentFeeder::new(buffer.clone(), &PlaybackConfig::default());

        feeder.enqueue(media_bytes(), 0.5);
        feeder.drain().await.unwrap();

        buffer.fail_next_appends_with_quota(2);
        feeder.enqueue(media_bytes(), 0.5);
        let result = feeder.drain().await;
        assert!(matches!(
            result,
            Err(FeederError::ReinitializeNeeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_consecutive_failures_exhaust_retries() {
        let buffer = Arc::new(SimulatedMediaBuffer::new());
        let config = PlaybackConfig {
            max_append_retries: 3,
            ..PlaybackConfig::default()
        };
        let mut feeder = SegmentFeeder::new(buffer.clone(), &config);

        buffer.fail_next_appends(10);
        feeder.enqueue(media_bytes(), 0.5);

        assert!(feeder.drain().await.is_ok());
        assert!(feeder.drain().await.is_ok());
        let result = feeder.drain().await;
        assert!(matches!(
            result,
            Err(FeederError::RetriesExhausted { attempts: 3 })
        ));
    }
}
