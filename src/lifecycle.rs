//! Single-fire destruction protocol shared by all stateful components.
//!
//! Every owning component embeds a [`Lifecycle`] guard. The first caller of
//! `begin_destroy` performs teardown; concurrent and later callers await the
//! completion notification instead of running a second teardown. Once
//! destruction has begun, state-mutating operations are rejected by checking
//! `is_active`.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Idempotent, observable destroy guard.
#[derive(Debug, Default)]
pub struct Lifecycle {
    destroyed: AtomicBool,
    complete: AtomicBool,
    notify: Notify,
}

impl Lifecycle {
    /// Creates a fresh, active lifecycle guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the right to perform teardown.
    ///
    /// Returns `true` exactly once; every other caller gets `false` and
    /// should await [`Lifecycle::wait_destroy_complete`] instead.
    pub fn begin_destroy(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    /// Marks teardown as finished and wakes every waiter.
    pub fn finish_destroy(&self) {
        self.complete.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Returns true once destruction has begun.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Returns true once teardown has fully completed.
    pub fn is_destroy_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Returns true while the component still accepts mutating operations.
    pub fn is_active(&self) -> bool {
        !self.is_destroyed()
    }

    /// Waits until the owning component's teardown has completed.
    pub async fn wait_destroy_complete(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_destroy_complete() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_first_caller_wins() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.is_active());
        assert!(lifecycle.begin_destroy());
        assert!(!lifecycle.begin_destroy());
        assert!(lifecycle.is_destroyed());
        assert!(!lifecycle.is_active());
    }

    #[tokio::test]
    async fn test_waiters_released_on_completion() {
        let lifecycle = Arc::new(Lifecycle::new());
        assert!(lifecycle.begin_destroy());

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_destroy_complete().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        lifecycle.finish_destroy();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(lifecycle.is_destroy_complete());
    }

    #[tokio::test]
    async fn test_wait_after_completion_returns_immediately() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_destroy();
        lifecycle.finish_destroy();
        lifecycle.wait_destroy_complete().await;
    }
}
