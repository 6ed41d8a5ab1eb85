//! One-shot, cancellable track-end notification.
//!
//! Replaces a polling watchdog: the timer sleeps for the remaining track
//! time and fires its callback at most once. Dropping or cancelling the
//! timer guarantees the callback never runs afterwards, unless it had
//! already been handed to the blocking pool.

use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Armed track-end timer. Cancelled on drop.
#[derive(Debug)]
pub struct TrackTimer {
    cancel: CancellationToken,
}

impl TrackTimer {
    /// Fire `on_fire` on the blocking pool after `after`, unless cancelled first.
    pub fn arm<F>(runtime: &Handle, after: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        runtime.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    if !token.is_cancelled() {
                        let _ = tokio::task::spawn_blocking(on_fire).await;
                    }
                }
            }
        });
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TrackTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fires_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _timer = TrackTimer::arm(&Handle::current(), Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let timer = TrackTimer::arm(&Handle::current(), Duration::from_millis(40), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        assert!(timer.is_cancelled());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drop_cancels() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        drop(TrackTimer::arm(
            &Handle::current(),
            Duration::from_millis(20),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
