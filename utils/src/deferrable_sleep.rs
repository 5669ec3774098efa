use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    sync::watch,
    time::{sleep_until, Instant, Sleep},
};

/// A sleep whose deadline can be pushed forward while it is pending, up to a
/// hard ceiling fixed at creation time.
///
/// Used to coalesce bursts of work: every new event defers the wakeup a
/// little further, but the ceiling guarantees the sleeper eventually fires
/// no matter how fast events arrive. Deferrals are observed by polling in
/// chunks rather than by waker registration on the channel, so the chunk
/// duration bounds how late a deferral can be noticed.
pub struct DeferrableSleep {
    receiver: watch::Receiver<Instant>,
    current_sleep: Pin<Box<Sleep>>,
    chunk_duration: Duration,
    target: Instant,
    ceiling: Instant,
}

impl DeferrableSleep {
    pub fn new(
        initial_target: Instant,
        ceiling: Instant,
        chunk_duration: Duration,
    ) -> (Self, watch::Sender<Instant>) {
        let target = initial_target.min(ceiling);
        let (sender, receiver) = watch::channel(target);
        (
            Self {
                receiver,
                current_sleep: Box::pin(sleep_until(target)),
                chunk_duration,
                target,
                ceiling,
            },
            sender,
        )
    }
}

impl Future for DeferrableSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.receiver.has_changed().unwrap_or(false) {
            let requested = *self.receiver.borrow_and_update();
            self.target = requested.min(self.ceiling);
        }

        let now = Instant::now();
        if now >= self.target {
            return Poll::Ready(());
        }

        // Sleep at most one chunk so deferrals sent through the channel are
        // picked up on the next poll.
        let next_wake = std::cmp::min(now + self.chunk_duration, self.target);
        if self.current_sleep.as_ref().deadline() != next_wake {
            self.current_sleep = Box::pin(sleep_until(next_wake));
        }

        match self.current_sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                if Instant::now() >= self.target {
                    Poll::Ready(())
                } else {
                    let next = std::cmp::min(Instant::now() + self.chunk_duration, self.target);
                    self.current_sleep = Box::pin(sleep_until(next));
                    // Poll the fresh sleep once so its timer is registered.
                    match self.current_sleep.as_mut().poll(cx) {
                        Poll::Ready(()) => Poll::Ready(()),
                        Poll::Pending => Poll::Pending,
                    }
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{advance, pause, Duration, Instant};

    use super::*;

    #[tokio::test]
    async fn test_fires_at_initial_target() {
        pause();
        let start = Instant::now();
        let (sleep, _tx) = DeferrableSleep::new(
            start + Duration::from_millis(100),
            start + Duration::from_secs(10),
            Duration::from_millis(10),
        );
        let handle = tokio::spawn(sleep);
        advance(Duration::from_millis(110)).await;
        handle.await.unwrap();
        assert!(Instant::now() - start >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_deferral_pushes_deadline() {
        pause();
        let start = Instant::now();
        let (sleep, tx) = DeferrableSleep::new(
            start + Duration::from_millis(100),
            start + Duration::from_secs(10),
            Duration::from_millis(10),
        );
        let handle = tokio::spawn(sleep);
        advance(Duration::from_millis(50)).await;
        let _ = tx.send(Instant::now() + Duration::from_millis(200));
        advance(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        advance(Duration::from_millis(150)).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_ceiling_bounds_deferrals() {
        pause();
        let start = Instant::now();
        let ceiling = start + Duration::from_millis(300);
        let (sleep, tx) = DeferrableSleep::new(
            start + Duration::from_millis(100),
            ceiling,
            Duration::from_millis(10),
        );
        let handle = tokio::spawn(sleep);
        // Keep deferring well past the ceiling; the sleep must still fire
        // once the ceiling is reached.
        let mut finished_at = None;
        for _ in 0..10 {
            advance(Duration::from_millis(50)).await;
            if handle.is_finished() {
                finished_at = Some(Instant::now());
                break;
            }
            let _ = tx.send(Instant::now() + Duration::from_secs(5));
        }
        let finished_at = finished_at.expect("sleep never fired despite ceiling");
        assert!(finished_at >= ceiling);
        assert!(finished_at <= ceiling + Duration::from_millis(60));
        handle.await.unwrap();
    }
}
