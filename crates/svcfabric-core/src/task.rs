//! Cancellable background tasks (spec.md §9: "model as explicit tasks with
//! a scheduler; each long-running duty ... is a cancellable task with a
//! `stop()` that returns only after the task drains").
//!
//! Grounded on the teacher's `shutdown::ShutdownToken`/`GracefulShutdown`
//! pair (a `tokio::sync::watch<bool>` checked cooperatively by the task
//! loop), generalized into a reusable handle so every loop in the fabric
//! (health probes, staleness sweeps, consumer polls, retention sweeps,
//! projection checkpoints) is constructed and torn down the same way.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A token a running loop polls to learn whether it should stop.
#[derive(Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    /// True once `stop()` has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `stop()` has been called.
    pub async fn cancelled(&mut self) {
        let _ = self.receiver.wait_for(|v| *v).await;
    }
}

/// Handle to a spawned background loop. Dropping the handle does not stop
/// the task (use [`Task::stop`] explicitly) so a composition root can hold
/// many of these and drain them together on shutdown.
pub struct Task {
    sender: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl Task {
    /// Spawn `body`, handing it a [`CancelToken`] it should select against
    /// in its own loop.
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = watch::channel(false);
        let token = CancelToken { receiver };
        let join = tokio::spawn(body(token));
        Self {
            sender,
            join: Some(join),
        }
    }

    /// Spawn a periodic loop that runs `tick` every `interval` until
    /// cancelled.
    pub fn spawn_interval<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::spawn(move |mut cancel| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
        })
    }

    /// Signal cancellation and wait for the task to drain.
    pub async fn stop(mut self) {
        let _ = self.sender.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // Best-effort: signal cancellation even if the caller never awaited
        // `stop()`. The spawned task will observe it on its next select.
        let _ = self.sender.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn interval_task_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let task = Task::spawn_interval(Duration::from_millis(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        task.stop().await;

        assert!(count.load(Ordering::Relaxed) >= 2);
    }

    #[tokio::test]
    async fn stop_drains_in_flight_work() {
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let task = Task::spawn(move |mut cancel| async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        d.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                }
            }
        });
        task.stop().await;
        assert_eq!(done.load(Ordering::Relaxed), 1);
    }
}
