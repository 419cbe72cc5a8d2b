//! Cancellable periodic timers
//!
//! Each timer is a spawned tokio task that pushes its kind into a channel on
//! every period. The owner of the receiving end handles ticks on its own loop,
//! so timer work never runs concurrently with message handling.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Every periodic activity a peer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Viewer: probe the host clock
    ClockProbe,
    /// Host: broadcast a snapshot
    Snapshot,
    /// Viewer: evaluate drift against the latest snapshot
    DriftCheck,
    /// Report buffered-ahead health
    BufferHealth,
    /// Persist the local checkpoint
    Checkpoint,
    /// Step an in-flight rate ramp
    RateRamp,
    /// Poll buffer sufficiency while a play is gated
    BufferPoll,
}

/// Owns the running timers. Dropping the scheduler cancels all of them.
#[derive(Debug)]
pub struct Scheduler {
    tick_tx: mpsc::UnboundedSender<TimerKind>,
    timers: HashMap<TimerKind, oneshot::Sender<()>>,
}

impl Scheduler {
    pub fn new(tick_tx: mpsc::UnboundedSender<TimerKind>) -> Self {
        Self {
            tick_tx,
            timers: HashMap::new(),
        }
    }

    /// Start (or restart) a timer. The first tick arrives after one period.
    pub fn start(&mut self, kind: TimerKind, period: Duration) {
        self.cancel(kind);

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let tick_tx = self.tick_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!("Timer {:?} cancelled", kind);
                        break;
                    }
                    _ = interval.tick() => {
                        if tick_tx.send(kind).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.timers.insert(kind, cancel_tx);
    }

    /// Start a timer unless it is already running
    pub fn ensure(&mut self, kind: TimerKind, period: Duration) {
        if !self.is_active(kind) {
            self.start(kind, period);
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(cancel) = self.timers.remove(&kind) {
            let _ = cancel.send(());
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }

    /// Ticks for inactive timers may still be queued and should be ignored
    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.timers.contains_key(&kind)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_and_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(tx);

        scheduler.start(TimerKind::Snapshot, Duration::from_millis(1_000));
        assert!(scheduler.is_active(TimerKind::Snapshot));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(rx.recv().await, Some(TimerKind::Snapshot));
        assert_eq!(rx.recv().await, Some(TimerKind::Snapshot));
        assert!(rx.try_recv().is_err());

        scheduler.cancel(TimerKind::Snapshot);
        assert!(!scheduler.is_active(TimerKind::Snapshot));
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(tx);

        scheduler.start(TimerKind::ClockProbe, Duration::from_millis(100));
        scheduler.ensure(TimerKind::DriftCheck, Duration::from_millis(100));
        scheduler.cancel_all();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(rx.try_recv().is_err());
        assert!(!scheduler.is_active(TimerKind::ClockProbe));
        assert!(!scheduler.is_active(TimerKind::DriftCheck));
    }
}
