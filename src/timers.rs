//! Keyed timer scheduler.
//!
//! One timer per [`TimerId`]. Starting a timer cancels the previous one with
//! the same id. Every firing carries the generation it was started with, so
//! an expiry already queued when its timer was stopped or restarted is
//! rejected by [`TimerScheduler::accept`]: cancellation takes effect
//! immediately, even for expiries in flight.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Purpose of a timer. At most one timer per purpose runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Scan → ready must finish within this window.
    Connection,
    /// Whole firmware transfer.
    OadTransfer,
    /// Headset-initiated audio pairing.
    A2dpConnection,
    /// Retries the battery read that completes finalization.
    FinalizeConnection,
    /// Waits for the external-name acknowledgement.
    ExternalName,
    /// One-shot battery read shortly after the session is ready.
    BatteryWarmup,
    BatteryPoll,
    /// Identity completeness check while finalizing.
    IdentityPoll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSpec {
    pub delay: Duration,
    /// Repeat every `period` after the first firing.
    pub period: Option<Duration>,
}

impl TimerSpec {
    pub fn once(delay: Duration) -> Self {
        Self { delay, period: None }
    }

    pub fn repeating(delay: Duration, period: Duration) -> Self {
        Self {
            delay,
            period: Some(period),
        }
    }

    pub fn every(period: Duration) -> Self {
        Self::repeating(period, period)
    }
}

/// A timer firing, as delivered on the scheduler channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpiry {
    pub id: TimerId,
    generation: u64,
}

struct Slot {
    generation: u64,
    repeating: bool,
    token: CancellationToken,
}

pub struct TimerScheduler {
    slots: HashMap<TimerId, Slot>,
    next_generation: u64,
    tx: mpsc::UnboundedSender<TimerExpiry>,
}

impl TimerScheduler {
    /// Create a scheduler and the receiver its expiries arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerExpiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            slots: HashMap::new(),
            next_generation: 0,
            tx,
        };
        (scheduler, rx)
    }

    /// Start (or restart) timer `id`. Must be called inside a tokio runtime.
    pub fn start(&mut self, id: TimerId, spec: TimerSpec) {
        self.stop(id);
        self.next_generation += 1;
        let generation = self.next_generation;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = self.tx.clone();
        debug!("Timer {id:?} started ({:?}, every {:?})", spec.delay, spec.period);

        tokio::spawn(async move {
            let expiry = TimerExpiry { id, generation };
            tokio::select! {
                _ = cancelled.cancelled() => return,
                _ = sleep(spec.delay) => {}
            }
            if tx.send(expiry).is_err() {
                return;
            }
            let Some(period) = spec.period else { return };

            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(expiry).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.slots.insert(
            id,
            Slot {
                generation,
                repeating: spec.period.is_some(),
                token,
            },
        );
    }

    /// Cancel timer `id`. Returns whether it was running.
    pub fn stop(&mut self, id: TimerId) -> bool {
        match self.slots.remove(&id) {
            Some(slot) => {
                slot.token.cancel();
                debug!("Timer {id:?} stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.token.cancel();
        }
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Validate an expiry read from the channel. Returns the timer id when
    /// the expiry belongs to the live timer for that id, `None` when it is
    /// stale. A one-shot timer stops running once accepted.
    pub fn accept(&mut self, expiry: TimerExpiry) -> Option<TimerId> {
        let slot = self.slots.get(&expiry.id)?;
        if slot.generation != expiry.generation {
            return None;
        }
        if !slot.repeating {
            self.slots.remove(&expiry.id);
        }
        Some(expiry.id)
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_after_delay() {
        let (mut timers, mut rx) = TimerScheduler::new();
        let started = Instant::now();
        timers.start(TimerId::Connection, TimerSpec::once(Duration::from_secs(20)));

        let expiry = rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert_eq!(timers.accept(expiry), Some(TimerId::Connection));
        assert!(!timers.is_running(TimerId::Connection));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_timer() {
        let (mut timers, mut rx) = TimerScheduler::new();
        let started = Instant::now();
        timers.start(TimerId::A2dpConnection, TimerSpec::once(Duration::from_secs(1)));
        timers.start(TimerId::A2dpConnection, TimerSpec::once(Duration::from_secs(10)));

        let expiry = rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(timers.accept(expiry), Some(TimerId::A2dpConnection));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_expiry_is_stale_after_stop() {
        let (mut timers, mut rx) = TimerScheduler::new();
        timers.start(TimerId::FinalizeConnection, TimerSpec::once(Duration::from_millis(5)));
        sleep(Duration::from_millis(10)).await;

        // Already in the channel, but the timer was cancelled since.
        assert!(timers.stop(TimerId::FinalizeConnection));
        let expiry = rx.recv().await.unwrap();
        assert_eq!(timers.accept(expiry), None);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_keeps_firing_until_stopped() {
        let (mut timers, mut rx) = TimerScheduler::new();
        let started = Instant::now();
        timers.start(
            TimerId::BatteryPoll,
            TimerSpec::repeating(Duration::from_secs(115), Duration::from_secs(120)),
        );

        for _ in 0..3 {
            let expiry = rx.recv().await.unwrap();
            assert_eq!(timers.accept(expiry), Some(TimerId::BatteryPoll));
        }
        assert!(started.elapsed() >= Duration::from_secs(115 + 240));
        assert!(timers.is_running(TimerId::BatteryPoll));

        timers.stop_all();
        assert!(!timers.is_running(TimerId::BatteryPoll));
        sleep(Duration::from_secs(500)).await;
        assert!(rx.try_recv().is_err());
    }
}
