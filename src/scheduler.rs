//! Periodic tick source for the background actors
//!
//! A [`Ticker`] fires once per period plus a random delay of up to `jitter`.
//! Ticks that fall due while the owner is still busy are skipped instead of
//! queued, so an actor that runs its cycle inline never has two cycles in
//! flight and never bursts to catch up.

use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, Interval, MissedTickBehavior};

pub struct Ticker {
    interval: Interval,
    jitter: Duration,
    /// Deadline of a tick that fired but whose jitter delay has not elapsed yet
    pending: Option<Instant>,
}

impl Ticker {
    /// The first tick completes immediately (plus jitter).
    pub fn new(period: Duration, jitter: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            interval,
            jitter,
            pending: None,
        }
    }

    /// Wait for the next tick.
    ///
    /// Cancel safe: a tick interrupted during its jitter delay resumes on the
    /// next call instead of being lost, which matters inside `tokio::select!`.
    pub async fn tick(&mut self) {
        let deadline = match self.pending {
            Some(deadline) => deadline,
            None => {
                let fired = self.interval.tick().await;
                let deadline = fired + self.next_jitter();
                self.pending = Some(deadline);
                deadline
            }
        };

        tokio::time::sleep_until(deadline).await;
        self.pending = None;
    }

    fn next_jitter(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}
