//! Circuit breaker in front of the duplicate cache
//!
//! Lock-free: consecutive failures and the open timestamp are atomics
//! measured from the breaker's own epoch. After `threshold` consecutive
//! failures the breaker opens for `cooldown`. After the cooldown exactly one
//! caller is let through as a trial; its success closes the breaker and its
//! failure re-opens it. A trial that never reports is abandoned after
//! another cooldown.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const CLOSED: u64 = u64::MAX;
const NO_TRIAL: u64 = u64::MAX;

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    epoch: Instant,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch` when the breaker opened, `CLOSED` otherwise
    opened_at_ms: AtomicU64,
    /// Milliseconds since `epoch` when the half-open trial started
    trial_started_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            epoch: Instant::now(),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(CLOSED),
            trial_started_ms: AtomicU64::new(NO_TRIAL),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Whether less than a cooldown has passed since `since`, if set.
    fn cooling(&self, since: u64, now: u64) -> bool {
        since != u64::MAX && now.saturating_sub(since) < self.cooldown.as_millis() as u64
    }

    /// Whether a call may go through now. In the half-open state this
    /// claims the single trial slot.
    pub fn allow(&self) -> bool {
        let opened = self.opened_at_ms.load(Ordering::Acquire);
        if opened == CLOSED {
            return true;
        }
        let now = self.now_ms();
        if self.cooling(opened, now) {
            return false;
        }
        let trial = self.trial_started_ms.load(Ordering::Acquire);
        if self.cooling(trial, now) {
            return false;
        }
        self.trial_started_ms
            .compare_exchange(trial, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether calls are refused right now. Does not claim the trial.
    pub fn is_open(&self) -> bool {
        let opened = self.opened_at_ms.load(Ordering::Acquire);
        if opened == CLOSED {
            return false;
        }
        let now = self.now_ms();
        self.cooling(opened, now)
            || self.cooling(self.trial_started_ms.load(Ordering::Acquire), now)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_ms.store(CLOSED, Ordering::Release);
        self.trial_started_ms.store(NO_TRIAL, Ordering::Release);
    }

    /// Record a failure. Returns true if this failure opened the breaker.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.threshold {
            return false;
        }
        let now = self.now_ms();
        let previous = self.opened_at_ms.swap(now, Ordering::AcqRel);
        self.trial_started_ms.store(NO_TRIAL, Ordering::Release);
        previous == CLOSED
    }
}
