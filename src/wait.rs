//! Blocking policy for queue operations
//!
//! The rings live in memory shared between processes, so there is nothing to
//! park on. Waiters spin briefly, then yield, then sleep with exponential
//! backoff until the deadline passes.

use std::time::{Duration, Instant};

/// Spins before the first yield
const SPIN_LIMIT: u32 = 64;

/// Yields before sleeping
const YIELD_LIMIT: u32 = 16;

const MIN_SLEEP: Duration = Duration::from_micros(10);
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// How long a `put` or `get` may wait for the complementary operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// Fail immediately if the operation cannot proceed.
    ///
    /// A ring cell claimed by a peer that has not published yet is waited
    /// on for a short bounded spin, so a `put` or `get` racing that peer does
    /// not report `Full`/`Empty` while later cells are ready.
    NonBlocking,
    /// Wait until the operation can proceed
    #[default]
    Forever,
    /// Wait at most this long
    Timeout(Duration),
}

impl Wait {
    /// Map the conventional `(block, timeout)` pair onto a policy.
    ///
    /// `block == false` ignores the timeout. A zero timeout is a single poll.
    pub fn from_flags(block: bool, timeout: Option<Duration>) -> Self {
        match (block, timeout) {
            (false, _) => Wait::NonBlocking,
            (true, None) => Wait::Forever,
            (true, Some(t)) if t.is_zero() => Wait::NonBlocking,
            (true, Some(t)) => Wait::Timeout(t),
        }
    }

    /// Fix the policy to an absolute deadline, starting now
    pub fn deadline(self) -> Deadline {
        match self {
            Wait::NonBlocking => Deadline::Now,
            Wait::Forever => Deadline::Never,
            Wait::Timeout(t) => match Instant::now().checked_add(t) {
                Some(at) => Deadline::At(at),
                None => Deadline::Never,
            },
        }
    }
}

/// A [`Wait`] policy pinned to a point in time.
///
/// One deadline covers every suspension point of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Now,
    Never,
    At(Instant),
}

impl Deadline {
    #[inline]
    pub fn expired(&self) -> bool {
        match self {
            Deadline::Now => true,
            Deadline::Never => false,
            Deadline::At(at) => Instant::now() >= *at,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::Now => Some(Duration::ZERO),
            Deadline::Never => None,
            Deadline::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// Retry `attempt` until it yields a value or the deadline passes.
    ///
    /// `attempt` always runs at least once, so `Deadline::Now` is a single
    /// non-blocking poll.
    pub fn poll<T>(&self, mut attempt: impl FnMut() -> Option<T>) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(value) = attempt() {
                return Some(value);
            }
            if self.expired() {
                return None;
            }
            backoff.snooze(self.remaining());
        }
    }
}

/// Spin, then yield, then sleep
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    sleep: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            step: 0,
            sleep: MIN_SLEEP,
        }
    }

    /// Back off once, never sleeping past `cap`
    pub fn snooze(&mut self, cap: Option<Duration>) {
        if self.step < SPIN_LIMIT {
            for _ in 0..(1u32 << (self.step / 8).min(6)) {
                core::hint::spin_loop();
            }
        } else if self.step < SPIN_LIMIT + YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let nap = match cap {
                Some(cap) => self.sleep.min(cap),
                None => self.sleep,
            };
            std::thread::sleep(nap);
            self.sleep = (self.sleep * 2).min(MAX_SLEEP);
        }
        self.step = self.step.saturating_add(1);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
