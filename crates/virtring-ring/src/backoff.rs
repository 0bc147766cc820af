//! Spin-then-sleep waiting with liveness checks.
//!
//! There is no OS primitive to block on when the other end of the ring is a separate process
//! or VM, so every wait site polls shared memory. [`BackoffState`] is the explicit state machine
//! behind those polls: it decides how long to back off after each failed check and escalates to
//! a [`FatalDesync`] when the remote is dead. It never sleeps by itself; callers receive a
//! [`RelaxAction`] and perform it however their scheduler likes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::fatal::FatalDesync;
use crate::status::RingStatus;
use crate::watchdog::{WatchdogRegistry, WatcherId};

/// Tuning of one wait site. All thresholds are log2 of an iteration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaxProfile {
    pub base_sleep_us: u32,
    /// Iterations below `2^busy_wait_order` only yield.
    pub busy_wait_order: u32,
    /// Every `2^warn_order` iterations a diagnostic is logged and the remote is checked.
    pub warn_order: u32,
    /// Waits give up after `2^abort_order` iterations.
    pub abort_order: u32,
}

impl RelaxProfile {
    /// Waits on the ring head, which usually moves within microseconds.
    pub const RING_SEQNO: Self = Self {
        base_sleep_us: 10,
        busy_wait_order: 4,
        warn_order: 12,
        abort_order: 16,
    };

    fn sleep_for(&self, iter: u64) -> Duration {
        let last_bit = u64::BITS - iter.leading_zeros();
        let shift = last_bit
            .saturating_sub(self.busy_wait_order + 1)
            .min(self.abort_order.saturating_sub(self.busy_wait_order));
        Duration::from_micros(u64::from(self.base_sleep_us) << shift.min(32))
    }
}

impl Default for RelaxProfile {
    fn default() -> Self {
        Self {
            base_sleep_us: 160,
            busy_wait_order: 8,
            warn_order: 12,
            abort_order: 16,
        }
    }
}

/// What a wait is blocked on. Picks the profile and labels diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelaxReason {
    RingSeqno,
    RingSpace,
    Roundtrip,
    Sync,
}

impl RelaxReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RelaxReason::RingSeqno => "ring seqno",
            RelaxReason::RingSpace => "ring space",
            RelaxReason::Roundtrip => "roundtrip",
            RelaxReason::Sync => "sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaxAction {
    Yield,
    Sleep(Duration),
}

impl RelaxAction {
    /// Carry out the action on the calling thread.
    pub fn perform(self) {
        match self {
            RelaxAction::Yield => thread::yield_now(),
            RelaxAction::Sleep(d) => thread::sleep(d),
        }
    }
}

/// Result of one poll of a wait condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitPoll<T> {
    Ready(T),
    /// Not yet; back off as indicated and poll again.
    Pending(RelaxAction),
    /// The remote is gone. The caller must abort.
    Fatal(FatalDesync),
}

/// Shared state a wait consults while backing off.
#[derive(Debug, Clone, Copy)]
pub struct RelaxContext<'a> {
    /// The ring status word.
    pub status: &'a AtomicU32,
    pub registry: &'a WatchdogRegistry,
    /// Keep waiting past the watchdog and iteration thresholds.
    pub no_abort: bool,
}

/// Iteration state of one in-progress wait.
///
/// Dropping it gives up watchdog ownership if this wait took it.
#[derive(Debug)]
pub struct BackoffState<'a> {
    reason: RelaxReason,
    profile: RelaxProfile,
    ctx: RelaxContext<'a>,
    watcher: WatcherId,
    iter: u64,
}

impl<'a> BackoffState<'a> {
    /// Start a wait. If no other thread watches the remote, this wait takes over and clears
    /// `ALIVE`, so the remote has to reassert it before the first warn period.
    pub fn new(reason: RelaxReason, profile: RelaxProfile, ctx: RelaxContext<'a>) -> Self {
        let state = Self {
            reason,
            profile,
            ctx,
            watcher: ctx.registry.current(),
            iter: 0,
        };
        state.sample_liveness(true);
        state
    }

    pub fn reason(&self) -> RelaxReason {
        self.reason
    }

    /// Failed checks so far.
    pub fn iter(&self) -> u64 {
        self.iter
    }

    /// Account for one failed check and decide what to do before the next one.
    pub fn relax(&mut self) -> Result<RelaxAction, FatalDesync> {
        self.iter += 1;
        let iter = self.iter;
        let p = self.profile;

        if iter < 1u64 << p.busy_wait_order.min(63) {
            return Ok(RelaxAction::Yield);
        }

        let warn_period = 1u64 << p.warn_order.min(63);
        if iter % warn_period == 0 {
            warn!(reason = self.reason.as_str(), iter, "slow wait on ring");

            let status = RingStatus::from_bits_retain(self.ctx.status.load(Ordering::SeqCst));
            if status.contains(RingStatus::FATAL) {
                return Err(FatalDesync::RingFatal { iter });
            }

            self.sample_liveness(status.contains(RingStatus::ALIVE));

            if !self.ctx.no_abort {
                if self.ctx.registry.watchdog().timed_out() {
                    return Err(FatalDesync::WatchdogExpired { iter });
                }
                if iter >= 1u64 << p.abort_order.min(63) {
                    return Err(FatalDesync::AbortThreshold { iter });
                }
            }
        }

        Ok(RelaxAction::Sleep(p.sleep_for(iter)))
    }

    /// Run `check` once; on failure account for it and report how to back off.
    pub fn poll<T>(&mut self, check: impl FnOnce() -> Option<T>) -> WaitPoll<T> {
        match check() {
            Some(v) => WaitPoll::Ready(v),
            None => match self.relax() {
                Ok(action) => WaitPoll::Pending(action),
                Err(fatal) => WaitPoll::Fatal(fatal),
            },
        }
    }

    /// Record `alive` as watchdog owner, then clear the heartbeat for the next period. A
    /// non-owner leaves both alone.
    fn sample_liveness(&self, alive: bool) {
        if self.ctx.registry.watchdog().acquire(self.watcher, alive) {
            self.ctx
                .status
                .fetch_and(!RingStatus::ALIVE.bits(), Ordering::SeqCst);
        }
    }
}

impl Drop for BackoffState<'_> {
    fn drop(&mut self) {
        self.ctx.registry.watchdog().release(self.watcher);
    }
}
