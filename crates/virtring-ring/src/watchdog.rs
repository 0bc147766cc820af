//! Single-owner liveness monitor for the remote renderer.
//!
//! Many threads may be stuck in ring waits at once. Only one of them, the owner, samples the
//! remote's `ALIVE` heartbeat and clears it for the next period; the others just read the
//! verdict. Without a single owner, concurrent clears would race with the remote's reassertion
//! and could mask a genuine hang or report a false one.

use std::num::NonZeroU64;

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::{AtomicBool, AtomicU64};
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::{AtomicBool, AtomicU64};

use std::sync::atomic::Ordering;

static NEXT_WATCHER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

thread_local! {
    static CURRENT_WATCHER: WatcherId = WatcherId::next();
}

/// Identity of a thread taking part in watchdog ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(NonZeroU64);

impl WatcherId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Id of the calling thread, assigned on first use. Ids are never reused.
    pub fn current() -> Self {
        CURRENT_WATCHER.with(|id| *id)
    }

    fn next() -> Self {
        let raw = NEXT_WATCHER.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }
}

#[derive(Debug)]
pub struct Watchdog {
    /// Current owner, 0 when unowned. Acts as a try-lock.
    owner: AtomicU64,
    /// Last liveness sample taken by an owner.
    alive: AtomicBool,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        }
    }

    /// Become (or stay) the owner and record `alive`.
    ///
    /// Returns `false` without touching the liveness sample when another watcher owns the
    /// watchdog.
    pub fn acquire(&self, id: WatcherId, alive: bool) -> bool {
        let id = id.get();
        let owner = self.owner.load(Ordering::Acquire);
        if owner != id
            && (owner != 0
                || self
                    .owner
                    .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
                    .is_err())
        {
            return false;
        }
        self.alive.store(alive, Ordering::Release);
        true
    }

    /// Give up ownership if `id` holds it.
    pub fn release(&self, id: WatcherId) {
        let _ = self
            .owner
            .compare_exchange(id.get(), 0, Ordering::AcqRel, Ordering::Relaxed);
    }

    pub fn owner(&self) -> Option<WatcherId> {
        WatcherId::new(self.owner.load(Ordering::Acquire))
    }

    /// Whether the owner's last sample saw the remote silent for a whole period.
    pub fn timed_out(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }
}

/// Per-process watchdog, owned on behalf of the calling thread.
///
/// Created once and shared (by `Arc`) with every ring of an instance; there is no global.
#[derive(Debug, Default)]
pub struct WatchdogRegistry {
    watchdog: Watchdog,
}

impl WatchdogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Id of the calling thread.
    pub fn current(&self) -> WatcherId {
        WatcherId::current()
    }

    /// [`Watchdog::acquire`] on behalf of the calling thread.
    pub fn acquire(&self, alive: bool) -> bool {
        self.watchdog.acquire(self.current(), alive)
    }

    /// [`Watchdog::release`] on behalf of the calling thread.
    pub fn release(&self) {
        self.watchdog.release(self.current());
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn id(raw: u64) -> WatcherId {
        WatcherId::new(raw).unwrap()
    }

    #[test]
    fn first_acquirer_owns_until_release() {
        let wd = Watchdog::new();
        assert!(!wd.timed_out());

        assert!(wd.acquire(id(1), true));
        assert!(wd.acquire(id(1), true));
        assert!(!wd.acquire(id(2), false));
        // The loser's sample was ignored.
        assert!(!wd.timed_out());

        wd.release(id(2));
        assert_eq!(wd.owner(), Some(id(1)));
        wd.release(id(1));
        assert_eq!(wd.owner(), None);

        assert!(wd.acquire(id(2), false));
        assert!(wd.timed_out());
    }

    #[test]
    fn registry_ids_are_stable_per_thread() {
        let reg = Arc::new(WatchdogRegistry::new());
        let here = reg.current();
        assert_eq!(reg.current(), here);

        let other = {
            let reg = reg.clone();
            thread::spawn(move || reg.current()).join().unwrap()
        };
        assert_ne!(other, here);
    }

    #[test]
    fn watcher_ids_follow_the_thread_not_the_registry() {
        let a = WatchdogRegistry::new();
        let b = WatchdogRegistry::new();
        assert_eq!(a.current(), b.current());
        assert_eq!(a.current(), WatcherId::current());

        let ids: HashSet<WatcherId> = (0..16)
            .map(|_| thread::spawn(WatcherId::current))
            .map(|t| t.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 16);
        assert!(!ids.contains(&WatcherId::current()));
    }

    #[test]
    fn concurrent_acquire_has_one_owner() {
        let wd = Arc::new(Watchdog::new());
        let owners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (1..=8u64)
            .map(|raw| {
                let wd = wd.clone();
                let owners = owners.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        if wd.acquire(id(raw), true) {
                            let n = owners.fetch_add(1, Ordering::SeqCst) + 1;
                            assert_eq!(n, 1, "two watchdog owners at once");
                            assert_eq!(wd.owner(), Some(id(raw)));
                            owners.fetch_sub(1, Ordering::SeqCst);
                            wd.release(id(raw));
                        }
                        thread::yield_now();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(wd.owner(), None);
    }
}
