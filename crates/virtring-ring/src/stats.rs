use std::sync::atomic::{AtomicU64, Ordering};

/// Transport counters for one ring.
///
/// Updated under the submit lock but readable from any thread without it.
#[derive(Debug, Default)]
pub struct RingStats {
    direct_submits: AtomicU64,
    indirect_submits: AtomicU64,
    uploads: AtomicU64,
    notifies: AtomicU64,
    retired_submits: AtomicU64,
    bytes_written: AtomicU64,
}

impl RingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_direct_submits(&self) {
        self.direct_submits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_indirect_submits(&self) {
        self.indirect_submits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_uploads(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifies(&self) {
        self.notifies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retired_submits(&self, n: u64) {
        self.retired_submits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RingStatsSnapshot {
        RingStatsSnapshot {
            direct_submits: self.direct_submits.load(Ordering::Relaxed),
            indirect_submits: self.indirect_submits.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            notifies: self.notifies.load(Ordering::Relaxed),
            retired_submits: self.retired_submits.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStatsSnapshot {
    pub direct_submits: u64,
    pub indirect_submits: u64,
    /// Indirect submissions whose payload was first copied into the upload buffer.
    pub uploads: u64,
    pub notifies: u64,
    pub retired_submits: u64,
    /// Bytes written into the circular buffer, descriptors included.
    pub bytes_written: u64,
}
