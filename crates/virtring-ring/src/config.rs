use std::time::Duration;

use crate::backoff::{RelaxProfile, RelaxReason};

/// Backoff tuning per wait reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaxProfiles {
    pub ring_seqno: RelaxProfile,
    pub ring_space: RelaxProfile,
    pub roundtrip: RelaxProfile,
    pub sync: RelaxProfile,
}

impl RelaxProfiles {
    pub fn get(&self, reason: RelaxReason) -> RelaxProfile {
        match reason {
            RelaxReason::RingSeqno => self.ring_seqno,
            RelaxReason::RingSpace => self.ring_space,
            RelaxReason::Roundtrip => self.roundtrip,
            RelaxReason::Sync => self.sync,
        }
    }

    /// The same profile for every reason.
    pub fn uniform(profile: RelaxProfile) -> Self {
        Self {
            ring_seqno: profile,
            ring_space: profile,
            roundtrip: profile,
            sync: profile,
        }
    }
}

impl Default for RelaxProfiles {
    fn default() -> Self {
        Self {
            ring_seqno: RelaxProfile::RING_SEQNO,
            ..Self::uniform(RelaxProfile::default())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Circular buffer size in bytes. Must be a power of two.
    pub buffer_size: usize,
    /// Bytes of protocol side data after the buffer. The first `u32` is the roundtrip counter.
    pub extra_size: usize,
    /// Submissions up to `buffer_size >> direct_order` bytes are copied into the ring inline.
    pub direct_order: u32,
    /// Minimum size of the upload buffer used for oversized pointer-storage submissions.
    pub upload_min_size: usize,
    /// How long the remote keeps polling an empty ring before it sets `IDLE` and sleeps.
    pub idle_timeout: Duration,
    /// How often the remote reasserts `ALIVE`.
    pub report_period: Duration,
    pub profiles: RelaxProfiles,
    /// Never abort on watchdog expiry or the iteration threshold.
    pub no_abort: bool,
    /// Log every submission at debug level.
    pub log_submissions: bool,
    /// Copy oversized pointer-storage streams straight into the ring instead of uploading them.
    /// Streams larger than the buffer are rejected with `RingError::SubmissionTooLarge`.
    pub no_upload: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 128 * 1024,
            extra_size: 4,
            direct_order: 4,
            upload_min_size: 1024 * 1024,
            idle_timeout: Duration::from_millis(50),
            report_period: Duration::from_secs(3),
            profiles: RelaxProfiles::default(),
            no_abort: false,
            log_submissions: false,
            no_upload: false,
        }
    }
}

impl RingConfig {
    /// Largest submission copied into the ring inline.
    pub fn direct_size(&self) -> usize {
        self.buffer_size >> self.direct_order.min(usize::BITS - 1)
    }
}
