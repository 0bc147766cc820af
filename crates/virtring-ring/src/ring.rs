//! Producer side of the ring: submission, retirement and waits.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};
use virtring_cs::protocol::{
    CommandStreamDescription, ControlCommand, COMMAND_HEADER_SIZE,
    COMMAND_STREAM_DESCRIPTION_SIZE,
};
use virtring_cs::{CommandEncoder, CsError, EncoderConfig, StorageKind};
use virtring_shmem::{PoolAllocation, Renderer, SharedRegion, SharedRegionPool};

use crate::backoff::{BackoffState, RelaxContext, RelaxReason, WaitPoll};
use crate::config::RingConfig;
use crate::error::{Result, RingError};
use crate::fatal::{FatalDesync, FatalHandler};
use crate::layout::RingLayout;
use crate::reply::Reply;
use crate::shared::RingShared;
use crate::stats::RingStats;
use crate::status::RingStatus;
use crate::tracker::{roundtrip_seqno_ge, seqno_ge, SubmitTracker};
use crate::watchdog::WatchdogRegistry;

/// Outcome of one ring submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// Ring position right after the submission; wait for it with [`Ring::wait_seqno`].
    pub seqno: u32,
    /// The remote was idle and a `NotifyRing` was sent.
    pub notified: bool,
    /// The payload went out of band, described by an `ExecuteCommandStreams` record.
    pub indirect: bool,
}

struct RingState {
    cur: u32,
    tracker: SubmitTracker,
    /// Staging area for oversized pointer-storage streams.
    upload: CommandEncoder,
}

/// A command ring shared with the remote renderer.
///
/// Submissions from any number of threads are serialized by an internal lock. Waits never take
/// that lock.
pub struct Ring {
    id: u64,
    renderer: Arc<dyn Renderer>,
    registry: Arc<WatchdogRegistry>,
    fatal: FatalHandler,
    config: RingConfig,
    shmem: SharedRegion,
    shared: RingShared,
    direct_size: usize,
    /// Copy of `RingState::cur` readable without the lock.
    cur: AtomicU32,
    state: Mutex<RingState>,
    stats: RingStats,
}

impl Ring {
    /// Allocate the ring's shared block and announce it to the remote with `CreateRing`.
    pub fn create(
        renderer: Arc<dyn Renderer>,
        registry: Arc<WatchdogRegistry>,
        fatal: FatalHandler,
        id: u64,
        config: RingConfig,
    ) -> Result<Self> {
        if config.extra_size < 4 {
            return Err(RingError::InvalidLayout(
                "extra region must hold the roundtrip counter".into(),
            ));
        }
        let layout = RingLayout::new(config.buffer_size, config.extra_size)?;
        let shmem = SharedRegion::create(&renderer, layout.shmem_size)?;
        shmem.fill_zero(0, layout.shmem_size);
        let shared = RingShared::new(shmem.mapping(), layout)?;

        let info = layout.create_info(
            id,
            shmem.res_id(),
            u64::try_from(config.idle_timeout.as_nanos()).unwrap_or(u64::MAX),
            u32::try_from(config.report_period.as_micros()).unwrap_or(u32::MAX),
        );
        renderer.submit_simple(&ControlCommand::CreateRing(info).to_bytes()?)?;
        debug!(
            ring_id = id,
            res_id = shmem.res_id(),
            buffer_size = layout.buffer_size,
            "created ring"
        );

        let upload = CommandEncoder::shmem_array(
            renderer.clone(),
            EncoderConfig {
                min_buffer_size: config.upload_min_size,
                ..EncoderConfig::default()
            },
        );

        Ok(Self {
            id,
            renderer,
            registry,
            fatal,
            direct_size: config.direct_size(),
            config,
            shmem,
            shared,
            cur: AtomicU32::new(0),
            state: Mutex::new(RingState {
                cur: 0,
                tracker: SubmitTracker::new(),
                upload,
            }),
            stats: RingStats::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn layout(&self) -> &RingLayout {
        self.shared.layout()
    }

    /// The ring's shared block.
    pub fn shmem(&self) -> &SharedRegion {
        &self.shmem
    }

    pub fn shared(&self) -> &RingShared {
        &self.shared
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Largest stream [`Ring::submit_command`] copies into the ring inline.
    pub fn direct_size(&self) -> usize {
        self.direct_size
    }

    pub fn stats(&self) -> &RingStats {
        &self.stats
    }

    /// Local write position: the seqno of the latest submission.
    pub fn cur(&self) -> u32 {
        self.cur.load(Ordering::Acquire)
    }

    pub fn load_head(&self) -> u32 {
        self.shared.head().load(Ordering::Acquire)
    }

    pub fn load_tail(&self) -> u32 {
        self.shared.tail().load(Ordering::Relaxed)
    }

    pub fn load_status(&self) -> RingStatus {
        RingStatus::from_bits_retain(self.shared.status().load(Ordering::SeqCst))
    }

    /// Submissions whose regions are still held.
    pub fn pending_count(&self) -> usize {
        self.lock().tracker.len()
    }

    /// [`seqno_ge`] against the current write position.
    pub fn seqno_ge(&self, a: u32, b: u32) -> bool {
        seqno_ge(self.cur(), a, b)
    }

    /// Whether the remote has consumed everything up to `seqno`.
    pub fn seqno_reached(&self, seqno: u32) -> bool {
        self.seqno_ge(self.load_head(), seqno)
    }

    /// Fresh backoff state for a wait on this ring.
    pub fn backoff(&self, reason: RelaxReason) -> BackoffState<'_> {
        BackoffState::new(
            reason,
            self.config.profiles.get(reason),
            RelaxContext {
                status: self.shared.status(),
                registry: &self.registry,
                no_abort: self.config.no_abort,
            },
        )
    }

    /// Copy `enc` into the ring inline regardless of its size.
    ///
    /// Fails with [`RingError::SubmissionTooLarge`] if the stream is larger than the ring
    /// buffer.
    pub fn submit_direct(&self, enc: &mut CommandEncoder) -> Result<Submission> {
        self.submit_encoder(enc, true, None)
    }

    /// Submit `enc`, inline if it is small and out of band otherwise.
    pub fn submit_command(&self, enc: &mut CommandEncoder) -> Result<Submission> {
        self.submit_encoder(enc, false, None)
    }

    /// Submit `enc` with its replies directed to a fresh `reply_size`-byte allocation from
    /// `reply_pool`, then wait until the remote has consumed it.
    ///
    /// On failure the reply allocation is released without waiting.
    pub fn submit_command_with_reply(
        &self,
        enc: &mut CommandEncoder,
        reply_pool: &SharedRegionPool,
        reply_size: usize,
    ) -> Result<Reply> {
        let alloc = reply_pool.alloc(reply_size)?;
        let submission = self.submit_encoder(enc, false, Some(&alloc))?;
        self.wait_seqno(submission.seqno);
        Ok(Reply::new(
            alloc.region,
            alloc.offset,
            reply_size,
            submission.seqno,
        ))
    }

    fn submit_encoder(
        &self,
        enc: &mut CommandEncoder,
        force_direct: bool,
        reply: Option<&PoolAllocation>,
    ) -> Result<Submission> {
        enc.commit();
        if enc.is_fatal() {
            return Err(RingError::Cs(CsError::Fatal));
        }
        let enc = &*enc;

        let set_reply = reply
            .map(|alloc| {
                ControlCommand::SetReplyCommandStream(CommandStreamDescription {
                    res_id: alloc.region.res_id(),
                    offset: alloc.offset as u64,
                    size: alloc.size as u64,
                })
                .to_bytes()
            })
            .transpose()?;

        let len = enc.len();
        let direct = force_direct
            || len <= self.direct_size
            || (self.config.no_upload && enc.storage_kind() == StorageKind::Pointer);

        let mut state = self.lock();

        let (execute, mut shmems) = if direct {
            (None, Vec::new())
        } else {
            let reserved = set_reply.as_ref().map_or(0, Vec::len);
            let (descs, shmems) = self.prepare_indirect(&mut state, enc, reserved)?;
            (
                Some(ControlCommand::ExecuteCommandStreams(descs).to_bytes()?),
                shmems,
            )
        };
        shmems.extend(reply.map(|alloc| alloc.region.clone()));

        let mut chunks: Vec<&[u8]> = Vec::new();
        chunks.extend(set_reply.as_deref());
        match &execute {
            Some(cmd) => chunks.push(cmd),
            None => chunks.extend(enc.committed_chunks().map(|chunk| chunk.bytes)),
        }

        let (seqno, notify) = self.submit_locked(&mut state, &chunks, shmems)?;
        drop(state);

        if direct {
            self.stats.inc_direct_submits();
        } else {
            self.stats.inc_indirect_submits();
        }
        if self.config.log_submissions {
            debug!(ring_id = self.id, seqno, len, direct, "ring submission");
        } else {
            trace!(ring_id = self.id, seqno, len, direct, "ring submission");
        }

        if notify {
            self.notify(seqno);
        }
        Ok(Submission {
            seqno,
            notified: notify,
            indirect: !direct,
        })
    }

    /// Describe `enc` as out-of-band streams.
    ///
    /// Pointer storage is staged in the upload buffer, and so is shared-memory storage split
    /// into more chunks than an `ExecuteCommandStreams` record next to `reserved` bytes can
    /// describe within the ring buffer.
    fn prepare_indirect(
        &self,
        state: &mut RingState,
        enc: &CommandEncoder,
        reserved: usize,
    ) -> Result<(Vec<CommandStreamDescription>, Vec<SharedRegion>)> {
        let chunks = enc.committed_chunks().count();
        let record_size = COMMAND_HEADER_SIZE + 4 + chunks * COMMAND_STREAM_DESCRIPTION_SIZE;
        let stage = enc.storage_kind() == StorageKind::Pointer
            || reserved + record_size > self.layout().buffer_size;

        let source = if stage {
            self.stage_upload(&mut state.upload, enc)?;
            debug!(ring_id = self.id, len = enc.len(), chunks, "staged stream for upload");
            &state.upload
        } else {
            enc
        };

        let mut descs = Vec::new();
        let mut shmems: Vec<SharedRegion> = Vec::new();
        for chunk in source.committed_chunks() {
            let Some(region) = chunk.shmem else {
                continue;
            };
            descs.push(CommandStreamDescription {
                res_id: region.res_id(),
                offset: chunk.offset as u64,
                size: chunk.bytes.len() as u64,
            });
            if !shmems.iter().any(|r| r.same_region(region)) {
                shmems.push(region.clone());
            }
        }
        Ok((descs, shmems))
    }

    /// Copy every committed chunk of `enc` into one contiguous upload buffer.
    fn stage_upload(&self, upload: &mut CommandEncoder, enc: &CommandEncoder) -> Result<()> {
        upload.reset();
        if let Err(err) = upload.reserve(enc.len()) {
            upload.reset();
            return Err(err.into());
        }
        for chunk in enc.committed_chunks() {
            upload.write(chunk.bytes);
        }
        upload.commit();
        self.stats.inc_uploads();
        Ok(())
    }

    /// Copy `chunks` into the buffer, publish them and record the submission.
    ///
    /// Returns the new seqno and whether the remote asked to be notified. Nothing is written
    /// if the chunks could never fit in the buffer.
    fn submit_locked(
        &self,
        state: &mut RingState,
        chunks: &[&[u8]],
        shmems: Vec<SharedRegion>,
    ) -> Result<(u32, bool)> {
        let buffer_size = self.layout().buffer_size;
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        if total > buffer_size {
            return Err(RingError::SubmissionTooLarge {
                size: total,
                buffer_size,
            });
        }

        let mut cur = state.cur;
        let mut head = self.load_head();
        for chunk in chunks {
            head = self.wait_space(cur, chunk.len());
            self.shared.write_buffer(cur, chunk);
            cur = cur.wrapping_add(chunk.len() as u32);
        }

        self.shared.tail().store(cur, Ordering::Release);
        state.cur = cur;
        self.cur.store(cur, Ordering::Release);
        self.stats.add_bytes_written(total as u64);

        let status = self.load_status();
        if status.contains(RingStatus::FATAL) {
            self.fatal.abort(&FatalDesync::SubmitFatal);
        }

        let retired = state.tracker.retire(cur, head);
        if retired > 0 {
            self.stats.add_retired_submits(retired as u64);
            trace!(ring_id = self.id, retired, head, "retired ring submissions");
        }
        state.tracker.push(cur, shmems);

        Ok((cur, status.contains(RingStatus::IDLE)))
    }

    /// Wait until `size` bytes can be written at `cur`. Returns the head that allowed it.
    fn wait_space(&self, cur: u32, size: usize) -> u32 {
        let buffer_size = self.layout().buffer_size;
        let fits = |head: u32| {
            cur.wrapping_add(size as u32).wrapping_sub(head) as usize <= buffer_size
        };
        self.wait_until(RelaxReason::RingSpace, || {
            let head = self.load_head();
            fits(head).then_some(head)
        })
    }

    fn notify(&self, seqno: u32) {
        self.stats.inc_notifies();
        let result = ControlCommand::NotifyRing {
            ring_id: self.id,
            seqno,
            flags: 0,
        }
        .to_bytes()
        .map_err(RingError::from)
        .and_then(|bytes| self.renderer.submit_simple(&bytes).map_err(RingError::from));

        match result {
            Ok(()) => debug!(ring_id = self.id, seqno, "notified idle ring"),
            Err(err) => warn!(ring_id = self.id, seqno, error = %err, "failed to notify idle ring"),
        }
    }

    /// Release the regions of every submission the remote has consumed.
    pub fn retire(&self) -> usize {
        let mut state = self.lock();
        let cur = state.cur;
        let retired = state.tracker.retire(cur, self.load_head());
        self.stats.add_retired_submits(retired as u64);
        retired
    }

    /// Block until the remote has consumed everything up to `seqno`.
    pub fn wait_seqno(&self, seqno: u32) {
        self.wait_until(RelaxReason::RingSeqno, || self.seqno_reached(seqno).then_some(()))
    }

    /// One non-blocking step of [`Ring::wait_seqno`].
    pub fn poll_seqno(&self, seqno: u32, state: &mut BackoffState<'_>) -> WaitPoll<()> {
        state.poll(|| self.seqno_reached(seqno).then_some(()))
    }

    /// Block until everything published so far has been consumed.
    pub fn wait_all(&self) {
        self.wait_seqno(self.load_tail());
    }

    /// The roundtrip counter the remote advances for `SubmitVirtqueueSeqno`.
    pub fn roundtrip_seqno(&self) -> u32 {
        self.shared
            .extra_u32(0)
            .map_or(0, |word| word.load(Ordering::Acquire))
    }

    /// Block until the remote has processed roundtrip `seqno`.
    pub fn wait_roundtrip(&self, seqno: u32) {
        self.wait_until(RelaxReason::Roundtrip, || {
            roundtrip_seqno_ge(self.roundtrip_seqno(), seqno).then_some(())
        })
    }

    /// Poll `check` with backoff until it yields a value. Aborts the process on a fatal
    /// desynchronization.
    pub fn wait_until<T>(&self, reason: RelaxReason, mut check: impl FnMut() -> Option<T>) -> T {
        if let Some(v) = check() {
            return v;
        }
        let mut state = self.backoff(reason);
        loop {
            match state.poll(&mut check) {
                WaitPoll::Ready(v) => return v,
                WaitPoll::Pending(action) => action.perform(),
                WaitPoll::Fatal(desync) => self.fatal.abort(&desync),
            }
        }
    }

    /// Wait for the remote to drain the ring, then tear it down.
    pub fn destroy(self) {
        self.wait_all();
        self.retire();
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poison| poison.into_inner());
        let dropped = state.tracker.retire_all();
        if dropped > 0 {
            debug!(ring_id = self.id, dropped, "destroying ring with unconsumed submissions");
        }

        let result = ControlCommand::DestroyRing { ring_id: self.id }
            .to_bytes()
            .map_err(RingError::from)
            .and_then(|bytes| self.renderer.submit_simple(&bytes).map_err(RingError::from));
        match result {
            Ok(()) => debug!(ring_id = self.id, "destroyed ring"),
            Err(err) => warn!(ring_id = self.id, error = %err, "failed to destroy ring"),
        }
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("id", &self.id)
            .field("res_id", &self.shmem.res_id())
            .field("cur", &self.cur())
            .field("head", &self.load_head())
            .field("status", &self.load_status())
            .finish_non_exhaustive()
    }
}
