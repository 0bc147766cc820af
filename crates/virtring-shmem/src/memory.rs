//! In-process renderer backed by heap memory.
//!
//! Used by tests and by the simulated remote consumer: mappings are plain aligned heap
//! allocations, side-channel submissions are recorded, and sync points are counters that the
//! test signals explicitly.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::RendererError;
use crate::renderer::{RawShmem, Renderer, RendererBatch, ShmemMapping, SyncPoint, WaitStatus};

/// Alignment of every [`HeapMapping`]; matches the ring's cache-line field alignment.
pub const MAPPING_ALIGN: usize = 64;

/// Zero-initialised, cache-line aligned heap allocation.
pub struct HeapMapping {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: the allocation is owned by the mapping and only accessed through raw pointers whose
// synchronization is the caller's responsibility (atomics placed inside the mapping).
unsafe impl Send for HeapMapping {}
unsafe impl Sync for HeapMapping {}

impl HeapMapping {
    pub fn new(len: usize) -> Option<Self> {
        let layout = Layout::from_size_align(len.max(1), MAPPING_ALIGN).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout, len })
    }
}

impl Drop for HeapMapping {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl ShmemMapping for HeapMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// A side-channel submission captured by [`MemoryRenderer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedBatch {
    pub ring_idx: u32,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct MemoryState {
    next_res_id: u32,
    regions: HashMap<u32, Arc<HeapMapping>>,
    submissions: Vec<SubmittedBatch>,
    fail_allocations: usize,
    fail_submissions: usize,
    syncs: HashMap<u32, u64>,
    destroyed: u64,
}

/// [`Renderer`] implementation over heap memory.
#[derive(Default)]
pub struct MemoryRenderer {
    state: Mutex<MemoryState>,
    sync_signaled: Condvar,
}

impl MemoryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to [`Renderer::create_shmem`] fail with `OutOfMemory`.
    pub fn fail_next_allocations(&self, count: usize) {
        self.lock().fail_allocations = count;
    }

    /// Make the next `count` calls to [`Renderer::submit`] fail.
    pub fn fail_next_submissions(&self, count: usize) {
        self.lock().fail_submissions = count;
    }

    pub fn live_regions(&self) -> usize {
        self.lock().regions.len()
    }

    pub fn is_live(&self, res_id: u32) -> bool {
        self.lock().regions.contains_key(&res_id)
    }

    /// Number of regions destroyed so far.
    pub fn destroyed_regions(&self) -> u64 {
        self.lock().destroyed
    }

    /// Look up the mapping behind a live resource id, the way the remote side would.
    pub fn mapping(&self, res_id: u32) -> Option<Arc<dyn ShmemMapping>> {
        self.lock()
            .regions
            .get(&res_id)
            .map(|m| m.clone() as Arc<dyn ShmemMapping>)
    }

    /// Copy `out.len()` bytes out of resource `res_id`, as the remote would when dereferencing
    /// a command-stream descriptor.
    pub fn read_region(&self, res_id: u32, offset: usize, out: &mut [u8]) -> bool {
        let Some(mapping) = self.mapping(res_id) else {
            return false;
        };
        if offset.checked_add(out.len()).map_or(true, |end| end > mapping.len()) {
            return false;
        }
        // SAFETY: the range was bounds-checked and the mapping is kept alive by `mapping`.
        unsafe {
            core::ptr::copy_nonoverlapping(mapping.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        true
    }

    /// Write into resource `res_id`, as the remote would when producing a reply.
    pub fn write_region(&self, res_id: u32, offset: usize, data: &[u8]) -> bool {
        let Some(mapping) = self.mapping(res_id) else {
            return false;
        };
        if offset.checked_add(data.len()).map_or(true, |end| end > mapping.len()) {
            return false;
        }
        // SAFETY: the range was bounds-checked and the mapping is kept alive by `mapping`.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), mapping.as_ptr().add(offset), data.len());
        }
        true
    }

    pub fn submissions(&self) -> Vec<SubmittedBatch> {
        self.lock().submissions.clone()
    }

    pub fn take_submissions(&self) -> Vec<SubmittedBatch> {
        std::mem::take(&mut self.lock().submissions)
    }

    /// Advance a sync point, waking any [`Renderer::wait`] callers.
    pub fn signal_sync(&self, sync_id: u32, value: u64) {
        let mut state = self.lock();
        let cur = state.syncs.entry(sync_id).or_insert(0);
        *cur = (*cur).max(value);
        drop(state);
        self.sync_signaled.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn syncs_reached(state: &MemoryState, syncs: &[SyncPoint]) -> bool {
    syncs
        .iter()
        .all(|s| state.syncs.get(&s.sync_id).copied().unwrap_or(0) >= s.value)
}

impl Renderer for MemoryRenderer {
    fn create_shmem(&self, size: usize) -> Result<RawShmem, RendererError> {
        let mut state = self.lock();
        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;
            return Err(RendererError::OutOfMemory { size });
        }

        let mapping = Arc::new(HeapMapping::new(size).ok_or(RendererError::OutOfMemory { size })?);
        state.next_res_id = state.next_res_id.wrapping_add(1).max(1);
        while state.regions.contains_key(&state.next_res_id) {
            state.next_res_id = state.next_res_id.wrapping_add(1).max(1);
        }
        let res_id = state.next_res_id;
        state.regions.insert(res_id, mapping.clone());

        Ok(RawShmem { res_id, mapping })
    }

    fn destroy_shmem(&self, res_id: u32) {
        let mut state = self.lock();
        if state.regions.remove(&res_id).is_some() {
            state.destroyed += 1;
        } else {
            debug!(res_id, "destroy of unknown shared region");
        }
    }

    fn submit(&self, batches: &[RendererBatch<'_>]) -> Result<(), RendererError> {
        let mut state = self.lock();
        if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            return Err(RendererError::SubmitFailed("injected failure".into()));
        }
        state
            .submissions
            .extend(batches.iter().map(|b| SubmittedBatch {
                ring_idx: b.ring_idx,
                data: b.cs_data.to_vec(),
            }));
        Ok(())
    }

    fn wait(
        &self,
        syncs: &[SyncPoint],
        timeout: Option<Duration>,
    ) -> Result<WaitStatus, RendererError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if syncs_reached(&state, syncs) {
                return Ok(WaitStatus::Signaled);
            }
            state = match deadline {
                None => self
                    .sync_signaled
                    .wait(state)
                    .unwrap_or_else(|poison| poison.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitStatus::TimedOut);
                    }
                    self.sync_signaled
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poison| poison.into_inner())
                        .0
                }
            };
        }
    }
}
