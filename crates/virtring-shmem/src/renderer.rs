use std::sync::Arc;
use std::time::Duration;

use crate::error::RendererError;

/// Timeline index used for side-channel control messages (ring creation, notify, roundtrip).
pub const CONTROL_RING_IDX: u32 = 0;

/// Local mapping of a renderer-visible shared-memory resource.
///
/// The mapping must stay valid (and must not move) for as long as the value is alive. Both the
/// local process and the remote renderer may access the bytes concurrently; callers coordinate
/// through atomics placed inside the mapping.
pub trait ShmemMapping: Send + Sync {
    fn as_ptr(&self) -> *mut u8;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A freshly created renderer resource plus its local mapping.
pub struct RawShmem {
    pub res_id: u32,
    pub mapping: Arc<dyn ShmemMapping>,
}

/// One unit of side-channel submission.
#[derive(Debug, Clone, Copy)]
pub struct RendererBatch<'a> {
    /// Serialized command bytes.
    pub cs_data: &'a [u8],
    /// Target timeline.
    pub ring_idx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncPoint {
    pub sync_id: u32,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

/// Boundary between the transport core and the OS/driver layer that talks to the renderer.
///
/// Implementations may be backed by:
/// - a virtio-gpu style kernel interface (ioctl submission, blob mappings),
/// - a socket to an out-of-process renderer, or
/// - plain heap memory for in-process testing ([`crate::MemoryRenderer`]).
///
/// Every call may fail; the transport never retries silently.
pub trait Renderer: Send + Sync {
    /// Create a shared-memory resource of at least `size` bytes and map it locally.
    fn create_shmem(&self, size: usize) -> Result<RawShmem, RendererError>;

    /// Release a resource previously returned by [`Renderer::create_shmem`].
    ///
    /// Called exactly once per resource, when the last [`crate::SharedRegion`] reference drops.
    fn destroy_shmem(&self, res_id: u32);

    /// Submit raw command bytes outside of any ring.
    fn submit(&self, batches: &[RendererBatch<'_>]) -> Result<(), RendererError>;

    /// Block until every sync point is reached or `timeout` elapses. `None` waits forever.
    fn wait(
        &self,
        syncs: &[SyncPoint],
        timeout: Option<Duration>,
    ) -> Result<WaitStatus, RendererError>;

    /// Submit one small control message on [`CONTROL_RING_IDX`].
    fn submit_simple(&self, cs_data: &[u8]) -> Result<(), RendererError> {
        self.submit(&[RendererBatch {
            cs_data,
            ring_idx: CONTROL_RING_IDX,
        }])
    }
}
