//! Shared-memory plumbing between the local driver and the remote renderer.
//!
//! The crate owns three concerns:
//! - the [`Renderer`] collaborator boundary (region allocation, side-channel submission, sync
//!   waits),
//! - [`SharedRegion`], a reference-counted handle whose last drop releases the remote resource,
//! - [`SharedRegionPool`], which suballocates short-lived buffers out of one larger region.
//!
//! [`MemoryRenderer`] implements the collaborator on plain heap memory so the transport can be
//! exercised in-process.

pub mod error;
pub mod memory;
pub mod pool;
pub mod region;
pub mod renderer;

pub use error::{RendererError, Result, ShmemError};
pub use memory::{HeapMapping, MemoryRenderer, SubmittedBatch, MAPPING_ALIGN};
pub use pool::{PoolAllocation, SharedRegionPool};
pub use region::SharedRegion;
pub use renderer::{
    RawShmem, Renderer, RendererBatch, ShmemMapping, SyncPoint, WaitStatus, CONTROL_RING_IDX,
};
