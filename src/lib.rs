//! Command-stream transport between a local driver and a remote GPU renderer.
//!
//! An [`Instance`] owns one connection: a primary [`Ring`] in shared memory, pools that back
//! [`CommandEncoder`]s and replies, and the watchdog that detects a dead renderer. Small command
//! streams are copied into the ring; large ones stay in shared memory and are referenced from
//! the ring.
//!
//! The building blocks live in their own crates and are re-exported here:
//! - `virtring-shmem`: the [`Renderer`] boundary, [`SharedRegion`] and [`SharedRegionPool`],
//! - `virtring-cs`: [`CommandEncoder`], [`CommandDecoder`] and the control-command codec,
//! - `virtring-ring`: [`Ring`], waits and the watchdog.

mod config;
mod error;
mod instance;

pub use config::{DebugFlags, InstanceConfig, DEBUG_ENV, NO_ABORT_ENV, RING_SIZE_ENV};
pub use error::{InstanceError, Result};
pub use instance::Instance;

pub use virtring_cs::{
    protocol, CommandDecoder, CommandEncoder, CsError, DecodeError, EncoderConfig, StorageKind,
};
pub use virtring_ring::{
    AbortHook, BackoffState, FatalDesync, FatalHandler, RelaxAction, RelaxProfile, RelaxReason,
    Reply, Ring, RingConfig, RingError, RingStatus, Submission, WaitPoll, WatchdogRegistry,
};
pub use virtring_shmem::{
    MemoryRenderer, Renderer, RendererError, SharedRegion, SharedRegionPool, ShmemError,
    SyncPoint, WaitStatus,
};
