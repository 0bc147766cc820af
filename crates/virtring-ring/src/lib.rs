//! Shared-memory command ring between the local driver and a remote renderer.
//!
//! One producer (serialized by the ring's submit lock) writes command streams into a
//! power-of-two circular buffer and publishes `tail`; the remote consumer advances `head`.
//! Waiting is cooperative: every wait site drives a [`BackoffState`] that spins, sleeps with
//! exponential backoff and periodically checks the remote's liveness through the
//! [`Watchdog`].

pub mod backoff;
mod config;
mod error;
pub mod fatal;
pub mod layout;
mod reply;
mod ring;
pub mod shared;
mod stats;
mod status;
pub mod tracker;
pub mod watchdog;

/// In-process stand-in for the remote consumer.
///
/// Only available for this crate's own tests or with the `test-utils` feature.
#[cfg(any(test, feature = "test-utils"))]
pub mod sim;

pub use backoff::{BackoffState, RelaxAction, RelaxContext, RelaxProfile, RelaxReason, WaitPoll};
pub use config::{RelaxProfiles, RingConfig};
pub use error::{Result, RingError};
pub use fatal::{AbortHook, FatalDesync, FatalHandler};
pub use layout::RingLayout;
pub use reply::Reply;
pub use ring::{Ring, Submission};
pub use shared::RingShared;
pub use stats::{RingStats, RingStatsSnapshot};
pub use status::RingStatus;
pub use tracker::{roundtrip_seqno_ge, seqno_ge, PendingSubmit, SubmitTracker};
pub use watchdog::{Watchdog, WatchdogRegistry, WatcherId};
