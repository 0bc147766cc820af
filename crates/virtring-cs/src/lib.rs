//! Command-stream encoding.
//!
//! [`CommandEncoder`] accumulates serialized calls in one or more buffers, either a fixed local
//! buffer or growable shared memory. [`CommandDecoder`] reads replies back. [`protocol`] holds
//! the transport's own control commands (ring setup, notify, indirect submission).

mod decoder;
mod encoder;
mod error;
pub mod protocol;

pub use decoder::CommandDecoder;
pub use encoder::{CommandEncoder, CommittedChunk, EncoderConfig, EncoderStorage, StorageKind};
pub use error::{CsError, DecodeError, Result};
