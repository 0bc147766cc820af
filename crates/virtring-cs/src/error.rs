use thiserror::Error;
use virtring_shmem::ShmemError;

pub type Result<T> = std::result::Result<T, CsError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsError {
    #[error("out of memory reserving {size} bytes of command stream")]
    OutOfMemory { size: usize },

    #[error("fixed command buffer cannot hold {requested} bytes ({remaining} left)")]
    FixedCapacity { requested: usize, remaining: usize },

    /// A previous reservation failed; the encoder refuses further work until reset.
    #[error("command encoder is in a fatal error state")]
    Fatal,

    #[error(transparent)]
    Shmem(ShmemError),
}

impl CsError {
    pub(crate) fn from_shmem(err: ShmemError, size: usize) -> Self {
        if err.is_out_of_memory() {
            CsError::OutOfMemory { size }
        } else {
            CsError::Shmem(err)
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        match self {
            CsError::OutOfMemory { .. } => true,
            CsError::Shmem(err) => err.is_out_of_memory(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("command stream truncated: need {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("command decoder is in a fatal error state")]
    Fatal,

    #[error("unknown command type {0}")]
    UnknownCommand(u32),

    #[error("{0} trailing bytes after command")]
    TrailingBytes(usize),
}
