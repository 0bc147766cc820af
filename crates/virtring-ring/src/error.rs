use thiserror::Error;
use virtring_cs::CsError;
use virtring_shmem::{RendererError, ShmemError};

pub type Result<T> = std::result::Result<T, RingError>;

/// Recoverable ring failures. Fatal desynchronization never surfaces here; it aborts through
/// [`crate::FatalHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("out of memory allocating {size} bytes for ring submission")]
    OutOfMemory { size: usize },

    #[error("ring submission of {size} bytes exceeds the {buffer_size}-byte buffer")]
    SubmissionTooLarge { size: usize, buffer_size: usize },

    #[error("invalid ring layout: {0}")]
    InvalidLayout(String),

    #[error(transparent)]
    Cs(CsError),

    #[error(transparent)]
    Shmem(ShmemError),

    #[error(transparent)]
    Renderer(#[from] RendererError),
}

impl RingError {
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            RingError::OutOfMemory { .. } => true,
            RingError::Cs(err) => err.is_out_of_memory(),
            RingError::Shmem(err) => err.is_out_of_memory(),
            RingError::Renderer(err) => matches!(err, RendererError::OutOfMemory { .. }),
            RingError::InvalidLayout(_) | RingError::SubmissionTooLarge { .. } => false,
        }
    }
}

impl From<CsError> for RingError {
    fn from(err: CsError) -> Self {
        match err {
            CsError::OutOfMemory { size } => RingError::OutOfMemory { size },
            other => RingError::Cs(other),
        }
    }
}

impl From<ShmemError> for RingError {
    fn from(err: ShmemError) -> Self {
        match err {
            ShmemError::OutOfMemory { size } => RingError::OutOfMemory { size },
            other => RingError::Shmem(other),
        }
    }
}
