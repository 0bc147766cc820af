use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShmemError>;

/// Failures reported by a [`crate::Renderer`] implementation.
///
/// The transport treats every collaborator call as potentially failing; only
/// [`RendererError::OutOfMemory`] has a dedicated recovery story (it surfaces as an
/// allocation failure to the caller of `reserve`/`alloc`/`submit`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendererError {
    #[error("renderer out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    #[error("renderer device lost")]
    DeviceLost,

    #[error("renderer submission failed: {0}")]
    SubmitFailed(String),

    #[error("renderer wait failed: {0}")]
    WaitFailed(String),
}

/// Errors from shared-region allocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShmemError {
    #[error("out of memory allocating {size} bytes of shared memory")]
    OutOfMemory { size: usize },

    #[error("integer overflow while computing shared memory size")]
    SizeOverflow,

    #[error(transparent)]
    Renderer(RendererError),
}

impl ShmemError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            ShmemError::OutOfMemory { .. } | ShmemError::SizeOverflow
        )
    }
}

impl From<RendererError> for ShmemError {
    fn from(err: RendererError) -> Self {
        match err {
            RendererError::OutOfMemory { size } => ShmemError::OutOfMemory { size },
            other => ShmemError::Renderer(other),
        }
    }
}
