use thiserror::Error;
use virtring_ring::RingError;
use virtring_shmem::RendererError;

pub type Result<T> = std::result::Result<T, InstanceError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Renderer(#[from] RendererError),
}

impl InstanceError {
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            InstanceError::Ring(err) => err.is_out_of_memory(),
            InstanceError::Renderer(err) => matches!(err, RendererError::OutOfMemory { .. }),
        }
    }
}
