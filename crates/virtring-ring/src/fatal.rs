//! Fail-fast handling of ring desynchronization.
//!
//! Once producer and consumer cursors may have diverged there is no way back, so every fatal
//! condition ends in [`std::process::abort`]. Tests install an [`AbortHook`] that unwinds
//! (panics) before the abort is reached.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FatalDesync {
    #[error("remote set the ring fatal bit (wait iteration {iter})")]
    RingFatal { iter: u64 },

    #[error("remote stopped reporting liveness (wait iteration {iter})")]
    WatchdogExpired { iter: u64 },

    #[error("wait made no progress after {iter} iterations")]
    AbortThreshold { iter: u64 },

    #[error("remote set the ring fatal bit during submission")]
    SubmitFatal,
}

/// Called with the reason right before the process aborts.
pub type AbortHook = Arc<dyn Fn(&FatalDesync) + Send + Sync>;

#[derive(Clone, Default)]
pub struct FatalHandler {
    hook: Option<AbortHook>,
}

impl FatalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: AbortHook) -> Self {
        Self { hook: Some(hook) }
    }

    pub fn abort(&self, reason: &FatalDesync) -> ! {
        error!(reason = %reason, "fatal ring desynchronization, aborting");
        if let Some(hook) = &self.hook {
            hook(reason);
        }
        std::process::abort()
    }
}

impl fmt::Debug for FatalHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatalHandler")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
