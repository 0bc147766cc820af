use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{Result, ShmemError};
use crate::region::SharedRegion;
use crate::renderer::Renderer;

/// A suballocation handed out by [`SharedRegionPool::alloc`].
///
/// `region` is a strong reference, so the bytes at `offset..offset + size` stay valid even after
/// the pool has moved on to a newer backing region.
#[derive(Debug, Clone)]
pub struct PoolAllocation {
    pub region: SharedRegion,
    pub offset: usize,
    pub size: usize,
}

struct PoolState {
    region: Option<SharedRegion>,
    size: usize,
    used: usize,
    grows: u64,
}

/// Linear suballocator over a replaceable shared region.
///
/// Allocations are bump-allocated from the current backing region. When a request does not fit,
/// the pool creates a new region of `max(min_alloc_size, next_power_of_two(size))` bytes, drops
/// its own reference to the old one and starts over at offset zero. Outstanding allocations are
/// never invalidated.
pub struct SharedRegionPool {
    renderer: Arc<dyn Renderer>,
    min_alloc_size: usize,
    state: Mutex<PoolState>,
}

impl SharedRegionPool {
    /// `min_alloc_size` is rounded up to a power of two.
    pub fn new(renderer: Arc<dyn Renderer>, min_alloc_size: usize) -> Self {
        Self {
            renderer,
            min_alloc_size: min_alloc_size.max(1).next_power_of_two(),
            state: Mutex::new(PoolState {
                region: None,
                size: 0,
                used: 0,
                grows: 0,
            }),
        }
    }

    pub fn min_alloc_size(&self) -> usize {
        self.min_alloc_size
    }

    /// Reserve `size` bytes, growing the pool if the current region cannot hold them.
    pub fn alloc(&self, size: usize) -> Result<PoolAllocation> {
        let mut state = self.lock();

        if state.region.is_none() || size > state.size - state.used {
            self.grow(&mut state, size)?;
            debug_assert!(size <= state.size - state.used);
        }

        let Some(region) = state.region.clone() else {
            return Err(ShmemError::OutOfMemory { size });
        };
        let offset = state.used;
        state.used += size;
        Ok(PoolAllocation {
            region,
            offset,
            size,
        })
    }

    fn grow(&self, state: &mut PoolState, size: usize) -> Result<()> {
        // Power-of-two sizes keep renderer-side shmem caches effective.
        let mut alloc_size = self.min_alloc_size;
        while alloc_size < size {
            alloc_size = alloc_size
                .checked_mul(2)
                .ok_or(ShmemError::SizeOverflow)?;
        }

        let region = SharedRegion::create(&self.renderer, alloc_size)?;
        debug!(
            res_id = region.res_id(),
            size = alloc_size,
            request = size,
            "shared region pool grew"
        );

        state.region = Some(region);
        state.size = alloc_size;
        state.used = 0;
        state.grows += 1;
        Ok(())
    }

    /// Drop the pool's own reference to its backing region.
    pub fn release(&self) {
        let mut state = self.lock();
        state.region = None;
        state.size = 0;
        state.used = 0;
    }

    /// Number of backing regions created so far.
    pub fn grow_count(&self) -> u64 {
        self.lock().grows
    }

    /// Resource id of the current backing region, if any.
    pub fn backing_res_id(&self) -> Option<u32> {
        self.lock().region.as_ref().map(SharedRegion::res_id)
    }

    /// Bytes left in the current backing region.
    pub fn remaining(&self) -> usize {
        let state = self.lock();
        state.size - state.used
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl fmt::Debug for SharedRegionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SharedRegionPool")
            .field("min_alloc_size", &self.min_alloc_size)
            .field("size", &state.size)
            .field("used", &state.used)
            .field("grows", &state.grows)
            .finish()
    }
}
