use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::renderer::{Renderer, ShmemMapping};

struct RegionInner {
    res_id: u32,
    mapping: Arc<dyn ShmemMapping>,
    renderer: Arc<dyn Renderer>,
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        trace!(res_id = self.res_id, size = self.mapping.len(), "releasing shared region");
        self.renderer.destroy_shmem(self.res_id);
    }
}

/// Reference-counted block of memory shared with the remote renderer.
///
/// Cloning takes a reference; dropping the last clone destroys the renderer resource. The
/// mapping never shrinks and its resource id is never reused while any clone is alive.
#[derive(Clone)]
pub struct SharedRegion {
    inner: Arc<RegionInner>,
}

impl SharedRegion {
    /// Allocate a new region of at least `size` bytes.
    pub fn create(renderer: &Arc<dyn Renderer>, size: usize) -> Result<Self> {
        let raw = renderer.create_shmem(size)?;
        debug_assert!(raw.mapping.len() >= size);
        trace!(res_id = raw.res_id, size, "created shared region");
        Ok(Self {
            inner: Arc::new(RegionInner {
                res_id: raw.res_id,
                mapping: raw.mapping,
                renderer: renderer.clone(),
            }),
        })
    }

    pub fn res_id(&self) -> u32 {
        self.inner.res_id
    }

    pub fn size(&self) -> usize {
        self.inner.mapping.len()
    }

    /// Base of the local mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.mapping.as_ptr()
    }

    /// The local mapping alone. Holding it keeps the bytes mapped but not the renderer resource.
    pub fn mapping(&self) -> Arc<dyn ShmemMapping> {
        self.inner.mapping.clone()
    }

    /// Number of live references, this one included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both handles refer to the same underlying resource.
    pub fn same_region(&self, other: &SharedRegion) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.check_range(offset, data.len());
        // SAFETY: the range was bounds-checked against the live mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
    }

    /// Copy `out.len()` bytes starting at `offset` out of the region.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        self.check_range(offset, out.len());
        // SAFETY: the range was bounds-checked against the live mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn fill_zero(&self, offset: usize, len: usize) {
        self.check_range(offset, len);
        // SAFETY: the range was bounds-checked against the live mapping.
        unsafe {
            core::ptr::write_bytes(self.as_ptr().add(offset), 0, len);
        }
    }

    /// Borrow `len` bytes at `offset` as a slice.
    ///
    /// # Safety
    ///
    /// Nobody (local or remote) may write the range while the slice is alive.
    pub unsafe fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
        self.check_range(offset, len);
        core::slice::from_raw_parts(self.as_ptr().add(offset), len)
    }

    fn check_range(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.size()),
            "shared region access out of bounds: offset={offset} len={len} size={}",
            self.size()
        );
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("res_id", &self.res_id())
            .field("size", &self.size())
            .field("refs", &self.ref_count())
            .finish()
    }
}
