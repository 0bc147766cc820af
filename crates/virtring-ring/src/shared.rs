//! Typed view over a ring's shared block.

use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use virtring_shmem::ShmemMapping;

use crate::error::{Result, RingError};
use crate::layout::RingLayout;

/// Named access to the control words and the circular buffer of one ring, computed once from
/// a validated [`RingLayout`].
#[derive(Clone)]
pub struct RingShared {
    mapping: Arc<dyn ShmemMapping>,
    layout: RingLayout,
}

impl RingShared {
    pub fn new(mapping: Arc<dyn ShmemMapping>, layout: RingLayout) -> Result<Self> {
        if mapping.len() < layout.shmem_size {
            return Err(RingError::InvalidLayout(format!(
                "mapping of {} bytes cannot hold a {}-byte ring",
                mapping.len(),
                layout.shmem_size
            )));
        }
        if mapping.as_ptr() as usize % core::mem::align_of::<AtomicU32>() != 0 {
            return Err(RingError::InvalidLayout(
                "ring mapping is not 4-byte aligned".into(),
            ));
        }
        Ok(Self { mapping, layout })
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: `new` checked that the mapping covers the layout and is 4-byte aligned, the
        // layout keeps control words 4-byte aligned, and `self.mapping` keeps the memory alive.
        unsafe { &*(self.mapping.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// Bytes consumed by the remote.
    pub fn head(&self) -> &AtomicU32 {
        self.word(self.layout.head_offset)
    }

    /// Bytes published by the local side.
    pub fn tail(&self) -> &AtomicU32 {
        self.word(self.layout.tail_offset)
    }

    pub fn status(&self) -> &AtomicU32 {
        self.word(self.layout.status_offset)
    }

    /// The `index`-th `u32` of the extra region, if it has one.
    pub fn extra_u32(&self, index: usize) -> Option<&AtomicU32> {
        let end = index.checked_add(1)?.checked_mul(4)?;
        (end <= self.layout.extra_size).then(|| self.word(self.layout.extra_offset + index * 4))
    }

    /// Copy `data` into the circular buffer starting at stream position `pos`, wrapping at the
    /// end of the buffer.
    pub fn write_buffer(&self, pos: u32, data: &[u8]) {
        assert!(data.len() <= self.layout.buffer_size);
        let offset = (pos & self.layout.buffer_mask()) as usize;
        let first = data.len().min(self.layout.buffer_size - offset);
        let base = self.layout.buffer_offset;

        // SAFETY: both ranges lie inside the buffer region, which `new` checked against the
        // mapping; the producer lock guarantees nobody else writes them.
        unsafe {
            let buf = self.mapping.as_ptr().add(base);
            core::ptr::copy_nonoverlapping(data.as_ptr(), buf.add(offset), first);
            core::ptr::copy_nonoverlapping(data.as_ptr().add(first), buf, data.len() - first);
        }
    }

    /// Copy `out.len()` bytes out of the circular buffer starting at stream position `pos`.
    pub fn read_buffer(&self, pos: u32, out: &mut [u8]) {
        assert!(out.len() <= self.layout.buffer_size);
        let offset = (pos & self.layout.buffer_mask()) as usize;
        let first = out.len().min(self.layout.buffer_size - offset);
        let base = self.layout.buffer_offset;
        let len = out.len();

        // SAFETY: see `write_buffer`.
        unsafe {
            let buf = self.mapping.as_ptr().add(base);
            core::ptr::copy_nonoverlapping(buf.add(offset), out.as_mut_ptr(), first);
            core::ptr::copy_nonoverlapping(buf, out.as_mut_ptr().add(first), len - first);
        }
    }
}

impl fmt::Debug for RingShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingShared")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use virtring_shmem::HeapMapping;

    fn shared(buffer_size: usize) -> RingShared {
        let layout = RingLayout::new(buffer_size, 4).unwrap();
        let mapping = Arc::new(HeapMapping::new(layout.shmem_size).unwrap());
        RingShared::new(mapping, layout).unwrap()
    }

    #[test]
    fn control_words_are_distinct() {
        let s = shared(64);
        s.head().store(1, Ordering::Relaxed);
        s.tail().store(2, Ordering::Relaxed);
        s.status().store(3, Ordering::Relaxed);
        s.extra_u32(0).unwrap().store(4, Ordering::Relaxed);
        assert_eq!(s.head().load(Ordering::Relaxed), 1);
        assert_eq!(s.tail().load(Ordering::Relaxed), 2);
        assert_eq!(s.status().load(Ordering::Relaxed), 3);
        assert_eq!(s.extra_u32(0).unwrap().load(Ordering::Relaxed), 4);
        assert!(s.extra_u32(1).is_none());
    }

    #[test]
    fn writes_split_across_the_end() {
        let s = shared(16);
        let data: Vec<u8> = (0..10).collect();
        s.write_buffer(u32::MAX - 3, &data);

        let mut out = [0u8; 10];
        s.read_buffer(u32::MAX - 3, &mut out);
        assert_eq!(&out[..], &data[..]);

        // Bytes 0..4 landed at the end of the buffer, the rest at its start.
        let mut start = [0u8; 6];
        s.read_buffer(0, &mut start);
        assert_eq!(start, [4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn short_mappings_are_rejected() {
        let layout = RingLayout::new(64, 4).unwrap();
        let mapping = Arc::new(HeapMapping::new(layout.shmem_size - 1).unwrap());
        assert!(RingShared::new(mapping, layout).is_err());
    }
}
