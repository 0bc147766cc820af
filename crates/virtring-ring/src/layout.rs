//! Ring shared-memory layout contract.
//!
//! Both sides must agree on it bit for bit. The block is laid out as:
//!
//! - `head: u32` (written by the remote)
//! - `tail: u32` (written locally)
//! - `status: u32` (bitmask, written by the remote)
//! - `buffer[buffer_size]`, the circular command region
//! - `extra[extra_size]`, protocol side data (the roundtrip counter lives at its start)
//!
//! Every field starts on its own [`RING_FIELD_ALIGN`]-byte cache line. The offsets are sent to
//! the remote in the `CreateRing` control command.

use virtring_cs::protocol::RingCreateInfo;

use crate::error::{Result, RingError};

pub const RING_FIELD_ALIGN: usize = 64;

/// Largest buffer for which `tail - head` comparisons stay unambiguous in 32 bits.
pub const MAX_RING_BUFFER_SIZE: usize = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub head_offset: usize,
    pub tail_offset: usize,
    pub status_offset: usize,
    pub buffer_offset: usize,
    pub buffer_size: usize,
    pub extra_offset: usize,
    pub extra_size: usize,
    /// Total size of the shared block.
    pub shmem_size: usize,
}

impl RingLayout {
    pub fn new(buffer_size: usize, extra_size: usize) -> Result<Self> {
        if !buffer_size.is_power_of_two() || buffer_size > MAX_RING_BUFFER_SIZE {
            return Err(RingError::InvalidLayout(format!(
                "buffer size {buffer_size} is not a power of two no larger than {MAX_RING_BUFFER_SIZE}"
            )));
        }

        let head_offset = 0;
        let tail_offset = align_up(head_offset + 4, RING_FIELD_ALIGN);
        let status_offset = align_up(tail_offset + 4, RING_FIELD_ALIGN);
        let buffer_offset = align_up(status_offset + 4, RING_FIELD_ALIGN);
        let extra_offset = align_up(buffer_offset + buffer_size, RING_FIELD_ALIGN);
        let shmem_size = extra_offset
            .checked_add(extra_size)
            .filter(|&size| size <= u32::MAX as usize)
            .ok_or_else(|| {
                RingError::InvalidLayout(format!("extra size {extra_size} overflows the ring"))
            })?;

        Ok(Self {
            head_offset,
            tail_offset,
            status_offset,
            buffer_offset,
            buffer_size,
            extra_offset,
            extra_size,
            shmem_size,
        })
    }

    /// Rebuild a layout from the offsets announced in a `CreateRing` command, as the remote
    /// side does.
    pub fn from_create_info(info: &RingCreateInfo) -> Result<Self> {
        let layout = Self {
            head_offset: info.head_offset as usize,
            tail_offset: info.tail_offset as usize,
            status_offset: info.status_offset as usize,
            buffer_offset: info.buffer_offset as usize,
            buffer_size: info.buffer_size as usize,
            extra_offset: info.extra_offset as usize,
            extra_size: info.extra_size as usize,
            shmem_size: info.size as usize,
        };
        layout.validate()?;
        Ok(layout)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |what: &str| Err(RingError::InvalidLayout(what.to_string()));
        if !self.buffer_size.is_power_of_two() {
            return invalid("buffer size is not a power of two");
        }
        for offset in [self.head_offset, self.tail_offset, self.status_offset] {
            if offset % 4 != 0 || offset + 4 > self.shmem_size {
                return invalid("control word out of bounds or misaligned");
            }
        }
        if self.buffer_offset + self.buffer_size > self.shmem_size
            || self.extra_offset + self.extra_size > self.shmem_size
            || self.extra_offset % 4 != 0
        {
            return invalid("buffer or extra region out of bounds");
        }
        Ok(())
    }

    pub fn buffer_mask(&self) -> u32 {
        (self.buffer_size - 1) as u32
    }

    /// `CreateRing` payload describing this layout.
    pub fn create_info(
        &self,
        ring_id: u64,
        res_id: u32,
        idle_timeout_ns: u64,
        report_period_us: u32,
    ) -> RingCreateInfo {
        RingCreateInfo {
            ring_id,
            res_id,
            size: self.shmem_size as u32,
            head_offset: self.head_offset as u32,
            tail_offset: self.tail_offset as u32,
            status_offset: self.status_offset as u32,
            buffer_offset: self.buffer_offset as u32,
            buffer_size: self.buffer_size as u32,
            extra_offset: self.extra_offset as u32,
            extra_size: self.extra_size as u32,
            idle_timeout_ns,
            report_period_us,
        }
    }
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}
