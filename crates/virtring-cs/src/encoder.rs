use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};
use virtring_shmem::{Renderer, SharedRegion, SharedRegionPool};

use crate::error::{CsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Size of the first shared-memory buffer.
    pub min_buffer_size: usize,
    /// Factor applied to the previous buffer size when a new one is needed. Values below 2 are
    /// treated as 2.
    pub growth_factor: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            min_buffer_size: 16 * 1024,
            growth_factor: 2,
        }
    }
}

/// Where an encoder's bytes live.
pub enum EncoderStorage {
    /// One caller-supplied buffer. Never grows.
    Pointer(Box<[u8]>),
    /// A dedicated shared region per buffer.
    ShmemArray(Arc<dyn Renderer>),
    /// Buffers suballocated from a shared pool.
    ShmemPool(Arc<SharedRegionPool>),
}

impl EncoderStorage {
    pub fn kind(&self) -> StorageKind {
        match self {
            EncoderStorage::Pointer(_) => StorageKind::Pointer,
            EncoderStorage::ShmemArray(_) => StorageKind::ShmemArray,
            EncoderStorage::ShmemPool(_) => StorageKind::ShmemPool,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Pointer,
    ShmemArray,
    ShmemPool,
}

#[derive(Debug, Clone)]
struct EncoderBuffer {
    /// `None` for pointer storage.
    shmem: Option<SharedRegion>,
    /// Start of this buffer inside its region (or inside the pointer storage).
    offset: usize,
    committed_size: usize,
}

/// A committed, physically contiguous piece of an encoder's stream.
#[derive(Debug, Clone, Copy)]
pub struct CommittedChunk<'a> {
    pub shmem: Option<&'a SharedRegion>,
    pub offset: usize,
    pub bytes: &'a [u8],
}

/// Append-only command stream spread over one or more buffers.
///
/// Only the last buffer is written; earlier buffers are committed and immutable. A failed
/// reservation puts the encoder in a sticky fatal state that only [`CommandEncoder::reset`]
/// clears.
pub struct CommandEncoder {
    storage: EncoderStorage,
    config: EncoderConfig,
    buffers: Vec<EncoderBuffer>,
    total_committed_size: usize,
    current_buffer_size: usize,
    /// Write cursor, relative to the current buffer's offset.
    cur: usize,
    /// Writable limit, relative to the current buffer's offset.
    end: usize,
    fatal_error: bool,
}

impl CommandEncoder {
    /// Encoder over a zeroed local buffer of `capacity` bytes.
    pub fn local(capacity: usize) -> Self {
        Self::from_fixed(vec![0u8; capacity].into_boxed_slice())
    }

    pub fn from_fixed(storage: Box<[u8]>) -> Self {
        let len = storage.len();
        Self {
            storage: EncoderStorage::Pointer(storage),
            config: EncoderConfig {
                min_buffer_size: len,
                growth_factor: 2,
            },
            buffers: vec![EncoderBuffer {
                shmem: None,
                offset: 0,
                committed_size: 0,
            }],
            total_committed_size: 0,
            current_buffer_size: len,
            cur: 0,
            end: len,
            fatal_error: false,
        }
    }

    pub fn shmem_array(renderer: Arc<dyn Renderer>, config: EncoderConfig) -> Self {
        Self::growable(EncoderStorage::ShmemArray(renderer), config)
    }

    pub fn shmem_pool(pool: Arc<SharedRegionPool>, config: EncoderConfig) -> Self {
        Self::growable(EncoderStorage::ShmemPool(pool), config)
    }

    fn growable(storage: EncoderStorage, config: EncoderConfig) -> Self {
        Self {
            storage,
            config,
            buffers: Vec::new(),
            total_committed_size: 0,
            current_buffer_size: 0,
            cur: 0,
            end: 0,
            fatal_error: false,
        }
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.storage.kind()
    }

    pub fn config(&self) -> EncoderConfig {
        self.config
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal_error
    }

    /// Mark the stream unusable, e.g. after a codec hit an unencodable value.
    pub fn set_fatal(&mut self) {
        self.fatal_error = true;
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Size of the most recently allocated buffer.
    pub fn current_buffer_size(&self) -> usize {
        self.current_buffer_size
    }

    /// Bytes that can be written without another reservation.
    pub fn available(&self) -> usize {
        self.end - self.cur
    }

    /// Make at least `size` contiguous bytes writable at the cursor.
    pub fn reserve(&mut self, size: usize) -> Result<()> {
        if self.fatal_error {
            return Err(CsError::Fatal);
        }
        if self.end - self.cur >= size {
            return Ok(());
        }

        self.reserve_slow(size).map_err(|err| {
            debug!(size, error = %err, "command encoder reservation failed");
            self.fatal_error = true;
            err
        })
    }

    fn reserve_slow(&mut self, size: usize) -> Result<()> {
        if let EncoderStorage::Pointer(_) = self.storage {
            return Err(CsError::FixedCapacity {
                requested: size,
                remaining: self.end - self.cur,
            });
        }

        let growth = self.config.growth_factor.max(2);
        let mut buf_size = 0;
        if let Some(last_offset) = self.buffers.last().map(|b| b.offset) {
            self.commit_buffer();
            buf_size = match self.storage {
                // A buffer carried over by `reset` keeps its size for the replacement.
                EncoderStorage::ShmemArray(_) if last_offset != 0 => self.current_buffer_size,
                _ => self
                    .current_buffer_size
                    .checked_mul(growth)
                    .ok_or(CsError::OutOfMemory { size })?,
            };
        }
        if buf_size == 0 {
            buf_size = self.config.min_buffer_size.max(1);
        }
        while buf_size < size {
            buf_size = buf_size
                .checked_mul(growth)
                .ok_or(CsError::OutOfMemory { size })?;
        }

        let (shmem, offset) = self.alloc_buffer(buf_size)?;
        trace!(
            res_id = shmem.res_id(),
            offset,
            size = buf_size,
            "command encoder buffer added"
        );
        self.buffers.push(EncoderBuffer {
            shmem: Some(shmem),
            offset,
            committed_size: 0,
        });
        self.current_buffer_size = buf_size;
        self.cur = 0;
        self.end = buf_size;
        Ok(())
    }

    fn alloc_buffer(&self, size: usize) -> Result<(SharedRegion, usize)> {
        match &self.storage {
            EncoderStorage::ShmemArray(renderer) => SharedRegion::create(renderer, size)
                .map(|region| (region, 0))
                .map_err(|err| CsError::from_shmem(err, size)),
            EncoderStorage::ShmemPool(pool) => pool
                .alloc(size)
                .map(|alloc| (alloc.region, alloc.offset))
                .map_err(|err| CsError::from_shmem(err, size)),
            EncoderStorage::Pointer(_) => Err(CsError::FixedCapacity {
                requested: size,
                remaining: self.end - self.cur,
            }),
        }
    }

    /// Copy `data` to the cursor.
    ///
    /// # Panics
    ///
    /// If fewer than `data.len()` bytes were reserved.
    pub fn write(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.end - self.cur,
            "command encoder write of {} bytes exceeds reservation ({} left)",
            data.len(),
            self.end - self.cur
        );
        if data.is_empty() {
            return;
        }

        let Some(buf) = self.buffers.last() else {
            unreachable!("non-empty reservation without a buffer");
        };
        let at = buf.offset + self.cur;
        match (&mut self.storage, &buf.shmem) {
            (EncoderStorage::Pointer(storage), _) => {
                storage[at..at + data.len()].copy_from_slice(data);
            }
            (_, Some(region)) => region.write(at, data),
            (_, None) => unreachable!("shared-memory encoder buffer without a region"),
        }
        self.cur += data.len();
    }

    /// Reserve and write in one step.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.reserve(data.len())?;
        self.write(data);
        Ok(())
    }

    fn commit_buffer(&mut self) {
        if let Some(buf) = self.buffers.last_mut() {
            if buf.committed_size == 0 {
                buf.committed_size = self.cur;
                self.total_committed_size += self.cur;
            }
        }
    }

    /// Finalize the current buffer. Later writes need a new reservation. Idempotent.
    pub fn commit(&mut self) {
        self.commit_buffer();
        self.end = self.cur;
    }

    /// Prepare for reuse and clear the fatal flag.
    ///
    /// Pool storage drops every buffer. Array storage keeps the last region and continues after
    /// its used prefix, so steady-state reuse does not reallocate.
    pub fn reset(&mut self) {
        match &self.storage {
            EncoderStorage::Pointer(storage) => {
                self.buffers.truncate(1);
                if let Some(buf) = self.buffers.first_mut() {
                    buf.committed_size = 0;
                }
                self.cur = 0;
                self.end = storage.len();
            }
            EncoderStorage::ShmemPool(_) => {
                self.buffers.clear();
                self.current_buffer_size = 0;
                self.cur = 0;
                self.end = 0;
            }
            EncoderStorage::ShmemArray(_) => {
                let last = self.buffers.pop();
                self.buffers.clear();
                match last {
                    Some(mut buf) => {
                        let used = buf.offset + self.cur;
                        let region_size = buf.shmem.as_ref().map_or(used, SharedRegion::size);
                        buf.offset = used;
                        buf.committed_size = 0;
                        self.buffers.push(buf);
                        self.cur = 0;
                        self.end = region_size - used;
                    }
                    None => {
                        self.cur = 0;
                        self.end = 0;
                    }
                }
            }
        }
        self.total_committed_size = 0;
        self.fatal_error = false;
    }

    /// Committed bytes plus whatever is pending in an uncommitted current buffer.
    pub fn len(&self) -> usize {
        match self.buffers.last() {
            None => 0,
            Some(buf) if buf.committed_size == 0 => self.total_committed_size + self.cur,
            Some(_) => self.total_committed_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-empty committed buffers in stream order.
    pub fn committed_chunks(&self) -> impl Iterator<Item = CommittedChunk<'_>> + '_ {
        self.buffers
            .iter()
            .filter(|buf| buf.committed_size > 0)
            .map(move |buf| {
                let bytes: &[u8] = match (&self.storage, &buf.shmem) {
                    (EncoderStorage::Pointer(storage), _) => {
                        &storage[buf.offset..buf.offset + buf.committed_size]
                    }
                    // SAFETY: committed bytes are never written again while the encoder lives.
                    (_, Some(region)) => unsafe { region.as_slice(buf.offset, buf.committed_size) },
                    (_, None) => &[],
                };
                CommittedChunk {
                    shmem: buf.shmem.as_ref(),
                    offset: buf.offset,
                    bytes,
                }
            })
    }

    /// The written prefix of pointer storage; empty for shared-memory storage.
    pub fn local_bytes(&self) -> &[u8] {
        match &self.storage {
            EncoderStorage::Pointer(storage) => &storage[..self.len()],
            _ => &[],
        }
    }
}

impl fmt::Debug for CommandEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEncoder")
            .field("storage", &self.storage.kind())
            .field("buffers", &self.buffers.len())
            .field("len", &self.len())
            .field("fatal", &self.fatal_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtring_shmem::MemoryRenderer;

    fn small_config() -> EncoderConfig {
        EncoderConfig {
            min_buffer_size: 64,
            growth_factor: 2,
        }
    }

    fn array_encoder() -> (Arc<MemoryRenderer>, CommandEncoder) {
        let mem = Arc::new(MemoryRenderer::new());
        let enc = CommandEncoder::shmem_array(mem.clone(), small_config());
        (mem, enc)
    }

    fn collect(enc: &CommandEncoder) -> Vec<u8> {
        enc.committed_chunks()
            .flat_map(|c| c.bytes.iter().copied())
            .collect()
    }

    #[test]
    fn local_encoder_writes_in_place() {
        let mut enc = CommandEncoder::local(16);
        assert!(enc.is_empty());
        enc.append(&[1, 2, 3, 4]).unwrap();
        assert_eq!(enc.len(), 4);
        assert_eq!(enc.local_bytes(), &[1, 2, 3, 4]);

        enc.commit();
        let chunks: Vec<_> = enc.committed_chunks().collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].shmem.is_none());
        assert_eq!(chunks[0].bytes, &[1, 2, 3, 4]);
    }

    #[test]
    fn local_encoder_cannot_grow_and_failure_is_sticky() {
        let mut enc = CommandEncoder::local(8);
        enc.append(&[0; 6]).unwrap();
        assert_eq!(
            enc.reserve(4).unwrap_err(),
            CsError::FixedCapacity {
                requested: 4,
                remaining: 2
            }
        );
        assert!(enc.is_fatal());
        assert_eq!(enc.reserve(1).unwrap_err(), CsError::Fatal);

        enc.reset();
        assert!(!enc.is_fatal());
        assert!(enc.is_empty());
        enc.append(&[0; 8]).unwrap();
    }

    #[test]
    fn commit_is_idempotent() {
        let (_, mut enc) = array_encoder();
        enc.append(&[7; 10]).unwrap();
        enc.commit();
        assert_eq!(enc.len(), 10);
        enc.commit();
        assert_eq!(enc.len(), 10);
        assert_eq!(enc.available(), 0);
    }

    #[test]
    fn array_storage_doubles_buffer_size() {
        let (mem, mut enc) = array_encoder();
        enc.append(&[1; 40]).unwrap();
        assert_eq!(enc.current_buffer_size(), 64);

        enc.append(&[2; 40]).unwrap();
        assert_eq!(enc.buffer_count(), 2);
        assert_eq!(enc.current_buffer_size(), 128);
        assert_eq!(mem.live_regions(), 2);

        // Uncommitted bytes count toward the length but are not yet a chunk.
        assert_eq!(enc.len(), 80);
        assert_eq!(collect(&enc), vec![1; 40]);

        enc.commit();
        let mut expected = vec![1; 40];
        expected.extend_from_slice(&[2; 40]);
        assert_eq!(collect(&enc), expected);
    }

    #[test]
    fn oversized_reservation_rounds_up_by_growth_factor() {
        let (_, mut enc) = array_encoder();
        enc.reserve(1000).unwrap();
        assert_eq!(enc.current_buffer_size(), 1024);
        assert_eq!(enc.available(), 1024);
    }

    #[test]
    fn array_reset_reuses_the_tail_of_the_last_region() {
        let (mem, mut enc) = array_encoder();
        enc.append(&[1; 40]).unwrap();
        enc.commit();
        let res_id = enc.committed_chunks().next().unwrap().shmem.unwrap().res_id();

        enc.reset();
        assert!(enc.is_empty());
        assert_eq!(enc.buffer_count(), 1);
        assert_eq!(enc.available(), 24);

        enc.append(&[2; 20]).unwrap();
        enc.commit();
        assert_eq!(mem.live_regions(), 1);
        let chunk = enc.committed_chunks().next().unwrap();
        assert_eq!(chunk.shmem.unwrap().res_id(), res_id);
        assert_eq!(chunk.offset, 40);
        assert_eq!(chunk.bytes, &[2; 20]);

        // The carried-over buffer is replaced without doubling.
        enc.reserve(10).unwrap();
        assert_eq!(enc.current_buffer_size(), 64);
    }

    #[test]
    fn pool_storage_shares_region_and_reset_drops_buffers() {
        let mem = Arc::new(MemoryRenderer::new());
        let pool = Arc::new(SharedRegionPool::new(mem.clone(), 4096));
        let mut a = CommandEncoder::shmem_pool(pool.clone(), small_config());
        let mut b = CommandEncoder::shmem_pool(pool.clone(), small_config());

        a.append(&[1; 8]).unwrap();
        b.append(&[2; 8]).unwrap();
        a.commit();
        b.commit();
        let ca = a.committed_chunks().next().unwrap();
        let cb = b.committed_chunks().next().unwrap();
        assert!(ca.shmem.unwrap().same_region(cb.shmem.unwrap()));
        assert_eq!(cb.offset, 64);
        assert_eq!(mem.live_regions(), 1);

        a.reset();
        assert_eq!(a.buffer_count(), 0);
        assert_eq!(a.storage_kind(), StorageKind::ShmemPool);
    }

    #[test]
    fn pool_storage_doubles_buffer_size() {
        let mem = Arc::new(MemoryRenderer::new());
        let pool = Arc::new(SharedRegionPool::new(mem.clone(), 4096));
        let mut enc = CommandEncoder::shmem_pool(pool, small_config());

        let mut expected = Vec::new();
        for i in 0..10u8 {
            enc.append(&[i; 64]).unwrap();
            expected.extend_from_slice(&[i; 64]);
        }
        assert_eq!(enc.buffer_count(), 4);
        assert_eq!(enc.current_buffer_size(), 512);
        assert_eq!(enc.len(), 640);
        enc.commit();
        assert_eq!(collect(&enc), expected);
        assert_eq!(mem.live_regions(), 1);

        // A reset encoder starts over from the minimum.
        enc.reset();
        enc.append(&[0; 8]).unwrap();
        assert_eq!(enc.current_buffer_size(), 64);
    }

    #[test]
    fn allocation_failure_is_sticky_out_of_memory() {
        let (mem, mut enc) = array_encoder();
        mem.fail_next_allocations(1);
        assert!(enc.reserve(8).unwrap_err().is_out_of_memory());
        assert_eq!(enc.reserve(8).unwrap_err(), CsError::Fatal);

        enc.reset();
        enc.append(&[0; 8]).unwrap();
        assert_eq!(enc.len(), 8);
    }

    #[test]
    #[should_panic(expected = "exceeds reservation")]
    fn write_without_reservation_panics() {
        let (_, mut enc) = array_encoder();
        enc.reserve(4).unwrap();
        enc.write(&[0; 4]);
        enc.commit();
        enc.write(&[0; 1]);
    }
}
