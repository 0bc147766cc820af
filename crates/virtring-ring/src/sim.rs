use std::sync::atomic::Ordering;

use virtring_cs::protocol::{decode_command, CommandStreamDescription, ControlCommand, RingCreateInfo};
use virtring_shmem::{MemoryRenderer, SubmittedBatch};

use crate::layout::RingLayout;
use crate::shared::RingShared;
use crate::status::RingStatus;

/// Consumer end of a ring, driven by the test instead of a renderer thread.
#[derive(Debug)]
pub struct RemoteRing {
    shared: RingShared,
    head: u32,
}

impl RemoteRing {
    /// Map the ring announced by `info` the way a renderer would.
    pub fn attach(renderer: &MemoryRenderer, info: &RingCreateInfo) -> Option<Self> {
        let layout = RingLayout::from_create_info(info).ok()?;
        let mapping = renderer.mapping(info.res_id)?;
        Some(Self::from_shared(RingShared::new(mapping, layout).ok()?))
    }

    pub fn from_shared(shared: RingShared) -> Self {
        let head = shared.head().load(Ordering::Acquire);
        Self { shared, head }
    }

    pub fn shared(&self) -> &RingShared {
        &self.shared
    }

    pub fn tail(&self) -> u32 {
        self.shared.tail().load(Ordering::Acquire)
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    /// Published bytes not yet consumed.
    pub fn pending_bytes(&self) -> usize {
        self.tail().wrapping_sub(self.head) as usize
    }

    /// Read and consume `len` published bytes.
    pub fn consume(&mut self, len: usize) -> Vec<u8> {
        let out = self.peek(len);
        self.advance(len);
        out
    }

    /// Read `len` published bytes without consuming them.
    pub fn peek(&self, len: usize) -> Vec<u8> {
        assert!(len <= self.pending_bytes(), "reading unpublished bytes");
        let mut out = vec![0u8; len];
        self.shared.read_buffer(self.head, &mut out);
        out
    }

    pub fn consume_all(&mut self) -> Vec<u8> {
        self.consume(self.pending_bytes())
    }

    /// Consume `len` bytes without reading them.
    pub fn skip(&mut self, len: usize) {
        assert!(len <= self.pending_bytes(), "consuming unpublished bytes");
        self.advance(len);
    }

    fn advance(&mut self, len: usize) {
        self.head = self.head.wrapping_add(len as u32);
        self.shared.head().store(self.head, Ordering::Release);
    }

    pub fn status(&self) -> RingStatus {
        RingStatus::from_bits_retain(self.shared.status().load(Ordering::SeqCst))
    }

    pub fn set_status(&self, bits: RingStatus) {
        self.shared.status().fetch_or(bits.bits(), Ordering::SeqCst);
    }

    pub fn clear_status(&self, bits: RingStatus) {
        self.shared.status().fetch_and(!bits.bits(), Ordering::SeqCst);
    }

    /// Publish the roundtrip counter kept at the start of the extra region.
    pub fn set_roundtrip_seqno(&self, seqno: u32) {
        if let Some(word) = self.shared.extra_u32(0) {
            word.store(seqno, Ordering::Release);
        }
    }
}

/// The `CreateRing` payload for `ring_id` among recorded side-channel submissions.
pub fn find_create_info(batches: &[SubmittedBatch], ring_id: u64) -> Option<RingCreateInfo> {
    batches
        .iter()
        .filter_map(|b| decode_command(&b.data).ok())
        .find_map(|cmd| match cmd {
            ControlCommand::CreateRing(info) if info.ring_id == ring_id => Some(info),
            _ => None,
        })
}

/// Dereference a command-stream descriptor against the renderer's regions.
pub fn read_stream(renderer: &MemoryRenderer, desc: &CommandStreamDescription) -> Option<Vec<u8>> {
    let offset = usize::try_from(desc.offset).ok()?;
    let mut out = vec![0u8; usize::try_from(desc.size).ok()?];
    renderer.read_region(desc.res_id, offset, &mut out).then_some(out)
}
