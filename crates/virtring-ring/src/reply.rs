use virtring_cs::CommandDecoder;
use virtring_shmem::SharedRegion;

/// Reply bytes of a completed [`crate::Ring::submit_command_with_reply`].
///
/// Holds a reference to the reply region, so the bytes stay mapped for as long as the reply is
/// alive even if the reply pool has moved on.
#[derive(Debug, Clone)]
pub struct Reply {
    region: SharedRegion,
    offset: usize,
    size: usize,
    seqno: u32,
}

impl Reply {
    pub(crate) fn new(region: SharedRegion, offset: usize, size: usize, seqno: u32) -> Self {
        Self {
            region,
            offset,
            size,
            seqno,
        }
    }

    /// Ring seqno of the command that produced this reply.
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn decoder(&self) -> CommandDecoder<'_> {
        // SAFETY: the remote finished writing the reply before head passed `seqno`, and pool
        // allocations are never handed out twice, so nobody writes these bytes any more.
        CommandDecoder::new(unsafe { self.region.as_slice(self.offset, self.size) })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        self.region.read(self.offset, &mut out);
        out
    }
}
