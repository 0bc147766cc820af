use bitflags::bitflags;

bitflags! {
    /// Bits of the shared `status` word. Written by the remote, except that the local watchdog
    /// owner clears [`RingStatus::ALIVE`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RingStatus: u32 {
        /// The remote is asleep and needs a notify to look at the ring again.
        const IDLE = 1 << 0;
        /// Unrecoverable desynchronization; the local side must abort.
        const FATAL = 1 << 1;
        /// Liveness heartbeat, reasserted by the remote every report period.
        const ALIVE = 1 << 2;
    }
}
