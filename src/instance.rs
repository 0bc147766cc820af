use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};
use virtring_cs::protocol::ControlCommand;
use virtring_cs::CommandEncoder;
use virtring_ring::{FatalHandler, Reply, Ring, RingError, Submission, WatchdogRegistry};
use virtring_shmem::{Renderer, SharedRegionPool, SyncPoint, WaitStatus};

use crate::config::InstanceConfig;
use crate::error::Result;

/// One connection to a remote renderer.
///
/// Owns the primary ring, the pools encoders and replies are carved from, the watchdog shared by
/// every ring of the connection and the roundtrip counter.
pub struct Instance {
    renderer: Arc<dyn Renderer>,
    config: InstanceConfig,
    registry: Arc<WatchdogRegistry>,
    fatal: FatalHandler,
    cs_pool: Arc<SharedRegionPool>,
    reply_pool: SharedRegionPool,
    ring: Ring,
    next_ring_id: AtomicU64,
    /// Next roundtrip seqno. Held across the submission so seqnos reach the remote in order.
    roundtrip_next: Mutex<u32>,
}

impl Instance {
    pub fn new(renderer: Arc<dyn Renderer>, config: InstanceConfig) -> Result<Self> {
        Self::with_fatal_handler(renderer, config, FatalHandler::new())
    }

    /// Like [`Instance::new`], with `fatal` deciding what happens on a fatal desynchronization.
    pub fn with_fatal_handler(
        renderer: Arc<dyn Renderer>,
        mut config: InstanceConfig,
        fatal: FatalHandler,
    ) -> Result<Self> {
        config.apply_debug_flags();

        let registry = Arc::new(WatchdogRegistry::new());
        let cs_pool = Arc::new(SharedRegionPool::new(
            renderer.clone(),
            config.cs_pool_min_alloc,
        ));
        let reply_pool = SharedRegionPool::new(renderer.clone(), config.reply_pool_min_alloc);

        let next_ring_id = AtomicU64::new(1);
        let ring = Ring::create(
            renderer.clone(),
            registry.clone(),
            fatal.clone(),
            next_ring_id.fetch_add(1, Ordering::Relaxed),
            config.ring.clone(),
        )?;
        debug!(ring_id = ring.id(), debug = ?config.debug, "instance ready");

        Ok(Self {
            renderer,
            config,
            registry,
            fatal,
            cs_pool,
            reply_pool,
            ring,
            next_ring_id,
            roundtrip_next: Mutex::new(1),
        })
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// The primary ring.
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn watchdog_registry(&self) -> &Arc<WatchdogRegistry> {
        &self.registry
    }

    pub fn cs_pool(&self) -> &Arc<SharedRegionPool> {
        &self.cs_pool
    }

    pub fn reply_pool(&self) -> &SharedRegionPool {
        &self.reply_pool
    }

    /// Encoder suballocating from the instance's command-stream pool.
    pub fn create_encoder(&self) -> CommandEncoder {
        CommandEncoder::shmem_pool(self.cs_pool.clone(), self.config.encoder)
    }

    /// Encoder with dedicated regions, for long-lived streams that are reset and reused.
    pub fn create_array_encoder(&self) -> CommandEncoder {
        CommandEncoder::shmem_array(self.renderer.clone(), self.config.encoder)
    }

    /// An additional ring sharing this instance's renderer, watchdog and abort policy.
    pub fn create_queue_ring(&self) -> Result<Ring> {
        let id = self.next_ring_id.fetch_add(1, Ordering::Relaxed);
        let ring = Ring::create(
            self.renderer.clone(),
            self.registry.clone(),
            self.fatal.clone(),
            id,
            self.config.ring.clone(),
        )?;
        Ok(ring)
    }

    pub fn submit_command(&self, enc: &mut CommandEncoder) -> Result<Submission> {
        Ok(self.ring.submit_command(enc)?)
    }

    /// Submit `enc` on the primary ring and wait for its `reply_size`-byte reply.
    pub fn submit_command_with_reply(
        &self,
        enc: &mut CommandEncoder,
        reply_size: usize,
    ) -> Result<Reply> {
        Ok(self
            .ring
            .submit_command_with_reply(enc, &self.reply_pool, reply_size)?)
    }

    /// Ask the remote to publish a new roundtrip seqno once it has executed everything
    /// submitted so far. Returns the seqno to pass to [`Instance::wait_roundtrip`].
    pub fn submit_roundtrip(&self) -> Result<u32> {
        let mut next = self
            .roundtrip_next
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let seqno = *next;

        let bytes = ControlCommand::SubmitVirtqueueSeqno {
            ring_id: self.ring.id(),
            seqno,
        }
        .to_bytes()
        .map_err(RingError::from)?;
        self.renderer.submit_simple(&bytes)?;

        *next = seqno.wrapping_add(1);
        Ok(seqno)
    }

    pub fn wait_roundtrip(&self, seqno: u32) {
        self.ring.wait_roundtrip(seqno);
    }

    /// Full barrier with the remote.
    pub fn roundtrip(&self) -> Result<()> {
        let seqno = self.submit_roundtrip()?;
        self.wait_roundtrip(seqno);
        Ok(())
    }

    /// Wait until the remote has consumed everything on the primary ring.
    pub fn wait_all(&self) {
        self.ring.wait_all();
    }

    /// Wait for renderer sync points. `None` waits forever.
    pub fn wait_syncs(&self, syncs: &[SyncPoint], timeout: Option<Duration>) -> Result<WaitStatus> {
        let status = self.renderer.wait(syncs, timeout)?;
        if status == WaitStatus::TimedOut {
            warn!(count = syncs.len(), ?timeout, "renderer sync wait timed out");
        }
        Ok(status)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("ring", &self.ring)
            .field("cs_pool", &self.cs_pool)
            .field("debug", &self.config.debug)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtring_cs::protocol::decode_command;
    use virtring_shmem::MemoryRenderer;

    fn instance() -> (Arc<MemoryRenderer>, Instance) {
        let mem = Arc::new(MemoryRenderer::new());
        let config = InstanceConfig {
            cs_pool_min_alloc: 64 * 1024,
            reply_pool_min_alloc: 4096,
            ..InstanceConfig::default()
        };
        let instance = Instance::new(mem.clone(), config).unwrap();
        (mem, instance)
    }

    #[test]
    fn roundtrip_seqnos_increase_from_one() {
        let (mem, instance) = instance();
        mem.take_submissions();

        assert_eq!(instance.submit_roundtrip().unwrap(), 1);
        assert_eq!(instance.submit_roundtrip().unwrap(), 2);

        let sent: Vec<_> = mem
            .take_submissions()
            .iter()
            .map(|b| decode_command(&b.data).unwrap())
            .collect();
        assert_eq!(
            sent,
            vec![
                ControlCommand::SubmitVirtqueueSeqno { ring_id: 1, seqno: 1 },
                ControlCommand::SubmitVirtqueueSeqno { ring_id: 1, seqno: 2 },
            ]
        );
    }

    #[test]
    fn failed_roundtrip_does_not_consume_a_seqno() {
        let (mem, instance) = instance();
        mem.fail_next_submissions(1);
        assert!(instance.submit_roundtrip().is_err());
        assert_eq!(instance.submit_roundtrip().unwrap(), 1);
    }

    #[test]
    fn queue_rings_get_fresh_ids() {
        let (_mem, instance) = instance();
        let a = instance.create_queue_ring().unwrap();
        let b = instance.create_queue_ring().unwrap();
        assert_eq!(instance.ring().id(), 1);
        assert_eq!((a.id(), b.id()), (2, 3));
    }

    #[test]
    fn ring_creation_failure_is_reported() {
        let mem = Arc::new(MemoryRenderer::new());
        mem.fail_next_allocations(1);
        let err = Instance::new(mem, InstanceConfig::default()).unwrap_err();
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn wait_syncs_reports_timeouts() {
        let (mem, instance) = instance();
        let sync = SyncPoint {
            sync_id: 4,
            value: 2,
        };
        assert_eq!(
            instance
                .wait_syncs(&[sync], Some(Duration::from_millis(1)))
                .unwrap(),
            WaitStatus::TimedOut
        );
        mem.signal_sync(4, 2);
        assert_eq!(instance.wait_syncs(&[sync], None).unwrap(), WaitStatus::Signaled);
    }
}
