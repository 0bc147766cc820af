use std::sync::Arc;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use virtring_cs::{CommandEncoder, EncoderConfig};
use virtring_shmem::{MemoryRenderer, SharedRegionPool};

fn reassemble(enc: &CommandEncoder) -> Vec<u8> {
    enc.committed_chunks()
        .flat_map(|c| c.bytes.iter().copied())
        .collect()
}

fn payload(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed ^ (i * 7)) as u8).collect()
}

#[test]
fn chunks_reference_the_regions_they_live_in() {
    let mem = Arc::new(MemoryRenderer::new());
    let mut enc = CommandEncoder::shmem_array(
        mem.clone(),
        EncoderConfig {
            min_buffer_size: 32,
            growth_factor: 4,
        },
    );
    enc.append(&payload(1, 30)).unwrap();
    enc.append(&payload(2, 30)).unwrap();
    enc.commit();

    let chunks: Vec<_> = enc.committed_chunks().collect();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].shmem.unwrap().size(), 128);
    for chunk in &chunks {
        let region = chunk.shmem.unwrap();
        let mut remote = vec![0u8; chunk.bytes.len()];
        assert!(mem.read_region(region.res_id(), chunk.offset, &mut remote));
        assert_eq!(remote, chunk.bytes);
    }
}

proptest! {
    #[test]
    fn commit_twice_never_double_counts(
        writes in proptest::collection::vec(0usize..300, 1..20),
        pooled in any::<bool>(),
    ) {
        let mem = Arc::new(MemoryRenderer::new());
        let config = EncoderConfig { min_buffer_size: 64, growth_factor: 2 };
        let mut enc = if pooled {
            CommandEncoder::shmem_pool(Arc::new(SharedRegionPool::new(mem, 1024)), config)
        } else {
            CommandEncoder::shmem_array(mem, config)
        };

        let mut expected = Vec::new();
        for (i, &len) in writes.iter().enumerate() {
            let data = payload(i, len);
            enc.append(&data).unwrap();
            expected.extend_from_slice(&data);
            prop_assert_eq!(enc.len(), expected.len());
        }

        enc.commit();
        let once = enc.len();
        enc.commit();
        prop_assert_eq!(enc.len(), once);
        prop_assert_eq!(once, expected.len());
        prop_assert_eq!(reassemble(&enc), expected);
    }

    #[test]
    fn array_reuse_after_reset_preserves_earlier_bytes(
        first in 1usize..200,
        second in 1usize..200,
    ) {
        let mem = Arc::new(MemoryRenderer::new());
        let mut enc = CommandEncoder::shmem_array(mem, EncoderConfig::default());

        enc.append(&payload(1, first)).unwrap();
        enc.commit();
        let region = enc.committed_chunks().next().unwrap().shmem.unwrap().clone();

        enc.reset();
        enc.append(&payload(2, second)).unwrap();
        enc.commit();
        prop_assert_eq!(reassemble(&enc), payload(2, second));

        let mut old = vec![0u8; first];
        region.read(0, &mut old);
        prop_assert_eq!(old, payload(1, first));
    }
}
