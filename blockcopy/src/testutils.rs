use std::sync::Arc;

use crate::config::CopyConfig;
use crate::copy::BlockCopyState;
use crate::device::{MemoryDevice, WriteFlags};

pub const CLUSTER: u64 = 64 * 1024;

/// Deterministic non-zero test data.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 512) as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}

/// Configuration where every copy task covers a single cluster and offload is off.
pub fn cluster_tasks() -> CopyConfig {
    CopyConfig {
        max_buffer: CLUSTER,
        use_copy_range: false,
        ..Default::default()
    }
}

pub struct Setup {
    pub source: Arc<MemoryDevice>,
    pub target: Arc<MemoryDevice>,
    pub state: Arc<BlockCopyState>,
}

/// Copy state between `source` and `target` with every cluster dirty.
pub fn setup_with(source: MemoryDevice, target: MemoryDevice, config: CopyConfig) -> Setup {
    let source = Arc::new(source);
    let target = Arc::new(target);
    let state = BlockCopyState::new(
        source.clone(),
        target.clone(),
        WriteFlags::default(),
        config,
    )
    .unwrap();
    state.dirty_bitmap().set_all();
    Setup {
        source,
        target,
        state,
    }
}

/// A source of `size` bytes filled with [`pattern`] and an empty target of the same size.
pub fn setup(size: u64, config: CopyConfig) -> Setup {
    setup_with(filled_source(size), MemoryDevice::new("target", size, CLUSTER), config)
}

pub fn filled_source(size: u64) -> MemoryDevice {
    let source = MemoryDevice::new("source", size, CLUSTER);
    source.fill(0, &pattern(size as usize, 7));
    source
}
