use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use foldexec_error::{FoldexecError, Result};

/// Knobs threaded through operator construction.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Memory budget for a single group hash table, in bytes.
    pub work_mem_bytes: usize,

    /// Number of spill partitions created when a hash table first overflows.
    pub spill_partitions: usize,

    /// Capacity in bytes of each redistribution ring buffer.
    pub redistribute_ring_bytes: usize,

    /// Initial group hash table capacity (entries, rounded up to a power of
    /// two).
    pub hash_table_init_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            work_mem_bytes: 4 * 1024 * 1024,
            spill_partitions: 32,
            redistribute_ring_bytes: 64 * 1024,
            hash_table_init_capacity: 256,
        }
    }
}

/// Cooperative cancellation flag checked at every fetch and inside
/// long-running scans.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn check(&self) -> Result<()> {
        if self.flag.load(Ordering::Relaxed) {
            return Err(FoldexecError::new("query canceled"));
        }
        Ok(())
    }
}
