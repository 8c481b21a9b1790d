//! # Memory Monitors
//!
//! Consumption accounting for the allocator. Two scopes:
//!
//! - [`MemoryMonitor`]: aggregate RAM and MMAP consumption across every
//!   table sharing the monitor (the embedder typically holds one `Arc` for
//!   the whole process). Counters are lock-free atomics, safe for
//!   concurrent increase/decrease from unrelated tables and threads.
//! - [`TableResourceMonitor`]: one per table, enforcing the per-table
//!   ceiling independently of the global one. The threshold is captured at
//!   table-creation time and never re-read.
//!
//! Monitors only count; whether a request is admitted against a threshold
//! is decided by the source policy in [`crate::allocator`].
//!
//! ## Enforcement Model
//!
//! Hard limits: an allocation that would exceed a ceiling is refused with a
//! typed error rather than blocking until space frees up. Callers convert
//! the refusal into a rollback plus an error surfaced to the execution
//! layer, which owns any retry/spill-to-disk policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use sysinfo::System;

use crate::config::{DEFAULT_MMAP_THRESHOLD, DEFAULT_RAM_BUDGET_PERCENT, MIN_RAM_THRESHOLD_FLOOR};
use crate::memory::Source;

static SYSTEM_TOTAL_MEMORY: OnceLock<usize> = OnceLock::new();

/// Aggregate RAM/MMAP consumption counters with configured ceilings.
#[derive(Debug)]
pub struct MemoryMonitor {
    ram: AtomicUsize,
    mmap: AtomicUsize,
    ram_threshold: usize,
    mmap_threshold: usize,
    mmap_enabled: bool,
}

impl MemoryMonitor {
    /// Sizes the RAM ceiling from system memory (25%, floored at 16 MiB)
    /// and enables MMAP spillover with the default ceiling.
    pub fn auto_detect() -> Self {
        let total_memory = *SYSTEM_TOTAL_MEMORY.get_or_init(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.total_memory() as usize
        });

        let ram_threshold =
            ((total_memory * DEFAULT_RAM_BUDGET_PERCENT) / 100).max(MIN_RAM_THRESHOLD_FLOOR);

        Self::with_thresholds(ram_threshold, DEFAULT_MMAP_THRESHOLD, true)
    }

    /// Monitor with explicit ceilings. `mmap_threshold` is ignored (treated
    /// as zero) unless `use_mmap` is set: the MMAP ceiling fails closed.
    pub fn with_thresholds(ram_threshold: usize, mmap_threshold: usize, use_mmap: bool) -> Self {
        Self {
            ram: AtomicUsize::new(0),
            mmap: AtomicUsize::new(0),
            ram_threshold,
            mmap_threshold,
            mmap_enabled: use_mmap,
        }
    }

    pub fn ram_threshold(&self) -> usize {
        self.ram_threshold
    }

    /// The MMAP ceiling, or zero when MMAP use is disabled.
    pub fn mmap_threshold(&self) -> usize {
        if self.mmap_enabled {
            self.mmap_threshold
        } else {
            0
        }
    }

    pub fn ram_consumption(&self) -> usize {
        self.ram.load(Ordering::Acquire)
    }

    pub fn mmap_consumption(&self) -> usize {
        self.mmap.load(Ordering::Acquire)
    }

    /// Adds `bytes` to the RAM counter, returning the new total.
    pub fn increase_ram(&self, bytes: usize) -> usize {
        let previous = self.ram.fetch_add(bytes, Ordering::AcqRel);
        debug_assert!(previous <= usize::MAX - bytes, "RAM counter overflow");
        previous + bytes
    }

    pub fn decrease_ram(&self, bytes: usize) {
        let previous = self.ram.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "RAM counter underflow");
    }

    /// Adds `bytes` to the MMAP counter, returning the new total.
    pub fn increase_mmap(&self, bytes: usize) -> usize {
        let previous = self.mmap.fetch_add(bytes, Ordering::AcqRel);
        debug_assert!(previous <= usize::MAX - bytes, "MMAP counter overflow");
        previous + bytes
    }

    pub fn decrease_mmap(&self, bytes: usize) {
        let previous = self.mmap.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "MMAP counter underflow");
    }

    pub fn increase(&self, source: Source, bytes: usize) -> usize {
        match source {
            Source::Ram => self.increase_ram(bytes),
            Source::MmapFile => self.increase_mmap(bytes),
        }
    }

    pub fn decrease(&self, source: Source, bytes: usize) {
        match source {
            Source::Ram => self.decrease_ram(bytes),
            Source::MmapFile => self.decrease_mmap(bytes),
        }
    }
}

/// Per-table consumption counter with a ceiling fixed at construction.
#[derive(Debug)]
pub struct TableResourceMonitor {
    threshold: usize,
    consumption: AtomicUsize,
}

impl TableResourceMonitor {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            consumption: AtomicUsize::new(0),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn consumption(&self) -> usize {
        self.consumption.load(Ordering::Acquire)
    }

    /// Adds `bytes`, returning the new total. Admission against the
    /// threshold is the source policy's job, not this counter's.
    pub fn increase(&self, bytes: usize) -> usize {
        let previous = self.consumption.fetch_add(bytes, Ordering::AcqRel);
        debug_assert!(previous <= usize::MAX - bytes, "table counter overflow");
        previous + bytes
    }

    pub fn decrease(&self, bytes: usize) {
        let previous = self.consumption.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "table counter underflow");
    }
}
