//! # Allocation Scheme Policies
//!
//! Two orthogonal decisions are made every time an allocator needs a fresh
//! block, each captured by one policy type:
//!
//! - [`ExponentialPolicy`]: the Nth block created by one allocator instance
//!   is `min(2^N MiB, ALLOCATOR_MAX_BLOCK_BYTES)`, but never smaller than
//!   the request that triggered it. N resets per allocator instance, not
//!   globally, so short-lived tables stay at 1 MiB blocks while big sorts
//!   ramp up quickly.
//!
//! - [`PreferRamOverMmap`]: charge the RAM counter first; if that would
//!   exceed the RAM ceiling, roll the charge back and spill to the
//!   memory-mapped record file. The MMAP leg admits a block as long as
//!   consumption is still under the MMAP ceiling, so one block may
//!   overshoot it; once at or past the ceiling, further blocks are refused
//!   with `RecordFileFull`. This is synchronous backpressure: nothing
//!   blocks waiting for memory to free up.
//!
//! The per-table variant pre-checks the [`TableResourceMonitor`] with the
//! prospective block size and fails fast without touching the global
//! monitor. Enforcement is therefore block-granular: allocations served
//! from an existing block only adjust the consumption counter.

use eyre::Result;
use tracing::debug;

use crate::config::{ALLOCATOR_MAX_BLOCK_MB_EXP, MIB};
use crate::memory::{chunk_footprint, MemoryMonitor, Source, TableResourceMonitor};
use crate::result::{engine_error, ErrorKind};

/// Block-size growth policy.
pub struct ExponentialPolicy;

impl ExponentialPolicy {
    /// Size of the next block for an allocator that has already created
    /// `number_of_blocks` blocks, servicing a request of
    /// `n_bytes_requested` user bytes.
    pub fn block_size(number_of_blocks: usize, n_bytes_requested: usize) -> usize {
        let exp = (number_of_blocks as u32).min(ALLOCATOR_MAX_BLOCK_MB_EXP);
        let policy_size = MIB << exp;
        policy_size.max(chunk_footprint(n_bytes_requested))
    }
}

/// Block-source policy: RAM while it lasts, then the record file.
pub struct PreferRamOverMmap;

impl PreferRamOverMmap {
    /// Picks the source for a block of `block_size` bytes and charges the
    /// matching monitor counter. On `RecordFileFull` nothing is charged.
    pub fn block_source(monitor: &MemoryMonitor, block_size: usize) -> Result<Source> {
        if monitor.increase_ram(block_size) <= monitor.ram_threshold() {
            return Ok(Source::Ram);
        }
        monitor.decrease_ram(block_size);

        if monitor.mmap_consumption() < monitor.mmap_threshold() {
            monitor.increase_mmap(block_size);
            debug!(block_size, "RAM ceiling reached, spilling block to mmap");
            return Ok(Source::MmapFile);
        }

        Err(engine_error(
            ErrorKind::RecordFileFull,
            format!(
                "block of {} bytes exceeds both ceilings (RAM {}/{}, MMAP {}/{})",
                block_size,
                monitor.ram_consumption(),
                monitor.ram_threshold(),
                monitor.mmap_consumption(),
                monitor.mmap_threshold(),
            ),
        ))
    }

    /// Like [`Self::block_source`], but first verifies the per-table
    /// ceiling would not be exceeded by the new block. Fails fast without
    /// touching the global monitor.
    pub fn block_source_obeying_limit(
        table_monitor: &TableResourceMonitor,
        monitor: &MemoryMonitor,
        block_size: usize,
    ) -> Result<Source> {
        let consumption = table_monitor.consumption();
        if consumption + block_size > table_monitor.threshold() {
            return Err(engine_error(
                ErrorKind::RecordFileFull,
                format!(
                    "block of {} bytes exceeds the per-table limit ({} of {} bytes used)",
                    block_size,
                    consumption,
                    table_monitor.threshold(),
                ),
            ));
        }
        Self::block_source(monitor, block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ALLOCATOR_MAX_BLOCK_BYTES;

    const KIB: usize = 1024;

    #[test]
    fn block_size_grows_exponentially_to_the_cap() {
        assert_eq!(ExponentialPolicy::block_size(0, KIB), MIB);
        assert_eq!(ExponentialPolicy::block_size(1, KIB), 2 * MIB);
        assert_eq!(ExponentialPolicy::block_size(2, KIB), 4 * MIB);
        assert_eq!(
            ExponentialPolicy::block_size(9, KIB),
            ALLOCATOR_MAX_BLOCK_BYTES
        );
        assert_eq!(
            ExponentialPolicy::block_size(100, KIB),
            ALLOCATOR_MAX_BLOCK_BYTES
        );
    }

    #[test]
    fn block_size_is_monotonic() {
        let mut last = 0;
        for n in 0..16 {
            let size = ExponentialPolicy::block_size(n, KIB);
            assert!(size >= last);
            last = size;
        }
    }

    #[test]
    fn oversized_request_exceeds_the_cap() {
        let huge = ALLOCATOR_MAX_BLOCK_BYTES + MIB;
        let size = ExponentialPolicy::block_size(0, huge);
        assert!(size >= huge);
    }

    #[test]
    fn ram_is_preferred_while_under_threshold() {
        let monitor = MemoryMonitor::with_thresholds(MIB, MIB, true);
        let source = PreferRamOverMmap::block_source(&monitor, MIB).unwrap();
        assert_eq!(source, Source::Ram);
        assert_eq!(monitor.ram_consumption(), MIB);
        assert_eq!(monitor.mmap_consumption(), 0);
    }

    #[test]
    fn oversized_block_spills_to_mmap_and_rolls_ram_back() {
        let monitor = MemoryMonitor::with_thresholds(MIB, MIB, true);

        let source = PreferRamOverMmap::block_source(&monitor, 2 * MIB).unwrap();
        assert_eq!(source, Source::MmapFile);
        assert_eq!(monitor.ram_consumption(), 0);
        assert_eq!(monitor.mmap_consumption(), 2 * MIB);

        // Both ceilings are now exhausted; another oversized block is refused.
        let err = PreferRamOverMmap::block_source(&monitor, 2 * MIB).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::RecordFileFull));
        assert_eq!(monitor.ram_consumption(), 0);
        assert_eq!(monitor.mmap_consumption(), 2 * MIB);
    }

    #[test]
    fn mmap_disabled_fails_closed() {
        let monitor = MemoryMonitor::with_thresholds(MIB, MIB, false);
        let err = PreferRamOverMmap::block_source(&monitor, 2 * MIB).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::RecordFileFull));
    }

    #[test]
    fn per_table_limit_is_prechecked() {
        let monitor = MemoryMonitor::with_thresholds(16 * MIB, 0, false);
        let table = TableResourceMonitor::new(2 * MIB);
        table.increase(1304 * KIB);

        let err =
            PreferRamOverMmap::block_source_obeying_limit(&table, &monitor, 1024 * KIB)
                .unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::RecordFileFull));

        // Fast failure: neither the table counter nor the global monitor moved.
        assert_eq!(table.consumption(), 1304 * KIB);
        assert_eq!(monitor.ram_consumption(), 0);
    }
}
