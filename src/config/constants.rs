//! # Engine Constants
//!
//! This module centralizes the engine's compile-time constants, grouping
//! interdependent values together. Constants that depend on each other are
//! co-located to prevent mismatch bugs.
//!
//! ```text
//! MIB (1048576 bytes)
//!       │
//!       ├─> ALLOCATOR_MAX_BLOCK_BYTES (derived: MIB << ALLOCATOR_MAX_BLOCK_MB_EXP)
//!       │     Upper bound for the exponential block-growth policy. A single
//!       │     oversized allocation may still exceed it.
//!       │
//!       └─> First block created by an allocator instance is exactly 1 MiB.
//!
//! CHUNK_ALIGN (16 bytes)
//!       │
//!       ├─> CHUNK_HEADER_BYTES (one aligned header slot whose leading
//!       │     machine word is the offset back to the owning block, stored
//!       │     immediately before the chunk data)
//!       │
//!       └─> Storage page element arrays are padded to this alignment so
//!           in-place row objects are well-aligned.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `ALLOCATOR_MAX_BLOCK_BYTES == MIB << ALLOCATOR_MAX_BLOCK_MB_EXP`
//! 2. `CHUNK_ALIGN` is a power of two covering both one machine word and
//!    the widest alignment the engine's containers request (hash tables
//!    allocate their control groups 16-byte aligned)
//! 3. `CHUNK_HEADER_BYTES` is a multiple of `CHUNK_ALIGN`, so chunk data
//!    inherits the block base alignment
//! 4. `SHARED_BLOCK_SLOTS` is a power of two (the slot index is a mask of
//!    the thread token)

/// One mebibyte. The unit of the exponential block-size policy.
pub const MIB: usize = 1024 * 1024;

/// Exponent of the largest block the growth policy will request, in MiB.
/// The Nth block created by one allocator instance is `min(2^N, 2^9)` MiB.
pub const ALLOCATOR_MAX_BLOCK_MB_EXP: u32 = 9;

/// Size cap for policy-sized blocks (512 MiB). Oversized single requests
/// may exceed this; the policy never does on its own.
pub const ALLOCATOR_MAX_BLOCK_BYTES: usize = MIB << ALLOCATOR_MAX_BLOCK_MB_EXP;

/// Bytes of chunk metadata: one aligned header slot written immediately
/// before the user data region. Its leading machine word holds the chunk's
/// offset from its block base; the rest is padding keeping the data region
/// at block alignment.
pub const CHUNK_HEADER_BYTES: usize = CHUNK_ALIGN;

/// Alignment of every chunk data region. Sized for the strictest request
/// the engine's containers make (hashbrown's 16-byte control groups);
/// anything stricter is rejected.
pub const CHUNK_ALIGN: usize = 16;

/// Number of slots in the process-wide shared-block pool. Slots are claimed
/// by thread identity; a collision makes the loser fall back to private
/// blocks, so this only needs to be large enough to keep collisions rare.
pub const SHARED_BLOCK_SLOTS: usize = 64;

/// Target gross size of one storage page (meta bytes + element array).
/// The element count per page is derived from this and the element size.
pub const STORAGE_PAGE_BYTES_TARGET: usize = 64 * 1024;

/// Default RAM ceiling as a percentage of system memory, used by
/// `MemoryMonitor::auto_detect`.
pub const DEFAULT_RAM_BUDGET_PERCENT: usize = 25;

/// Floor for the auto-detected RAM ceiling (16 MiB). Even on small hosts
/// the engine needs room for a few blocks.
pub const MIN_RAM_THRESHOLD_FLOOR: usize = 16 * MIB;

/// Default MMAP ceiling (1 GiB) when the embedder enables MMAP spillover
/// without supplying an explicit limit.
pub const DEFAULT_MMAP_THRESHOLD: usize = 1024 * MIB;

const _: () = assert!(
    ALLOCATOR_MAX_BLOCK_BYTES == MIB << ALLOCATOR_MAX_BLOCK_MB_EXP,
    "ALLOCATOR_MAX_BLOCK_BYTES derivation mismatch"
);

const _: () = assert!(
    CHUNK_ALIGN.is_power_of_two() && CHUNK_ALIGN >= std::mem::size_of::<usize>(),
    "CHUNK_ALIGN must be a power of two covering the chunk header word"
);

const _: () = assert!(
    CHUNK_HEADER_BYTES % CHUNK_ALIGN == 0 && CHUNK_HEADER_BYTES >= std::mem::size_of::<usize>(),
    "CHUNK_HEADER_BYTES must keep chunk data at block alignment"
);

const _: () = assert!(
    SHARED_BLOCK_SLOTS.is_power_of_two(),
    "SHARED_BLOCK_SLOTS must be a power of two"
);
