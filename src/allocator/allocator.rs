//! # Allocator
//!
//! The engine's allocation front end. One `Allocator` services a single
//! table (single-writer, not `Send`); clones are cheap handles over the
//! same reference-counted state, so container-style allocator propagation
//! never duplicates or loses block bookkeeping. By contract any two
//! handles are interchangeable; equality is definitionally true.
//!
//! ## Block selection
//!
//! An allocation is served, in order, from:
//!
//! 1. the thread's shared keep-alive block, when one was claimed and can
//!    accommodate the request;
//! 2. a freshly initialized shared block, when the slot is claimed but
//!    still empty;
//! 3. the allocator's own current block;
//! 4. a new current block sized by [`ExponentialPolicy`] and sourced by
//!    [`PreferRamOverMmap`] under both monitors.
//!
//! The per-table monitor is increased by the requested bytes on every
//! successful allocation, including ones served from the shared block.
//!
//! ## Deallocation
//!
//! The chunk's stored offset word recovers the owning block in O(1). A
//! block whose live-chunk count reaches zero is destroyed immediately,
//! unless it is the shared keep-alive block, which only its pool guard
//! destroys. Destroying a block returns its bytes to the global monitor;
//! the per-table monitor is decreased by the chunk bytes regardless.

use std::alloc::Layout;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

use allocator_api2::alloc::{AllocError, Allocator as RawAllocator};
use eyre::Result;
use hashbrown::HashMap;

use crate::allocator::{ExponentialPolicy, PreferRamOverMmap, SharedBlock};
use crate::config::CHUNK_ALIGN;
use crate::memory::{Block, Chunk, MemoryMonitor, TableResourceMonitor};
use crate::result::{engine_error, ErrorKind};

struct BlockEntry {
    block: Block,
    live_chunks: usize,
}

struct Inner {
    mem_monitor: Arc<MemoryMonitor>,
    table_monitor: Arc<TableResourceMonitor>,
    shared: Option<Rc<SharedBlock>>,
    /// Base address of the block new private allocations go to.
    current: Option<usize>,
    /// Every live private block, keyed by base address.
    blocks: HashMap<usize, BlockEntry>,
    /// Input to the exponential size policy; never decremented.
    number_of_blocks: usize,
    /// Typed-error side channel for the `allocator_api2` boundary.
    last_alloc_error: Option<eyre::Report>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, entry) in self.blocks.drain() {
            self.mem_monitor
                .decrease(entry.block.source(), entry.block.size());
        }
    }
}

/// Rebindable allocation handle backed by the block/chunk machinery.
pub struct Allocator {
    inner: Rc<RefCell<Inner>>,
}

impl Allocator {
    pub fn new(
        mem_monitor: Arc<MemoryMonitor>,
        table_monitor: Arc<TableResourceMonitor>,
        shared: Option<Rc<SharedBlock>>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                mem_monitor,
                table_monitor,
                shared,
                current: None,
                blocks: HashMap::new(),
                number_of_blocks: 0,
                last_alloc_error: None,
            })),
        }
    }

    /// Allocates `n_bytes` of chunk data. Zero-byte requests return a
    /// dangling pointer without touching any state.
    pub fn allocate_bytes(&self, n_bytes: usize) -> Result<NonNull<u8>> {
        if n_bytes == 0 {
            return Ok(NonNull::dangling());
        }

        let mut inner = self.inner.borrow_mut();

        // Steps 1 and 2: the shared keep-alive block.
        if let Some(shared) = inner.shared.clone() {
            let mem = Arc::clone(&inner.mem_monitor);
            let table = Arc::clone(&inner.table_monitor);
            let served = shared.with(|slot| -> Result<Option<NonNull<u8>>> {
                match slot {
                    Some(block) if block.can_accommodate(n_bytes) => {
                        Ok(Some(block.allocate(n_bytes)))
                    }
                    Some(_) => Ok(None),
                    None => {
                        let size = ExponentialPolicy::block_size(0, n_bytes);
                        let source =
                            PreferRamOverMmap::block_source_obeying_limit(&table, &mem, size)?;
                        let mut block = match Block::new(size, source) {
                            Ok(block) => block,
                            Err(e) => {
                                mem.decrease(source, size);
                                return Err(e);
                            }
                        };
                        let ptr = block.allocate(n_bytes);
                        *slot = Some(block);
                        Ok(Some(ptr))
                    }
                }
            })?;
            if let Some(ptr) = served {
                inner.table_monitor.increase(n_bytes);
                return Ok(ptr);
            }
        }

        // Step 3: the allocator's own current block.
        if let Some(base) = inner.current {
            let fits = inner
                .blocks
                .get(&base)
                .is_some_and(|e| e.block.can_accommodate(n_bytes));
            if fits {
                let entry = inner.blocks.get_mut(&base).expect("current block is live");
                let ptr = entry.block.allocate(n_bytes);
                entry.live_chunks += 1;
                inner.table_monitor.increase(n_bytes);
                return Ok(ptr);
            }
        }

        // Step 4: grow.
        let size = ExponentialPolicy::block_size(inner.number_of_blocks, n_bytes);
        let source = PreferRamOverMmap::block_source_obeying_limit(
            &inner.table_monitor,
            &inner.mem_monitor,
            size,
        )?;
        let mut block = match Block::new(size, source) {
            Ok(block) => block,
            Err(e) => {
                inner.mem_monitor.decrease(source, size);
                return Err(e);
            }
        };
        let ptr = block.allocate(n_bytes);
        let base = block.base_addr();
        inner.blocks.insert(
            base,
            BlockEntry {
                block,
                live_chunks: 1,
            },
        );
        inner.current = Some(base);
        inner.number_of_blocks += 1;
        inner.table_monitor.increase(n_bytes);
        Ok(ptr)
    }

    /// Returns a chunk previously obtained from [`Self::allocate_bytes`].
    /// Zero-byte deallocations are a no-op.
    pub fn deallocate_bytes(&self, ptr: NonNull<u8>, n_bytes: usize) {
        if n_bytes == 0 {
            return;
        }

        let mut inner = self.inner.borrow_mut();
        inner.table_monitor.decrease(n_bytes);

        // SAFETY: per this method's contract `ptr` came from
        // `allocate_bytes` on a handle sharing this state, and its block is
        // still live (blocks only die in this method and in teardown).
        let base = unsafe { Chunk::from_data_ptr(ptr) }.owning_block_addr();

        // The shared block is keep-alive: only its pool guard destroys it.
        if let Some(shared) = &inner.shared {
            if shared.base_addr() == Some(base) {
                return;
            }
        }

        let entry = inner
            .blocks
            .get_mut(&base)
            .expect("deallocated chunk does not belong to this allocator");
        entry.live_chunks -= 1;
        if entry.live_chunks == 0 {
            let entry = inner
                .blocks
                .remove(&base)
                .expect("entry was just looked up");
            inner
                .mem_monitor
                .decrease(entry.block.source(), entry.block.size());
            if inner.current == Some(base) {
                inner.current = None;
            }
        }
    }

    /// Sum of this allocator's live private block sizes (the shared block
    /// is owned by the pool guard and not counted here).
    pub fn private_block_bytes(&self) -> usize {
        let inner = self.inner.borrow();
        inner.blocks.values().map(|e| e.block.size()).sum()
    }

    /// Takes the typed error behind the most recent `AllocError` returned
    /// through the `allocator_api2` trait surface.
    pub fn take_alloc_error(&self) -> eyre::Report {
        self.inner
            .borrow_mut()
            .last_alloc_error
            .take()
            .unwrap_or_else(|| {
                engine_error(ErrorKind::OutOfMemory, "container allocation failed")
            })
    }

    fn record_alloc_error(&self, report: eyre::Report) {
        self.inner.borrow_mut().last_alloc_error = Some(report);
    }
}

impl Clone for Allocator {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

// Any two handles are interchangeable by contract, the property container
// allocators require under rebinding.
impl PartialEq for Allocator {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for Allocator {}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Allocator")
            .field("blocks", &inner.blocks.len())
            .field("number_of_blocks", &inner.number_of_blocks)
            .field("shared", &inner.shared.is_some())
            .finish()
    }
}

// SAFETY: allocate hands out chunk data regions that stay valid and
// disjoint until deallocated; blocks are only destroyed once their last
// chunk is returned, and clones share the same state so pointers may be
// deallocated through any handle.
unsafe impl RawAllocator for Allocator {
    fn allocate(&self, layout: Layout) -> std::result::Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            // SAFETY: an alignment is never zero, so this is a valid
            // dangling pointer for zero-sized allocations.
            let ptr = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
            return Ok(NonNull::slice_from_raw_parts(ptr, 0));
        }
        if layout.align() > CHUNK_ALIGN {
            self.record_alloc_error(engine_error(
                ErrorKind::Unsupported,
                format!("alignment {} exceeds chunk alignment", layout.align()),
            ));
            return Err(AllocError);
        }
        match self.allocate_bytes(layout.size()) {
            Ok(ptr) => Ok(NonNull::slice_from_raw_parts(ptr, layout.size())),
            Err(e) => {
                self.record_alloc_error(e);
                Err(AllocError)
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.deallocate_bytes(ptr, layout.size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SharedBlockPool;
    use crate::config::MIB;

    fn monitors(
        ram: usize,
        mmap: usize,
        use_mmap: bool,
        table_limit: usize,
    ) -> (Arc<MemoryMonitor>, Arc<TableResourceMonitor>) {
        (
            Arc::new(MemoryMonitor::with_thresholds(ram, mmap, use_mmap)),
            Arc::new(TableResourceMonitor::new(table_limit)),
        )
    }

    #[test]
    fn zero_byte_requests_touch_nothing() {
        let (mem, table) = monitors(16 * MIB, 0, false, usize::MAX);
        let alloc = Allocator::new(Arc::clone(&mem), Arc::clone(&table), None);

        let ptr = alloc.allocate_bytes(0).unwrap();
        alloc.deallocate_bytes(ptr, 0);

        assert_eq!(mem.ram_consumption(), 0);
        assert_eq!(table.consumption(), 0);
    }

    #[test]
    fn small_allocations_share_one_block() {
        let (mem, table) = monitors(16 * MIB, 0, false, usize::MAX);
        let alloc = Allocator::new(Arc::clone(&mem), Arc::clone(&table), None);

        let a = alloc.allocate_bytes(100).unwrap();
        let b = alloc.allocate_bytes(200).unwrap();

        // One 1 MiB block serves both; the table monitor counts user bytes.
        assert_eq!(mem.ram_consumption(), MIB);
        assert_eq!(alloc.private_block_bytes(), MIB);
        assert_eq!(table.consumption(), 300);

        alloc.deallocate_bytes(a, 100);
        assert_eq!(mem.ram_consumption(), MIB);
        assert_eq!(table.consumption(), 200);

        // Last chunk gone: the block itself is destroyed.
        alloc.deallocate_bytes(b, 200);
        assert_eq!(mem.ram_consumption(), 0);
        assert_eq!(alloc.private_block_bytes(), 0);
        assert_eq!(table.consumption(), 0);
    }

    #[test]
    fn blocks_grow_exponentially() {
        let (mem, table) = monitors(64 * MIB, 0, false, usize::MAX);
        let alloc = Allocator::new(Arc::clone(&mem), Arc::clone(&table), None);

        let a = alloc.allocate_bytes(MIB / 2).unwrap();
        assert_eq!(mem.ram_consumption(), MIB);

        // Does not fit the 1 MiB block: second block is 2 MiB.
        let b = alloc.allocate_bytes(MIB).unwrap();
        assert_eq!(mem.ram_consumption(), 3 * MIB);

        alloc.deallocate_bytes(b, MIB);
        alloc.deallocate_bytes(a, MIB / 2);
        assert_eq!(mem.ram_consumption(), 0);
    }

    #[test]
    fn clones_share_state() {
        let (mem, table) = monitors(16 * MIB, 0, false, usize::MAX);
        let alloc = Allocator::new(Arc::clone(&mem), Arc::clone(&table), None);
        let rebound = alloc.clone();

        let ptr = alloc.allocate_bytes(64).unwrap();
        assert_eq!(rebound.private_block_bytes(), MIB);

        // Deallocating through the clone is the same as through the origin.
        rebound.deallocate_bytes(ptr, 64);
        assert_eq!(mem.ram_consumption(), 0);
        assert_eq!(alloc, rebound);
    }

    #[test]
    fn shared_block_is_kept_alive_across_deallocation() {
        let (mem, table) = monitors(16 * MIB, 0, false, usize::MAX);
        let pool = SharedBlockPool::new();
        let guard = Rc::new(pool.claim(11, Arc::clone(&mem)).unwrap());

        let alloc = Allocator::new(Arc::clone(&mem), Arc::clone(&table), Some(Rc::clone(&guard)));

        let ptr = alloc.allocate_bytes(128).unwrap();
        assert_eq!(mem.ram_consumption(), MIB);
        assert_eq!(alloc.private_block_bytes(), 0, "served from the shared block");

        // The keep-alive block survives its last chunk.
        alloc.deallocate_bytes(ptr, 128);
        assert_eq!(mem.ram_consumption(), MIB);
        assert_eq!(table.consumption(), 0);

        // Only explicit teardown of the guard releases it.
        drop(alloc);
        drop(guard);
        assert_eq!(mem.ram_consumption(), 0);
    }

    #[test]
    fn cooperating_allocators_coalesce_into_the_shared_block() {
        let (mem, table_a) = monitors(16 * MIB, 0, false, usize::MAX);
        let table_b = Arc::new(TableResourceMonitor::new(usize::MAX));
        let pool = SharedBlockPool::new();
        let guard = Rc::new(pool.claim(5, Arc::clone(&mem)).unwrap());

        let a = Allocator::new(Arc::clone(&mem), table_a, Some(Rc::clone(&guard)));
        let b = Allocator::new(Arc::clone(&mem), table_b, Some(Rc::clone(&guard)));

        let pa = a.allocate_bytes(100).unwrap();
        let pb = b.allocate_bytes(100).unwrap();

        // Both requests landed in the single shared block.
        assert_eq!(mem.ram_consumption(), MIB);
        assert_eq!(a.private_block_bytes(), 0);
        assert_eq!(b.private_block_bytes(), 0);

        a.deallocate_bytes(pa, 100);
        b.deallocate_bytes(pb, 100);
        drop((a, b));
        drop(guard);
        assert_eq!(mem.ram_consumption(), 0);
    }

    #[test]
    fn per_table_ceiling_fails_with_typed_error() {
        let (mem, table) = monitors(16 * MIB, 0, false, MIB / 2);
        let alloc = Allocator::new(Arc::clone(&mem), Arc::clone(&table), None);

        // The 1 MiB first block alone exceeds the 512 KiB table ceiling.
        let err = alloc.allocate_bytes(64).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::RecordFileFull));
        assert_eq!(mem.ram_consumption(), 0);
        assert_eq!(table.consumption(), 0);
    }

    #[test]
    fn trait_surface_preserves_typed_errors() {
        let (mem, table) = monitors(16 * MIB, 0, false, MIB / 2);
        let alloc = Allocator::new(mem, table, None);

        let layout = Layout::from_size_align(64, 8).unwrap();
        assert!(RawAllocator::allocate(&alloc, layout).is_err());

        let err = alloc.take_alloc_error();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::RecordFileFull));
    }

    #[test]
    fn trait_surface_serves_group_aligned_layouts() {
        let (mem, table) = monitors(16 * MIB, 0, false, usize::MAX);
        let alloc = Allocator::new(Arc::clone(&mem), table, None);

        // Hash tables request their control groups 16-byte aligned; the
        // chunk machinery must serve that without falling back.
        let layout = Layout::from_size_align(256, 16).unwrap();
        let ptr = RawAllocator::allocate(&alloc, layout).unwrap();
        assert_eq!(ptr.cast::<u8>().as_ptr() as usize % 16, 0);
        unsafe { RawAllocator::deallocate(&alloc, ptr.cast(), layout) };
        assert_eq!(mem.ram_consumption(), 0);

        // Stricter than CHUNK_ALIGN is refused with a typed error.
        let layout = Layout::from_size_align(64, 32).unwrap();
        assert!(RawAllocator::allocate(&alloc, layout).is_err());
        assert_eq!(
            ErrorKind::of(&alloc.take_alloc_error()),
            Some(ErrorKind::Unsupported)
        );
    }

    #[test]
    fn works_as_a_vec_allocator() {
        let (mem, table) = monitors(16 * MIB, 0, false, usize::MAX);
        let alloc = Allocator::new(Arc::clone(&mem), table, None);

        let mut v: allocator_api2::vec::Vec<u64, Allocator> =
            allocator_api2::vec::Vec::new_in(alloc.clone());
        for i in 0..1000 {
            v.push(i);
        }
        assert_eq!(v.len(), 1000);
        assert!(mem.ram_consumption() >= MIB);

        drop(v);
        assert_eq!(mem.ram_consumption(), 0);
    }
}
