//! # Shared-Block Slot Pool
//!
//! Small allocations from many short-lived tables on one thread would each
//! pay for a private 1 MiB block. The shared-block pool amortizes that: one
//! process-wide table of [`SHARED_BLOCK_SLOTS`] slots, each claimable by at
//! most one owner at a time, keyed by a modulo of the claiming thread's
//! token.
//!
//! Claiming is a single compare-and-swap on the slot's owner word. A
//! collision (two threads hashing to the same slot, or two tables on one
//! thread) makes the loser fall back to private block allocation, with
//! no blocking and no retry loop.
//!
//! The block living in a claimed slot is the "keep-alive" block: the
//! allocator never destroys it on `deallocate`, only the [`SharedBlock`]
//! guard's drop does, returning its bytes to the memory monitor and
//! releasing the slot.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::SHARED_BLOCK_SLOTS;
use crate::memory::{Block, MemoryMonitor};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// A stable, nonzero token identifying the calling thread.
pub fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// Process-wide pool of claimable shared-block slots.
#[derive(Debug)]
pub struct SharedBlockPool {
    // 0 marks a free slot; any other value is the owner's thread token.
    owners: [AtomicU64; SHARED_BLOCK_SLOTS],
}

impl SharedBlockPool {
    pub fn new() -> Arc<Self> {
        const FREE: AtomicU64 = AtomicU64::new(0);
        Arc::new(Self {
            owners: [FREE; SHARED_BLOCK_SLOTS],
        })
    }

    /// Tries to claim the slot for `token`. `None` means the slot is
    /// occupied and the caller should use private blocks instead.
    pub fn claim(
        self: &Arc<Self>,
        token: u64,
        monitor: Arc<MemoryMonitor>,
    ) -> Option<SharedBlock> {
        debug_assert_ne!(token, 0, "thread tokens are nonzero");
        let slot = (token as usize) & (SHARED_BLOCK_SLOTS - 1);

        match self.owners[slot].compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Some(SharedBlock {
                pool: Arc::clone(self),
                slot,
                monitor,
                block: RefCell::new(None),
            }),
            Err(_) => {
                debug!(slot, token, "shared-block slot occupied, using private blocks");
                None
            }
        }
    }
}

/// Exclusive guard over one claimed slot and the keep-alive block in it.
#[derive(Debug)]
pub struct SharedBlock {
    pool: Arc<SharedBlockPool>,
    slot: usize,
    monitor: Arc<MemoryMonitor>,
    block: RefCell<Option<Block>>,
}

impl SharedBlock {
    /// Runs `f` with exclusive access to the slot's block. `None` means the
    /// block has not been initialized yet.
    pub fn with<R>(&self, f: impl FnOnce(&mut Option<Block>) -> R) -> R {
        f(&mut self.block.borrow_mut())
    }

    /// Base address of the keep-alive block, if one exists.
    pub fn base_addr(&self) -> Option<usize> {
        self.block.borrow().as_ref().map(|b| b.base_addr())
    }
}

impl Drop for SharedBlock {
    fn drop(&mut self) {
        if let Some(block) = self.block.borrow_mut().take() {
            self.monitor.decrease(block.source(), block.size());
        }
        self.pool.owners[self.slot].store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Arc<MemoryMonitor> {
        Arc::new(MemoryMonitor::with_thresholds(usize::MAX, 0, false))
    }

    #[test]
    fn claim_and_release() {
        let pool = SharedBlockPool::new();
        let guard = pool.claim(7, monitor()).unwrap();

        // Same slot cannot be claimed twice.
        assert!(pool.claim(7, monitor()).is_none());
        drop(guard);

        // Released on drop.
        assert!(pool.claim(7, monitor()).is_some());
    }

    #[test]
    fn colliding_tokens_fall_back() {
        let pool = SharedBlockPool::new();
        let first = pool.claim(3, monitor()).unwrap();

        // A different token hashing to the same slot loses the race.
        let colliding = 3 + SHARED_BLOCK_SLOTS as u64;
        assert!(pool.claim(colliding, monitor()).is_none());

        // Tokens hashing elsewhere are unaffected.
        assert!(pool.claim(4, monitor()).is_some());
        drop(first);
    }

    #[test]
    fn dropping_guard_returns_block_bytes() {
        use crate::memory::Source;

        let monitor = monitor();
        let pool = SharedBlockPool::new();
        let guard = pool.claim(9, Arc::clone(&monitor)).unwrap();

        guard.with(|slot| {
            let block = Block::new(4096, Source::Ram).unwrap();
            monitor.increase(Source::Ram, block.size());
            *slot = Some(block);
        });
        assert_eq!(monitor.ram_consumption(), 4096);

        drop(guard);
        assert_eq!(monitor.ram_consumption(), 0);
    }

    #[test]
    fn thread_tokens_are_stable_and_distinct() {
        let here = current_thread_token();
        assert_eq!(here, current_thread_token());

        let other = std::thread::spawn(current_thread_token).join().unwrap();
        assert_ne!(here, other);
    }
}
