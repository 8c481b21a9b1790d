//! # Block and Chunk
//!
//! A [`Block`] is one contiguous arena, sized once at creation and carved
//! front-to-back into chunks. Blocks come from two sources:
//!
//! - [`Source::Ram`]: a plain heap allocation.
//! - [`Source::MmapFile`]: a memory-mapped, unlinked temporary file, the
//!   "record file" the engine spills into once the RAM ceiling is reached.
//!   The file never survives the mapping; nothing here is durable.
//!
//! ## Chunk Layout
//!
//! Every chunk begins with an aligned header slot whose leading machine
//! word holds the chunk's byte offset from the block base, followed by the
//! caller-visible data region:
//!
//! ```text
//! block base
//! │
//! ├── chunk 0: [offset word = 0      ][data ...][pad]
//! ├── chunk 1: [offset word = 24     ][data ...][pad]
//! │            ...
//! └── cursor (next free byte)
//! ```
//!
//! The stored offset lets [`Chunk::owning_block_addr`] recover the owning
//! block from a bare data pointer in O(1), which is what allows the
//! allocator to route `deallocate` calls without a side table.
//!
//! A `Block` is a dumb arena: it hands out chunks and remembers the cursor,
//! but live-chunk accounting belongs to the owning allocator. Dropping a
//! `Block` releases the OS resource; the owner must only do so once its
//! chunk count reaches zero.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use eyre::Result;
use memmap2::MmapMut;
use tracing::debug;

use crate::config::{CHUNK_ALIGN, CHUNK_HEADER_BYTES};
use crate::result::{engine_error, ErrorKind};

/// Where a block's memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Ram,
    MmapFile,
}

/// Gross bytes a chunk of `n_bytes` user data occupies inside a block:
/// header slot plus data, padded to [`CHUNK_ALIGN`].
pub fn chunk_footprint(n_bytes: usize) -> usize {
    (CHUNK_HEADER_BYTES + n_bytes).next_multiple_of(CHUNK_ALIGN)
}

enum Buf {
    Ram { ptr: NonNull<u8>, layout: Layout },
    Mmap { map: MmapMut },
}

/// One contiguous memory arena.
pub struct Block {
    buf: Buf,
    size: usize,
    cursor: usize,
}

impl Block {
    /// Requests `size` bytes from the given source. Underlying allocation
    /// failure surfaces as `OutOfMemory`.
    pub fn new(size: usize, source: Source) -> Result<Block> {
        debug_assert!(size > 0, "blocks are never zero-sized");

        let buf = match source {
            Source::Ram => {
                let layout = Layout::from_size_align(size, CHUNK_ALIGN).map_err(|e| {
                    engine_error(ErrorKind::OutOfMemory, format!("bad block layout: {e}"))
                })?;
                // SAFETY: `layout` has non-zero size (asserted above) and a
                // valid power-of-two alignment, which is all `alloc` requires.
                let raw = unsafe { alloc(layout) };
                let ptr = NonNull::new(raw).ok_or_else(|| {
                    engine_error(
                        ErrorKind::OutOfMemory,
                        format!("heap allocation of {size} bytes failed"),
                    )
                })?;
                Buf::Ram { ptr, layout }
            }
            Source::MmapFile => {
                let file = tempfile::tempfile().map_err(|e| {
                    engine_error(ErrorKind::OutOfMemory, format!("record file creation: {e}"))
                })?;
                file.set_len(size as u64).map_err(|e| {
                    engine_error(
                        ErrorKind::OutOfMemory,
                        format!("record file resize to {size} bytes: {e}"),
                    )
                })?;
                // SAFETY: the file was created by us, is unlinked, and is
                // never touched by another process; the mapping's lifetime is
                // tied to this Block, so the pages stay valid for as long as
                // any chunk pointer into them exists.
                let map = unsafe {
                    MmapMut::map_mut(&file).map_err(|e| {
                        engine_error(ErrorKind::OutOfMemory, format!("record file mmap: {e}"))
                    })?
                };
                Buf::Mmap { map }
            }
        };

        debug!(size, ?source, "block created");

        Ok(Block {
            buf,
            size,
            cursor: 0,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn source(&self) -> Source {
        match self.buf {
            Buf::Ram { .. } => Source::Ram,
            Buf::Mmap { .. } => Source::MmapFile,
        }
    }

    pub fn base_addr(&self) -> usize {
        self.base().as_ptr() as usize
    }

    /// True if no chunk has been carved yet.
    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Pure capacity check against the remaining free region.
    pub fn can_accommodate(&self, n_bytes: usize) -> bool {
        chunk_footprint(n_bytes) <= self.size - self.cursor
    }

    /// Carves the next chunk of `n_bytes` user data. The caller must have
    /// verified [`Self::can_accommodate`] first.
    pub fn allocate(&mut self, n_bytes: usize) -> NonNull<u8> {
        debug_assert!(
            self.can_accommodate(n_bytes),
            "allocate called without a capacity check"
        );

        let offset = self.cursor;
        let base = self.base();

        // SAFETY: `offset + CHUNK_HEADER_BYTES + n_bytes <= size` per the
        // capacity check, so both the header word and the data region lie
        // inside this block's arena. The base is CHUNK_ALIGN-aligned (heap
        // layout / page-aligned mmap) and the cursor only advances in
        // multiples of CHUNK_ALIGN, so the header word write is aligned.
        let data = unsafe {
            let header = base.as_ptr().add(offset);
            (header as *mut usize).write(offset);
            NonNull::new_unchecked(header.add(CHUNK_HEADER_BYTES))
        };

        self.cursor += chunk_footprint(n_bytes);
        data
    }

    fn base(&self) -> NonNull<u8> {
        match &self.buf {
            Buf::Ram { ptr, .. } => *ptr,
            // SAFETY: a mapping's pointer is never null.
            Buf::Mmap { map } => unsafe { NonNull::new_unchecked(map.as_ptr() as *mut u8) },
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        debug!(size = self.size, source = ?self.source(), "block destroyed");
        if let Buf::Ram { ptr, layout } = &self.buf {
            // SAFETY: `ptr` was returned by `alloc` with exactly this layout
            // and is freed exactly once (Block is not Clone).
            unsafe { dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("source", &self.source())
            .field("size", &self.size)
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// A sub-allocation inside a block, addressed by its data pointer.
#[derive(Debug, Clone, Copy)]
pub struct Chunk {
    data: NonNull<u8>,
}

impl Chunk {
    /// Reconstitutes a chunk from a pointer previously returned by
    /// [`Block::allocate`].
    ///
    /// # Safety
    ///
    /// `data` must point at the data region of a chunk whose owning block
    /// is still alive.
    pub unsafe fn from_data_ptr(data: NonNull<u8>) -> Chunk {
        Chunk { data }
    }

    pub fn data(&self) -> NonNull<u8> {
        self.data
    }

    /// Base address of the owning block, recovered in O(1) from the offset
    /// word stored ahead of the data region.
    pub fn owning_block_addr(&self) -> usize {
        // SAFETY: per the `from_data_ptr` contract the header word sits
        // CHUNK_HEADER_BYTES before the data pointer, inside a live block,
        // and was written aligned by `Block::allocate`.
        let offset = unsafe {
            let header = self.data.as_ptr().sub(CHUNK_HEADER_BYTES);
            (header as *const usize).read()
        };
        self.data.as_ptr() as usize - CHUNK_HEADER_BYTES - offset
    }
}
