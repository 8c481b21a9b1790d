//! # Indexes
//!
//! Three container strategies behind one [`Index`] trait:
//!
//! - [`Tree`]: ordered multiset, the only variant servicing range lookups;
//! - [`HashDuplicates`]: hash multiset grouping equal keys in one bucket;
//! - [`HashUnique`]: hash set rejecting duplicate keys.
//!
//! Entries are [`StorageSlot`]s, never pointers: an index references rows
//! inside the table's storage, it does not own them. Key bytes are read on
//! demand from the referenced row, so every operation takes an
//! [`IndexCtx`] carrying the column metadata, the storage and the element
//! mode: the context a comparator needs but a container key cannot carry.
//!
//! All three containers allocate through the engine [`Allocator`], so
//! index growth is subject to the same ceilings as row storage and
//! ceiling violations surface as typed errors, not aborts.

mod hash;
mod indexed_cells;
mod tree;

pub use hash::{HashDuplicates, HashUnique};
pub use indexed_cells::IndexedCells;
pub use tree::Tree;

use eyre::Result;
use smallvec::SmallVec;

use crate::allocator::Allocator;
use crate::row::{Cell, Columns, OwnedRow};
use crate::storage::{Storage, StorageSlot};

/// How storage elements encode their row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementMode {
    /// Elements are flat wire-row copies (all columns fixed-size).
    FlatWire,
    /// Elements hold an [`OwnedRow`] object.
    OwnedRows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAlgorithm {
    Tree,
    Hash,
}

/// Definition of one index: which columns participate, in key order.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub unique: bool,
    pub algorithm: IndexAlgorithm,
    pub columns: SmallVec<[usize; 4]>,
}

impl IndexDef {
    pub fn tree(unique: bool, columns: &[usize]) -> IndexDef {
        IndexDef {
            unique,
            algorithm: IndexAlgorithm::Tree,
            columns: SmallVec::from_slice(columns),
        }
    }

    pub fn hash(unique: bool, columns: &[usize]) -> IndexDef {
        IndexDef {
            unique,
            algorithm: IndexAlgorithm::Hash,
            columns: SmallVec::from_slice(columns),
        }
    }

    /// Builds the matching container variant.
    pub fn build(&self, alloc: Allocator) -> Box<dyn Index> {
        match (self.algorithm, self.unique) {
            (IndexAlgorithm::Tree, unique) => Box::new(Tree::new(alloc, unique)),
            (IndexAlgorithm::Hash, false) => Box::new(HashDuplicates::new(alloc)),
            (IndexAlgorithm::Hash, true) => Box::new(HashUnique::new(alloc)),
        }
    }
}

/// Read-only context every index operation runs under.
pub struct IndexCtx<'a> {
    pub columns: &'a Columns,
    pub storage: &'a Storage,
    pub mode: ElementMode,
    pub def: &'a IndexDef,
}

impl<'a> IndexCtx<'a> {
    /// Cell `column` of the row stored at `slot`.
    pub fn stored_cell(&self, slot: StorageSlot, column: usize) -> Cell<'a> {
        let element = self.storage.element(slot);
        match self.mode {
            ElementMode::FlatWire => self.columns.column(column).cell_in(element),
            ElementMode::OwnedRows => {
                // SAFETY: in OwnedRows mode every live element holds an
                // initialized OwnedRow, written by the table on insert and
                // destroyed by it before the slot is erased. The element
                // region is CHUNK_ALIGN aligned, matching OwnedRow.
                let row = unsafe { &*(element.as_ptr() as *const OwnedRow) };
                row.cell(column)
            }
        }
    }

    /// The n-th indexed cell (per `def.columns`) of the row at `slot`.
    pub fn stored_indexed_cell(&self, slot: StorageSlot, n: usize) -> Cell<'a> {
        self.stored_cell(slot, self.def.columns[n])
    }
}

/// Position of one entry inside an index, as returned by `insert` and
/// `lookup`. Only meaningful against the index and context that produced
/// it, and only until the next mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Offset into the tree's sorted entry sequence.
    Tree(usize),
    /// A hash entry: full key hash, the row the cursor rests on, and the
    /// ordinal among that key's duplicates.
    Hash {
        hash: u64,
        slot: StorageSlot,
        dup: usize,
    },
}

/// Outcome of [`Index::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// At least one equal key; `[first, after_last)` spans the matches.
    Found { first: Cursor, after_last: Cursor },
    /// No equal key, but the cursor rests on the next greater one. Only
    /// the ordered variant produces this.
    NotFoundPositionedOnNext { next: Cursor },
    /// No equal key and no defined position.
    NotFoundUndefined,
}

/// The capability set shared by the three index variants.
pub trait Index {
    /// Adds the row at `slot`. Unique variants fail with `DuplicateKey`
    /// when an equal key exists; allocation failures carry the usual
    /// ceiling taxonomy. On success the returned cursor rests on the new
    /// entry.
    fn insert(&mut self, ctx: &IndexCtx<'_>, slot: StorageSlot) -> Result<Cursor>;

    fn lookup<'t>(&self, ctx: &IndexCtx<'t>, key: &IndexedCells<'t>) -> Lookup;

    /// Removes the entry referencing `slot`. Returns whether one existed.
    fn erase(&mut self, ctx: &IndexCtx<'_>, slot: StorageSlot) -> bool;

    fn truncate(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row under `cursor`, or `None` when it sits past its range.
    fn slot_at(&self, ctx: &IndexCtx<'_>, cursor: Cursor) -> Option<StorageSlot>;

    /// Cursor one entry forward.
    fn advance(&self, ctx: &IndexCtx<'_>, cursor: Cursor) -> Cursor;
}
