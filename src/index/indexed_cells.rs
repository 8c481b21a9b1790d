//! The key representation indexes compare and hash: one or more cells,
//! sourced from a decoded probe, a wire row, or a stored row.

use std::cmp::Ordering;
use std::hash::{BuildHasher, Hash, Hasher};

use smallvec::SmallVec;

use crate::index::IndexCtx;
use crate::row::Cell;
use crate::storage::StorageSlot;

enum KeySource<'a> {
    /// Decoded probe cells, e.g. from an execution-layer search key.
    Cells(SmallVec<[Cell<'a>; 4]>),
    /// The indexed columns of a caller-owned wire row.
    WireRow(&'a [u8]),
    /// The indexed columns of a storage-resident row.
    Stored(StorageSlot),
}

/// An index key view over `count` cells. The count is reducible at
/// construction and never grows, which is what enables prefix probes.
pub struct IndexedCells<'a> {
    source: KeySource<'a>,
    count: usize,
}

impl<'a> IndexedCells<'a> {
    /// Probe key from decoded cells; may cover a prefix of the index.
    pub fn from_cells(cells: &[Cell<'a>]) -> IndexedCells<'a> {
        IndexedCells {
            count: cells.len(),
            source: KeySource::Cells(SmallVec::from_slice(cells)),
        }
    }

    /// Full key of a wire-format row.
    pub fn from_wire_row(ctx: &IndexCtx<'_>, wire: &'a [u8]) -> IndexedCells<'a> {
        IndexedCells {
            source: KeySource::WireRow(wire),
            count: ctx.def.columns.len(),
        }
    }

    /// Full key of the row stored at `slot`.
    pub fn from_stored(ctx: &IndexCtx<'_>, slot: StorageSlot) -> IndexedCells<'a> {
        IndexedCells {
            source: KeySource::Stored(slot),
            count: ctx.def.columns.len(),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Drops trailing cells from the key. Never grows it back.
    pub fn reduce_count(&mut self, count: usize) {
        debug_assert!(count <= self.count);
        self.count = count;
    }

    /// The n-th participating cell.
    pub fn cell(&self, n: usize, ctx: &IndexCtx<'a>) -> Cell<'a> {
        debug_assert!(n < self.count);
        match &self.source {
            KeySource::Cells(cells) => cells[n],
            KeySource::WireRow(wire) => ctx.columns.column(ctx.def.columns[n]).cell_in(wire),
            KeySource::Stored(slot) => ctx.stored_indexed_cell(*slot, n),
        }
    }

    /// Cell-by-cell comparison up to the shorter count; a prefix compares
    /// equal to any key it is a prefix of.
    pub fn compare(&self, other: &IndexedCells<'a>, ctx: &IndexCtx<'a>) -> Ordering {
        let common = self.count.min(other.count);
        for n in 0..common {
            let ord = self.cell(n, ctx).compare(&other.cell(n, ctx));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Key hash over all participating cells. Keys that compare equal at
    /// equal counts hash equally.
    pub fn hash_with<S: BuildHasher>(&self, ctx: &IndexCtx<'a>, build: &S) -> u64 {
        let mut hasher = build.build_hasher();
        for n in 0..self.count {
            let cell = self.cell(n, ctx);
            cell.is_null().hash(&mut hasher);
            if !cell.is_null() {
                cell.data().hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

impl std::fmt::Debug for IndexedCells<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            KeySource::Cells(_) => "cells",
            KeySource::WireRow(_) => "wire",
            KeySource::Stored(_) => "stored",
        };
        f.debug_struct("IndexedCells")
            .field("source", &source)
            .field("count", &self.count)
            .finish()
    }
}
