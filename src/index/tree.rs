//! Ordered index: a key-sorted entry sequence with binary-search bounds.
//! The representation keeps entries in an allocator-backed vector so the
//! comparator can consult column metadata on every probe, a requirement
//! no self-contained ordered key type could satisfy.

use std::cmp::Ordering;

use allocator_api2::vec::Vec as AVec;
use eyre::Result;

use crate::allocator::Allocator;
use crate::index::{Cursor, Index, IndexCtx, IndexedCells, Lookup};
use crate::result::{engine_error, ErrorKind};
use crate::storage::StorageSlot;

/// Ordered multiset index; the only variant servicing range lookups.
pub struct Tree {
    unique: bool,
    entries: AVec<StorageSlot, Allocator>,
}

impl Tree {
    pub fn new(alloc: Allocator, unique: bool) -> Tree {
        Tree {
            unique,
            entries: AVec::new_in(alloc),
        }
    }

    /// First position whose key is not less than `key`.
    fn lower_bound<'t>(&self, ctx: &IndexCtx<'t>, key: &IndexedCells<'t>) -> usize {
        self.entries.partition_point(|&slot| {
            IndexedCells::from_stored(ctx, slot).compare(key, ctx) == Ordering::Less
        })
    }

    /// First position whose key is greater than `key`.
    fn upper_bound<'t>(&self, ctx: &IndexCtx<'t>, key: &IndexedCells<'t>) -> usize {
        self.entries.partition_point(|&slot| {
            IndexedCells::from_stored(ctx, slot).compare(key, ctx) != Ordering::Greater
        })
    }
}

impl Index for Tree {
    fn insert(&mut self, ctx: &IndexCtx<'_>, slot: StorageSlot) -> Result<Cursor> {
        let key = IndexedCells::from_stored(ctx, slot);

        let pos = if self.unique {
            let pos = self.lower_bound(ctx, &key);
            let collides = pos < self.entries.len()
                && IndexedCells::from_stored(ctx, self.entries[pos]).compare(&key, ctx)
                    == Ordering::Equal;
            if collides {
                return Err(engine_error(
                    ErrorKind::DuplicateKey,
                    "equal key already present in a unique ordered index",
                ));
            }
            pos
        } else {
            // Duplicates go after their equals, keeping insertion order.
            self.upper_bound(ctx, &key)
        };

        if self.entries.try_reserve(1).is_err() {
            return Err(self.entries.allocator().take_alloc_error());
        }
        self.entries.insert(pos, slot);
        Ok(Cursor::Tree(pos))
    }

    fn lookup<'t>(&self, ctx: &IndexCtx<'t>, key: &IndexedCells<'t>) -> Lookup {
        let first = self.lower_bound(ctx, key);
        if first == self.entries.len() {
            return Lookup::NotFoundUndefined;
        }
        let stored = IndexedCells::from_stored(ctx, self.entries[first]);
        if stored.compare(key, ctx) == Ordering::Greater {
            return Lookup::NotFoundPositionedOnNext {
                next: Cursor::Tree(first),
            };
        }
        let after_last = if self.unique {
            first + 1
        } else {
            self.upper_bound(ctx, key)
        };
        Lookup::Found {
            first: Cursor::Tree(first),
            after_last: Cursor::Tree(after_last),
        }
    }

    fn erase(&mut self, ctx: &IndexCtx<'_>, slot: StorageSlot) -> bool {
        let key = IndexedCells::from_stored(ctx, slot);
        let mut pos = self.lower_bound(ctx, &key);
        while pos < self.entries.len() {
            if IndexedCells::from_stored(ctx, self.entries[pos]).compare(&key, ctx)
                != Ordering::Equal
            {
                break;
            }
            if self.entries[pos] == slot {
                self.entries.remove(pos);
                return true;
            }
            pos += 1;
        }
        false
    }

    fn truncate(&mut self) {
        // Replacing the vector returns its chunk to the allocator.
        let alloc = self.entries.allocator().clone();
        self.entries = AVec::new_in(alloc);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn slot_at(&self, _ctx: &IndexCtx<'_>, cursor: Cursor) -> Option<StorageSlot> {
        match cursor {
            Cursor::Tree(pos) => self.entries.get(pos).copied(),
            Cursor::Hash { .. } => {
                debug_assert!(false, "hash cursor on an ordered index");
                None
            }
        }
    }

    fn advance(&self, _ctx: &IndexCtx<'_>, cursor: Cursor) -> Cursor {
        match cursor {
            Cursor::Tree(pos) => Cursor::Tree(pos + 1),
            Cursor::Hash { .. } => {
                debug_assert!(false, "hash cursor on an ordered index");
                cursor
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::index::{ElementMode, IndexDef};
    use crate::memory::{MemoryMonitor, TableResourceMonitor};
    use crate::row::{Cell, Columns, FieldDef};
    use crate::storage::Storage;

    struct Fixture {
        columns: Columns,
        storage: Storage,
        def: IndexDef,
        alloc: Allocator,
    }

    impl Fixture {
        fn new(def: IndexDef) -> Fixture {
            let mem = Arc::new(MemoryMonitor::with_thresholds(usize::MAX, 0, false));
            let table = Arc::new(TableResourceMonitor::new(usize::MAX));
            let alloc = Allocator::new(mem, table, None);
            // Big-endian values so bytewise cell order matches numeric order.
            let columns =
                Columns::from_defs(&[FieldDef::fixed(4), FieldDef::fixed(4)]).unwrap();
            let storage = Storage::new(alloc.clone(), columns.wire_row_len());
            Fixture {
                columns,
                storage,
                def,
                alloc,
            }
        }

        fn push(&mut self, a: u32, b: u32) -> crate::storage::StorageSlot {
            let slot = self.storage.allocate_back().unwrap();
            let element = self.storage.element_mut(slot);
            element[..4].copy_from_slice(&a.to_be_bytes());
            element[4..].copy_from_slice(&b.to_be_bytes());
            slot
        }

        fn ctx(&self) -> IndexCtx<'_> {
            IndexCtx {
                columns: &self.columns,
                storage: &self.storage,
                mode: ElementMode::FlatWire,
                def: &self.def,
            }
        }
    }

    #[test]
    fn entries_stay_key_sorted() {
        let mut fix = Fixture::new(IndexDef::tree(false, &[0]));
        let mut tree = Tree::new(fix.alloc.clone(), false);
        for a in [30u32, 10, 20, 10] {
            let slot = fix.push(a, 0);
            tree.insert(&fix.ctx(), slot).unwrap();
        }

        let ctx = fix.ctx();
        let keys: Vec<u32> = (0..tree.len())
            .map(|pos| {
                let slot = tree.slot_at(&ctx, Cursor::Tree(pos)).unwrap();
                u32::from_be_bytes(ctx.storage.element(slot)[..4].try_into().unwrap())
            })
            .collect();
        assert_eq!(keys, vec![10, 10, 20, 30]);
    }

    #[test]
    fn unique_tree_rejects_equal_keys() {
        let mut fix = Fixture::new(IndexDef::tree(true, &[0]));
        let mut tree = Tree::new(fix.alloc.clone(), true);

        let first = fix.push(7, 1);
        tree.insert(&fix.ctx(), first).unwrap();

        let dup = fix.push(7, 2);
        let err = tree.insert(&fix.ctx(), dup).unwrap_err();
        assert_eq!(
            crate::result::ErrorKind::of(&err),
            Some(ErrorKind::DuplicateKey)
        );
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn lookup_distinguishes_the_three_outcomes() {
        let mut fix = Fixture::new(IndexDef::tree(false, &[0]));
        let mut tree = Tree::new(fix.alloc.clone(), false);
        for a in [10u32, 20, 20, 30] {
            let slot = fix.push(a, 0);
            tree.insert(&fix.ctx(), slot).unwrap();
        }
        let ctx = fix.ctx();

        let probe = 20u32.to_be_bytes();
        let key = IndexedCells::from_cells(&[Cell::new(&probe)]);
        match tree.lookup(&ctx, &key) {
            Lookup::Found { first, after_last } => {
                assert_eq!(first, Cursor::Tree(1));
                assert_eq!(after_last, Cursor::Tree(3));
            }
            other => panic!("expected Found, got {other:?}"),
        }

        let probe = 25u32.to_be_bytes();
        let key = IndexedCells::from_cells(&[Cell::new(&probe)]);
        assert_eq!(
            tree.lookup(&ctx, &key),
            Lookup::NotFoundPositionedOnNext {
                next: Cursor::Tree(3)
            }
        );

        let probe = 99u32.to_be_bytes();
        let key = IndexedCells::from_cells(&[Cell::new(&probe)]);
        assert_eq!(tree.lookup(&ctx, &key), Lookup::NotFoundUndefined);
    }

    #[test]
    fn prefix_probe_matches_full_keys() {
        let mut fix = Fixture::new(IndexDef::tree(false, &[0, 1]));
        let mut tree = Tree::new(fix.alloc.clone(), false);
        for (a, b) in [(1u32, 1u32), (2, 1), (2, 2), (3, 1)] {
            let slot = fix.push(a, b);
            tree.insert(&fix.ctx(), slot).unwrap();
        }
        let ctx = fix.ctx();

        // One-cell probe against a two-cell index key: prefix equality.
        let probe = 2u32.to_be_bytes();
        let key = IndexedCells::from_cells(&[Cell::new(&probe)]);
        match tree.lookup(&ctx, &key) {
            Lookup::Found { first, after_last } => {
                assert_eq!(first, Cursor::Tree(1));
                assert_eq!(after_last, Cursor::Tree(3));
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn reduced_full_key_probes_like_a_prefix() {
        let mut fix = Fixture::new(IndexDef::tree(false, &[0, 1]));
        let mut tree = Tree::new(fix.alloc.clone(), false);
        for (a, b) in [(1u32, 1u32), (2, 1), (2, 2), (3, 1)] {
            let slot = fix.push(a, b);
            tree.insert(&fix.ctx(), slot).unwrap();
        }
        let ctx = fix.ctx();

        // The full two-cell key pins down one entry.
        let a = 2u32.to_be_bytes();
        let b = 1u32.to_be_bytes();
        let mut key = IndexedCells::from_cells(&[Cell::new(&a), Cell::new(&b)]);
        match tree.lookup(&ctx, &key) {
            Lookup::Found { first, after_last } => {
                assert_eq!(first, Cursor::Tree(1));
                assert_eq!(after_last, Cursor::Tree(2));
            }
            other => panic!("expected Found, got {other:?}"),
        }

        // The same key reduced to its first cell spans both rows under it.
        key.reduce_count(1);
        assert_eq!(key.count(), 1);
        match tree.lookup(&ctx, &key) {
            Lookup::Found { first, after_last } => {
                assert_eq!(first, Cursor::Tree(1));
                assert_eq!(after_last, Cursor::Tree(3));
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn erase_removes_exactly_the_given_row() {
        let mut fix = Fixture::new(IndexDef::tree(false, &[0]));
        let mut tree = Tree::new(fix.alloc.clone(), false);
        let a = fix.push(5, 1);
        let b = fix.push(5, 2);
        tree.insert(&fix.ctx(), a).unwrap();
        tree.insert(&fix.ctx(), b).unwrap();

        assert!(tree.erase(&fix.ctx(), a));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.slot_at(&fix.ctx(), Cursor::Tree(0)), Some(b));

        // Erasing the same row twice reports the miss.
        assert!(!tree.erase(&fix.ctx(), a));
    }
}
