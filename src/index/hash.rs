//! Hash indexes. Both variants service equality lookups only: there is no
//! key order, so a miss is always `NotFoundUndefined` and prefix probes
//! are not supported (a reduced key hashes differently by construction).
//!
//! [`HashDuplicates`] groups all rows of one key in a single bucket, which
//! makes duplicate enumeration one find plus a linear walk.

use allocator_api2::vec::Vec as AVec;
use eyre::Result;
use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::HashTable;

use crate::allocator::Allocator;
use crate::index::{Cursor, Index, IndexCtx, IndexedCells, Lookup};
use crate::result::{engine_error, ErrorKind};
use crate::storage::StorageSlot;

/// All rows sharing one key. The duplicate list draws from the engine
/// allocator like every other index container, so its growth is visible
/// to the monitors.
struct Bucket {
    hash: u64,
    rows: AVec<StorageSlot, Allocator>,
}

fn key_matches<'t>(
    ctx: &IndexCtx<'t>,
    representative: StorageSlot,
    key: &IndexedCells<'t>,
) -> bool {
    IndexedCells::from_stored(ctx, representative).compare(key, ctx) == std::cmp::Ordering::Equal
}

/// Hash multiset index.
pub struct HashDuplicates {
    table: HashTable<Bucket, Allocator>,
    build: DefaultHashBuilder,
    len: usize,
}

impl HashDuplicates {
    pub fn new(alloc: Allocator) -> HashDuplicates {
        HashDuplicates {
            table: HashTable::new_in(alloc),
            build: DefaultHashBuilder::default(),
            len: 0,
        }
    }
}

impl Index for HashDuplicates {
    fn insert(&mut self, ctx: &IndexCtx<'_>, slot: StorageSlot) -> Result<Cursor> {
        let key = IndexedCells::from_stored(ctx, slot);
        let hash = key.hash_with(ctx, &self.build);

        if self.table.try_reserve(1, |b: &Bucket| b.hash).is_err() {
            return Err(self.table.allocator().take_alloc_error());
        }

        let alloc = self.table.allocator().clone();
        let cursor = match self
            .table
            .find_mut(hash, |b| b.hash == hash && key_matches(ctx, b.rows[0], &key))
        {
            Some(bucket) => {
                if bucket.rows.try_reserve(1).is_err() {
                    return Err(alloc.take_alloc_error());
                }
                let dup = bucket.rows.len();
                bucket.rows.push(slot);
                Cursor::Hash { hash, slot, dup }
            }
            None => {
                let mut rows = AVec::new_in(alloc.clone());
                if rows.try_reserve(1).is_err() {
                    return Err(alloc.take_alloc_error());
                }
                rows.push(slot);
                self.table.insert_unique(hash, Bucket { hash, rows }, |b| b.hash);
                Cursor::Hash { hash, slot, dup: 0 }
            }
        };
        self.len += 1;
        Ok(cursor)
    }

    fn lookup<'t>(&self, ctx: &IndexCtx<'t>, key: &IndexedCells<'t>) -> Lookup {
        let hash = key.hash_with(ctx, &self.build);
        match self
            .table
            .find(hash, |b| b.hash == hash && key_matches(ctx, b.rows[0], key))
        {
            Some(bucket) => Lookup::Found {
                first: Cursor::Hash {
                    hash,
                    slot: bucket.rows[0],
                    dup: 0,
                },
                after_last: Cursor::Hash {
                    hash,
                    slot: bucket.rows[0],
                    dup: bucket.rows.len(),
                },
            },
            None => Lookup::NotFoundUndefined,
        }
    }

    fn erase(&mut self, ctx: &IndexCtx<'_>, slot: StorageSlot) -> bool {
        let key = IndexedCells::from_stored(ctx, slot);
        let hash = key.hash_with(ctx, &self.build);

        match self
            .table
            .find_entry(hash, |b| b.hash == hash && key_matches(ctx, b.rows[0], &key))
        {
            Ok(mut entry) => {
                let bucket = entry.get_mut();
                let Some(pos) = bucket.rows.iter().position(|&s| s == slot) else {
                    return false;
                };
                bucket.rows.remove(pos);
                if bucket.rows.is_empty() {
                    entry.remove();
                }
                self.len -= 1;
                true
            }
            Err(_) => false,
        }
    }

    fn truncate(&mut self) {
        let alloc = self.table.allocator().clone();
        self.table = HashTable::new_in(alloc);
        self.len = 0;
    }

    fn len(&self) -> usize {
        self.len
    }

    fn slot_at(&self, ctx: &IndexCtx<'_>, cursor: Cursor) -> Option<StorageSlot> {
        let Cursor::Hash { hash, slot, dup } = cursor else {
            debug_assert!(false, "tree cursor on a hash index");
            return None;
        };
        let key = IndexedCells::from_stored(ctx, slot);
        let bucket = self
            .table
            .find(hash, |b| b.hash == hash && key_matches(ctx, b.rows[0], &key))?;
        bucket.rows.get(dup).copied()
    }

    fn advance(&self, ctx: &IndexCtx<'_>, cursor: Cursor) -> Cursor {
        let Cursor::Hash { hash, slot, dup } = cursor else {
            debug_assert!(false, "tree cursor on a hash index");
            return cursor;
        };
        let key = IndexedCells::from_stored(ctx, slot);
        let next = dup + 1;
        match self
            .table
            .find(hash, |b| b.hash == hash && key_matches(ctx, b.rows[0], &key))
        {
            // Past the last duplicate the cursor rests back on the
            // representative, matching the `after_last` bound of `lookup`.
            Some(bucket) => Cursor::Hash {
                hash,
                slot: bucket.rows.get(next).copied().unwrap_or(bucket.rows[0]),
                dup: next,
            },
            None => Cursor::Hash {
                hash,
                slot,
                dup: next,
            },
        }
    }
}

/// One row per key.
struct Entry {
    hash: u64,
    slot: StorageSlot,
}

/// Hash set index rejecting duplicate keys.
pub struct HashUnique {
    table: HashTable<Entry, Allocator>,
    build: DefaultHashBuilder,
}

impl HashUnique {
    pub fn new(alloc: Allocator) -> HashUnique {
        HashUnique {
            table: HashTable::new_in(alloc),
            build: DefaultHashBuilder::default(),
        }
    }
}

impl Index for HashUnique {
    fn insert(&mut self, ctx: &IndexCtx<'_>, slot: StorageSlot) -> Result<Cursor> {
        let key = IndexedCells::from_stored(ctx, slot);
        let hash = key.hash_with(ctx, &self.build);

        let occupied = self
            .table
            .find(hash, |e| e.hash == hash && key_matches(ctx, e.slot, &key))
            .is_some();
        if occupied {
            return Err(engine_error(
                ErrorKind::DuplicateKey,
                "equal key already present in a unique hash index",
            ));
        }

        if self.table.try_reserve(1, |e: &Entry| e.hash).is_err() {
            return Err(self.table.allocator().take_alloc_error());
        }
        self.table.insert_unique(hash, Entry { hash, slot }, |e| e.hash);
        Ok(Cursor::Hash { hash, slot, dup: 0 })
    }

    fn lookup<'t>(&self, ctx: &IndexCtx<'t>, key: &IndexedCells<'t>) -> Lookup {
        let hash = key.hash_with(ctx, &self.build);
        match self
            .table
            .find(hash, |e| e.hash == hash && key_matches(ctx, e.slot, key))
        {
            Some(entry) => Lookup::Found {
                first: Cursor::Hash {
                    hash,
                    slot: entry.slot,
                    dup: 0,
                },
                after_last: Cursor::Hash {
                    hash,
                    slot: entry.slot,
                    dup: 1,
                },
            },
            None => Lookup::NotFoundUndefined,
        }
    }

    fn erase(&mut self, ctx: &IndexCtx<'_>, slot: StorageSlot) -> bool {
        let key = IndexedCells::from_stored(ctx, slot);
        let hash = key.hash_with(ctx, &self.build);
        match self
            .table
            .find_entry(hash, |e| e.hash == hash && e.slot == slot && key_matches(ctx, e.slot, &key))
        {
            Ok(entry) => {
                entry.remove();
                true
            }
            Err(_) => false,
        }
    }

    fn truncate(&mut self) {
        let alloc = self.table.allocator().clone();
        self.table = HashTable::new_in(alloc);
    }

    fn len(&self) -> usize {
        self.table.len()
    }

    fn slot_at(&self, ctx: &IndexCtx<'_>, cursor: Cursor) -> Option<StorageSlot> {
        let Cursor::Hash { hash, slot, dup } = cursor else {
            debug_assert!(false, "tree cursor on a hash index");
            return None;
        };
        if dup != 0 {
            return None;
        }
        let key = IndexedCells::from_stored(ctx, slot);
        self.table
            .find(hash, |e| e.hash == hash && key_matches(ctx, e.slot, &key))
            .map(|e| e.slot)
    }

    fn advance(&self, _ctx: &IndexCtx<'_>, cursor: Cursor) -> Cursor {
        let Cursor::Hash { hash, slot, dup } = cursor else {
            debug_assert!(false, "tree cursor on a hash index");
            return cursor;
        };
        Cursor::Hash {
            hash,
            slot,
            dup: dup + 1,
        }
    }
}
