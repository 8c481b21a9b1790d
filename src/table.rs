//! # Table
//!
//! Composes storage, column metadata and the index set into one temporary
//! table. A table owns its allocator, so every byte it holds (pages,
//! owned rows, index containers) is charged to its resource monitor and
//! released together at drop.
//!
//! ## Element modes
//!
//! When every column is fixed-size, storage elements are flat wire-row
//! copies and all cell reads decode the wire image in place. With any
//! variable-size column, each element instead holds an [`OwnedRow`]
//! object; the table is then responsible for constructing it on insert
//! and dropping it before the slot is vacated.
//!
//! ## Atomicity
//!
//! Every mutating operation is all-or-nothing: the first index or
//! allocation failure triggers a reverse-order undo of the partial work,
//! and the original error is propagated unchanged. A failed call leaves
//! the table byte-identical to its state before the call.

use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::Arc;

use eyre::Result;
use smallvec::SmallVec;
use tracing::trace;

use crate::allocator::{Allocator, SharedBlock};
use crate::index::{Cursor, ElementMode, Index, IndexCtx, IndexDef, IndexedCells, Lookup};
use crate::memory::{MemoryMonitor, TableResourceMonitor};
use crate::result::{engine_error, ErrorKind};
use crate::row::{Columns, FieldDef, OwnedRow};
use crate::storage::{Storage, StorageSlot};

pub struct Table {
    columns: Columns,
    mode: ElementMode,
    alloc: Allocator,
    storage: Storage,
    indexes: Vec<(IndexDef, Box<dyn Index>)>,
    indexes_enabled: bool,
    table_monitor: Arc<TableResourceMonitor>,
}

impl Table {
    pub fn new(
        fields: &[FieldDef],
        index_defs: &[IndexDef],
        mem_monitor: Arc<MemoryMonitor>,
        shared_block: Option<Rc<SharedBlock>>,
        per_table_limit: usize,
    ) -> Result<Table> {
        let columns = Columns::from_defs(fields)?;
        for def in index_defs {
            if def.columns.iter().any(|&c| c >= columns.len()) {
                return Err(engine_error(
                    ErrorKind::WrongIndex,
                    "index definition references a column out of range",
                ));
            }
        }

        let table_monitor = Arc::new(TableResourceMonitor::new(per_table_limit));
        let alloc = Allocator::new(mem_monitor, Arc::clone(&table_monitor), shared_block);

        let mode = if columns.all_fixed() {
            ElementMode::FlatWire
        } else {
            ElementMode::OwnedRows
        };
        let element_bytes = match mode {
            ElementMode::FlatWire => columns.wire_row_len().max(1),
            ElementMode::OwnedRows => std::mem::size_of::<OwnedRow>(),
        };
        let storage = Storage::new(alloc.clone(), element_bytes);
        let indexes = index_defs
            .iter()
            .map(|def| (def.clone(), def.build(alloc.clone())))
            .collect();

        Ok(Table {
            columns,
            mode,
            alloc,
            storage,
            indexes,
            indexes_enabled: true,
            table_monitor,
        })
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn indexes_enabled(&self) -> bool {
        self.indexes_enabled
    }

    pub fn monitor(&self) -> &TableResourceMonitor {
        &self.table_monitor
    }

    /// Appends `wire_row`, maintaining every enabled index. On failure the
    /// table is left exactly as before the call.
    pub fn insert(&mut self, wire_row: &[u8]) -> Result<()> {
        debug_assert_eq!(wire_row.len(), self.columns.wire_row_len());

        let slot = self.storage.allocate_back()?;
        match self.mode {
            ElementMode::FlatWire => {
                self.storage.element_mut(slot).copy_from_slice(wire_row);
            }
            ElementMode::OwnedRows => {
                let owned = match OwnedRow::from_wire_row(&self.alloc, &self.columns, wire_row) {
                    Ok(owned) => owned,
                    Err(e) => {
                        self.storage.deallocate_back();
                        return Err(e);
                    }
                };
                // SAFETY: in OwnedRows mode elements are sized and aligned
                // for OwnedRow and this slot is freshly allocated.
                unsafe {
                    (self.storage.element_mut(slot).as_mut_ptr() as *mut OwnedRow).write(owned);
                }
            }
        }

        if self.indexes_enabled {
            let columns = &self.columns;
            let storage = &self.storage;
            let mode = self.mode;
            let mut done = 0;
            let mut failure = None;
            for (def, index) in self.indexes.iter_mut() {
                let ctx = IndexCtx {
                    columns,
                    storage,
                    mode,
                    def,
                };
                match index.insert(&ctx, slot) {
                    Ok(_) => done += 1,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failure {
                // Reverse-order undo of the partial index work, then the
                // storage append itself.
                for (def, index) in self.indexes[..done].iter_mut().rev() {
                    let ctx = IndexCtx {
                        columns,
                        storage,
                        mode,
                        def,
                    };
                    let erased = index.erase(&ctx, slot);
                    debug_assert!(erased);
                }
                self.destroy_element(slot);
                self.storage.deallocate_back();
                return Err(e);
            }
        }

        trace!(?slot, "row inserted");
        Ok(())
    }

    /// Replaces the row at `target` (whose current content is `old_wire`)
    /// with `new_wire`. Only indexes whose indexed cells actually changed
    /// are touched. Atomic like `insert`.
    pub fn update(&mut self, old_wire: &[u8], new_wire: &[u8], target: StorageSlot) -> Result<()> {
        debug_assert_eq!(new_wire.len(), self.columns.wire_row_len());
        #[cfg(debug_assertions)]
        debug_assert!(self.stored_row_equals(target, old_wire));

        let changed: SmallVec<[usize; 4]> = if self.indexes_enabled {
            let columns = &self.columns;
            let storage = &self.storage;
            let mode = self.mode;
            self.indexes
                .iter()
                .enumerate()
                .filter(|(_, (def, _))| {
                    let ctx = IndexCtx {
                        columns,
                        storage,
                        mode,
                        def,
                    };
                    let old_key = IndexedCells::from_wire_row(&ctx, old_wire);
                    let new_key = IndexedCells::from_wire_row(&ctx, new_wire);
                    old_key.compare(&new_key, &ctx) != Ordering::Equal
                })
                .map(|(i, _)| i)
                .collect()
        } else {
            SmallVec::new()
        };

        // Stale entries go first, keyed off the old content still in place.
        self.erase_entries(&changed, target);

        enum OldContent {
            Flat(Vec<u8>),
            Owned(OwnedRow),
        }
        let old_content = match self.mode {
            ElementMode::FlatWire => {
                let element = self.storage.element_mut(target);
                let saved = element.to_vec();
                element.copy_from_slice(new_wire);
                OldContent::Flat(saved)
            }
            ElementMode::OwnedRows => {
                let new_row = match OwnedRow::from_wire_row(&self.alloc, &self.columns, new_wire) {
                    Ok(row) => row,
                    Err(e) => {
                        // Content untouched: the stale entries go straight
                        // back in.
                        self.restore_entries(&changed, target);
                        return Err(e);
                    }
                };
                // SAFETY: the element holds an initialized OwnedRow, read
                // out here and replaced in the same breath.
                unsafe {
                    let ptr = self.storage.element_mut(target).as_mut_ptr() as *mut OwnedRow;
                    let old = ptr.read();
                    ptr.write(new_row);
                    OldContent::Owned(old)
                }
            }
        };

        let columns = &self.columns;
        let storage = &self.storage;
        let mode = self.mode;
        let mut done = 0;
        let mut failure = None;
        for &i in &changed {
            let (def, index) = &mut self.indexes[i];
            let ctx = IndexCtx {
                columns,
                storage,
                mode,
                def,
            };
            match index.insert(&ctx, target) {
                Ok(_) => done += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            self.erase_entries(&changed[..done], target);
            match old_content {
                OldContent::Flat(saved) => {
                    self.storage.element_mut(target).copy_from_slice(&saved);
                }
                OldContent::Owned(old) => {
                    // SAFETY: as above; the new row is dropped, the old one
                    // moves back in.
                    unsafe {
                        let ptr = self.storage.element_mut(target).as_mut_ptr() as *mut OwnedRow;
                        drop(ptr.read());
                        ptr.write(old);
                    }
                }
            }
            self.restore_entries(&changed, target);
            return Err(e);
        }

        trace!(?target, changed = changed.len(), "row updated");
        Ok(())
    }

    /// Removes the row at `victim`. `expected_wire` is the caller's view
    /// of its content, checked against storage in debug builds.
    pub fn remove(&mut self, expected_wire: &[u8], victim: StorageSlot) -> Result<()> {
        #[cfg(debug_assertions)]
        debug_assert!(self.stored_row_equals(victim, expected_wire));
        let _ = expected_wire;

        if self.indexes_enabled {
            let all: SmallVec<[usize; 4]> = (0..self.indexes.len()).collect();
            self.erase_entries(&all, victim);
        }
        self.destroy_element(victim);
        self.storage.erase(victim);

        trace!(?victim, "row removed");
        Ok(())
    }

    /// Clears all rows and all index entries.
    pub fn truncate(&mut self) {
        for (_, index) in self.indexes.iter_mut() {
            index.truncate();
        }
        self.clear_rows();
        trace!("table truncated");
    }

    /// Suspends index maintenance for bulk loading.
    pub fn disable_indexes(&mut self) {
        self.indexes_enabled = false;
    }

    /// Resumes index maintenance. Rebuilding entries for already-present
    /// rows is not supported, so a populated table fails with
    /// `WrongCommand`; truncate the table first.
    pub fn enable_indexes(&mut self) -> Result<()> {
        if !self.indexes_enabled && !self.storage.is_empty() {
            return Err(engine_error(
                ErrorKind::WrongCommand,
                "cannot enable indexes on a non-empty table",
            ));
        }
        self.indexes_enabled = true;
        Ok(())
    }

    /// Exports the row at `slot` as a wire image into `out`.
    pub fn row(&self, slot: StorageSlot, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.columns.wire_row_len());
        match self.mode {
            ElementMode::FlatWire => out.copy_from_slice(self.storage.element(slot)),
            ElementMode::OwnedRows => self.owned_row(slot).copy_to_wire_row(&self.columns, out),
        }
    }

    /// Point or range probe against index `index_no`.
    pub fn index_lookup<'t>(&'t self, index_no: usize, key: &IndexedCells<'t>) -> Result<Lookup> {
        let (def, index) = self
            .indexes
            .get(index_no)
            .ok_or_else(|| engine_error(ErrorKind::WrongIndex, "no such index"))?;
        let ctx = IndexCtx {
            columns: &self.columns,
            storage: &self.storage,
            mode: self.mode,
            def,
        };
        Ok(index.lookup(&ctx, key))
    }

    /// Row under an index cursor, if it rests on one.
    pub fn cursor_slot(&self, index_no: usize, cursor: Cursor) -> Result<Option<StorageSlot>> {
        let (def, index) = self
            .indexes
            .get(index_no)
            .ok_or_else(|| engine_error(ErrorKind::WrongIndex, "no such index"))?;
        let ctx = IndexCtx {
            columns: &self.columns,
            storage: &self.storage,
            mode: self.mode,
            def,
        };
        Ok(index.slot_at(&ctx, cursor))
    }

    pub fn advance_cursor(&self, index_no: usize, cursor: Cursor) -> Result<Cursor> {
        let (def, index) = self
            .indexes
            .get(index_no)
            .ok_or_else(|| engine_error(ErrorKind::WrongIndex, "no such index"))?;
        let ctx = IndexCtx {
            columns: &self.columns,
            storage: &self.storage,
            mode: self.mode,
            def,
        };
        Ok(index.advance(&ctx, cursor))
    }

    /// Forward iteration over live row slots.
    pub fn slots(&self) -> crate::storage::Iter<'_> {
        self.storage.iter()
    }

    pub fn first_slot(&self) -> Option<StorageSlot> {
        self.storage.first()
    }

    pub fn next_slot(&self, slot: StorageSlot) -> Option<StorageSlot> {
        self.storage.next(slot)
    }

    pub fn last_slot(&self) -> Option<StorageSlot> {
        self.storage.last()
    }

    pub fn prev_slot(&self, slot: StorageSlot) -> Option<StorageSlot> {
        self.storage.prev(slot)
    }

    pub fn index_len(&self, index_no: usize) -> Result<usize> {
        self.indexes
            .get(index_no)
            .map(|(_, index)| index.len())
            .ok_or_else(|| engine_error(ErrorKind::WrongIndex, "no such index"))
    }

    fn owned_row(&self, slot: StorageSlot) -> &OwnedRow {
        debug_assert_eq!(self.mode, ElementMode::OwnedRows);
        // SAFETY: live elements in OwnedRows mode always hold an
        // initialized OwnedRow.
        unsafe { &*(self.storage.element(slot).as_ptr() as *const OwnedRow) }
    }

    /// Drops the OwnedRow in `slot` before the slot is vacated. No-op in
    /// flat mode.
    fn destroy_element(&mut self, slot: StorageSlot) {
        if self.mode == ElementMode::OwnedRows {
            // SAFETY: the element holds an initialized OwnedRow and the
            // slot is vacated right after, so it is dropped exactly once.
            unsafe {
                (self.storage.element_mut(slot).as_mut_ptr() as *mut OwnedRow).drop_in_place();
            }
        }
    }

    fn erase_entries(&mut self, which: &[usize], slot: StorageSlot) {
        let columns = &self.columns;
        let storage = &self.storage;
        let mode = self.mode;
        for &i in which.iter().rev() {
            let (def, index) = &mut self.indexes[i];
            let ctx = IndexCtx {
                columns,
                storage,
                mode,
                def,
            };
            let erased = index.erase(&ctx, slot);
            debug_assert!(erased, "index entry missing for a stored row");
        }
    }

    /// Rollback path: puts entries erased by `erase_entries` back. Cannot
    /// fail in practice since the erase just freed the capacity.
    fn restore_entries(&mut self, which: &[usize], slot: StorageSlot) {
        let columns = &self.columns;
        let storage = &self.storage;
        let mode = self.mode;
        for &i in which {
            let (def, index) = &mut self.indexes[i];
            let ctx = IndexCtx {
                columns,
                storage,
                mode,
                def,
            };
            let restored = index.insert(&ctx, slot);
            debug_assert!(restored.is_ok(), "rollback re-insert failed");
        }
    }

    fn clear_rows(&mut self) {
        if self.mode == ElementMode::OwnedRows {
            let slots: Vec<StorageSlot> = self.storage.iter().collect();
            for slot in slots {
                self.destroy_element(slot);
            }
        }
        self.storage.truncate();
    }

    #[cfg(debug_assertions)]
    fn stored_row_equals(&self, slot: StorageSlot, wire: &[u8]) -> bool {
        (0..self.columns.len()).all(|i| {
            let stored = match self.mode {
                ElementMode::FlatWire => self.columns.column(i).cell_in(self.storage.element(slot)),
                ElementMode::OwnedRows => self.owned_row(slot).cell(i),
            };
            stored.compare(&self.columns.column(i).cell_in(wire)) == Ordering::Equal
        })
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // Owned rows release their chunks before storage and indexes go.
        self.clear_rows();
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("columns", &self.columns.len())
            .field("mode", &self.mode)
            .field("rows", &self.storage.len())
            .field("indexes", &self.indexes.len())
            .field("indexes_enabled", &self.indexes_enabled)
            .finish()
    }
}
