//! # Session
//!
//! The thin adapter surface an execution layer binds to: named table
//! lifecycle plus scan and point-read helpers over wire rows. One session
//! per thread; constructing it claims a shared-block slot keyed by the
//! calling thread, so small tables created through it coalesce their
//! allocations. A lost claim (slot collision) silently degrades to
//! private blocks.
//!
//! Exhaustion outcomes (`EndOfFile`, `KeyNotFound`) use the same error
//! taxonomy as real failures; they are expected control flow, not faults.

use std::rc::Rc;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use tracing::debug;

use crate::allocator::{current_thread_token, SharedBlock, SharedBlockPool};
use crate::index::{IndexDef, IndexedCells, Lookup};
use crate::memory::MemoryMonitor;
use crate::result::{engine_error, ErrorKind};
use crate::row::FieldDef;
use crate::storage::StorageSlot;
use crate::table::Table;

/// Per-thread handle owning named temporary tables.
pub struct Session {
    mem_monitor: Arc<MemoryMonitor>,
    shared: Option<Rc<SharedBlock>>,
    tables: HashMap<String, Table>,
}

impl Session {
    /// Opens a session against the process-wide monitor and shared-block
    /// pool.
    pub fn new(mem_monitor: Arc<MemoryMonitor>, pool: &Arc<SharedBlockPool>) -> Session {
        let shared = pool
            .claim(current_thread_token(), Arc::clone(&mem_monitor))
            .map(Rc::new);
        if shared.is_none() {
            debug!("shared-block slot unavailable, session uses private blocks only");
        }
        Session {
            mem_monitor,
            shared,
            tables: HashMap::new(),
        }
    }

    pub fn create_table(
        &mut self,
        name: &str,
        fields: &[FieldDef],
        index_defs: &[IndexDef],
        per_table_limit: usize,
    ) -> Result<()> {
        if self.tables.contains_key(name) {
            return Err(engine_error(
                ErrorKind::TableExists,
                format!("table '{name}' already exists"),
            ));
        }
        let table = Table::new(
            fields,
            index_defs,
            Arc::clone(&self.mem_monitor),
            self.shared.clone(),
            per_table_limit,
        )?;
        self.tables.insert(name.to_owned(), table);
        debug!(name, "table created");
        Ok(())
    }

    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        if self.tables.remove(name).is_none() {
            return Err(engine_error(
                ErrorKind::NoSuchTable,
                format!("no table named '{name}'"),
            ));
        }
        debug!(name, "table dropped");
        Ok(())
    }

    pub fn open(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| engine_error(ErrorKind::NoSuchTable, format!("no table named '{name}'")))
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| engine_error(ErrorKind::NoSuchTable, format!("no table named '{name}'")))
    }

    /// Starts a full scan: exports the first row into `out` and returns
    /// its slot. `EndOfFile` on an empty table.
    pub fn scan_first(&self, name: &str, out: &mut [u8]) -> Result<StorageSlot> {
        let table = self.table(name)?;
        let slot = table
            .first_slot()
            .ok_or_else(|| engine_error(ErrorKind::EndOfFile, "table is empty"))?;
        table.row(slot, out);
        Ok(slot)
    }

    /// Continues a full scan past `slot`. `EndOfFile` at exhaustion.
    pub fn scan_next(&self, name: &str, slot: StorageSlot, out: &mut [u8]) -> Result<StorageSlot> {
        let table = self.table(name)?;
        let next = table
            .next_slot(slot)
            .ok_or_else(|| engine_error(ErrorKind::EndOfFile, "scan exhausted"))?;
        table.row(next, out);
        Ok(next)
    }

    /// Equality probe against one index; exports the first matching row.
    /// The key and the session borrow share a lifetime because lookups
    /// read key bytes out of the session's own storage.
    pub fn point_read<'a>(
        &'a self,
        name: &str,
        index_no: usize,
        key: &IndexedCells<'a>,
        out: &mut [u8],
    ) -> Result<StorageSlot> {
        let table = self.table(name)?;
        match table.index_lookup(index_no, key)? {
            Lookup::Found { first, .. } => {
                let slot = table
                    .cursor_slot(index_no, first)?
                    .ok_or_else(|| engine_error(ErrorKind::KeyNotFound, "dangling cursor"))?;
                table.row(slot, out);
                Ok(slot)
            }
            Lookup::NotFoundPositionedOnNext { .. } | Lookup::NotFoundUndefined => Err(
                engine_error(ErrorKind::KeyNotFound, "no row matches the key"),
            ),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tables", &self.tables.len())
            .field("shared_block", &self.shared.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Cell;

    fn session() -> Session {
        let mem = Arc::new(MemoryMonitor::with_thresholds(usize::MAX, 0, false));
        let pool = SharedBlockPool::new();
        Session::new(mem, &pool)
    }

    fn fields() -> Vec<FieldDef> {
        vec![FieldDef::fixed(4)]
    }

    fn wire(v: u32) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    #[test]
    fn table_lifecycle_errors() {
        let mut session = session();
        session
            .create_table("t", &fields(), &[], usize::MAX)
            .unwrap();

        let err = session
            .create_table("t", &fields(), &[], usize::MAX)
            .unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::TableExists));

        session.drop_table("t").unwrap();
        let err = session.drop_table("t").unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::NoSuchTable));

        let err = session.table("t").unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::NoSuchTable));
    }

    #[test]
    fn full_scan_ends_with_end_of_file() {
        let mut session = session();
        session
            .create_table("t", &fields(), &[], usize::MAX)
            .unwrap();
        for v in [10u32, 20, 30] {
            session.open("t").unwrap().insert(&wire(v)).unwrap();
        }

        let mut out = vec![0u8; 4];
        let mut seen = Vec::new();
        let mut slot = session.scan_first("t", &mut out).unwrap();
        loop {
            seen.push(u32::from_be_bytes(out[..4].try_into().unwrap()));
            match session.scan_next("t", slot, &mut out) {
                Ok(next) => slot = next,
                Err(e) => {
                    assert_eq!(ErrorKind::of(&e), Some(ErrorKind::EndOfFile));
                    break;
                }
            }
        }
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[test]
    fn empty_scan_is_end_of_file() {
        let mut session = session();
        session
            .create_table("t", &fields(), &[], usize::MAX)
            .unwrap();
        let mut out = vec![0u8; 4];
        let err = session.scan_first("t", &mut out).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::EndOfFile));
    }

    #[test]
    fn point_read_through_a_hash_index() {
        let mut session = session();
        session
            .create_table("t", &fields(), &[IndexDef::hash(true, &[0])], usize::MAX)
            .unwrap();
        for v in [10u32, 20, 30] {
            session.open("t").unwrap().insert(&wire(v)).unwrap();
        }

        let mut out = vec![0u8; 4];
        let probe = 20u32.to_be_bytes();
        let key = IndexedCells::from_cells(&[Cell::new(&probe)]);
        session.point_read("t", 0, &key, &mut out).unwrap();
        assert_eq!(out, wire(20));

        let probe = 99u32.to_be_bytes();
        let key = IndexedCells::from_cells(&[Cell::new(&probe)]);
        let err = session.point_read("t", 0, &key, &mut out).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));
    }

    #[test]
    fn sessions_share_the_pool_cooperatively() {
        let mem = Arc::new(MemoryMonitor::with_thresholds(usize::MAX, 0, false));
        let pool = SharedBlockPool::new();

        let first = Session::new(Arc::clone(&mem), &pool);
        // Same thread, same slot: the second session falls back.
        let second = Session::new(Arc::clone(&mem), &pool);
        assert!(first.shared.is_some());
        assert!(second.shared.is_none());
    }
}
