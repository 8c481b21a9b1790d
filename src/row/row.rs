use std::mem::size_of;
use std::ptr::NonNull;

use eyre::Result;

use crate::allocator::Allocator;
use crate::row::{Cell, Columns};

/// Bytes of the leading cell-count word.
const HEADER_BYTES: usize = size_of::<u32>();

/// One cell's position inside an [`OwnedRow`] buffer.
#[repr(C)]
#[derive(Clone, Copy)]
struct CellDesc {
    /// Payload offset from the buffer base; 0 for null cells.
    offset: u32,
    length: u32,
    is_null: u32,
}

const DESC_BYTES: usize = size_of::<CellDesc>();

/// A row packed into one allocator chunk: cell count, descriptor array,
/// then the payloads back to back. Releases the chunk on drop.
pub struct OwnedRow {
    buf: NonNull<u8>,
    size: usize,
    alloc: Allocator,
}

impl OwnedRow {
    /// Packs `wire` into owned memory. Allocation failure propagates with
    /// no state change.
    pub fn from_wire_row(alloc: &Allocator, columns: &Columns, wire: &[u8]) -> Result<OwnedRow> {
        debug_assert_eq!(wire.len(), columns.wire_row_len());

        let count = columns.len();
        let payload_total: usize = columns
            .iter()
            .map(|c| if c.is_null_in(wire) { 0 } else { c.user_data_len_in(wire) })
            .sum();
        let size = HEADER_BYTES + count * DESC_BYTES + payload_total;

        let buf = alloc.allocate_bytes(size)?;
        let base = buf.as_ptr();

        // SAFETY: the chunk is `size` bytes and CHUNK_ALIGN aligned, so the
        // u32 header and the 4-byte-aligned descriptor writes below all
        // land inside it, aligned. Payload copies stay within
        // `HEADER + count * DESC .. size` by construction of `size`.
        unsafe {
            (base as *mut u32).write(count as u32);

            let mut payload_cursor = HEADER_BYTES + count * DESC_BYTES;
            for (i, column) in columns.iter().enumerate() {
                let desc = base.add(HEADER_BYTES + i * DESC_BYTES) as *mut CellDesc;
                if column.is_null_in(wire) {
                    desc.write(CellDesc {
                        offset: 0,
                        length: 0,
                        is_null: 1,
                    });
                    continue;
                }
                let cell = column.cell_in(wire);
                desc.write(CellDesc {
                    offset: payload_cursor as u32,
                    length: cell.len() as u32,
                    is_null: 0,
                });
                std::ptr::copy_nonoverlapping(
                    cell.data().as_ptr(),
                    base.add(payload_cursor),
                    cell.len(),
                );
                payload_cursor += cell.len();
            }
            debug_assert_eq!(payload_cursor, size);
        }

        Ok(OwnedRow {
            buf,
            size,
            alloc: alloc.clone(),
        })
    }

    pub fn cell_count(&self) -> usize {
        // SAFETY: the header word was written by `from_wire_row` and the
        // buffer is aligned for u32.
        unsafe { (self.buf.as_ptr() as *const u32).read() as usize }
    }

    /// O(1) zero-copy view of the i-th cell.
    pub fn cell(&self, i: usize) -> Cell<'_> {
        debug_assert!(i < self.cell_count());

        // SAFETY: `i` is within the descriptor array written by
        // `from_wire_row`, and the descriptor's (offset, length) pair
        // denotes a payload range inside this buffer.
        unsafe {
            let desc = (self.buf.as_ptr().add(HEADER_BYTES + i * DESC_BYTES)
                as *const CellDesc)
                .read();
            if desc.is_null != 0 {
                return Cell::null();
            }
            Cell::new(std::slice::from_raw_parts(
                self.buf.as_ptr().add(desc.offset as usize),
                desc.length as usize,
            ))
        }
    }

    /// Rebuilds the wire image of this row into `out`.
    pub fn copy_to_wire_row(&self, columns: &Columns, out: &mut [u8]) {
        debug_assert_eq!(out.len(), columns.wire_row_len());
        debug_assert_eq!(columns.len(), self.cell_count());

        out[..columns.null_bitmap_bytes()].fill(0);
        for (i, column) in columns.iter().enumerate() {
            column.write_cell(&self.cell(i), out);
        }
    }
}

impl Drop for OwnedRow {
    fn drop(&mut self) {
        self.alloc.deallocate_bytes(self.buf, self.size);
    }
}

impl std::fmt::Debug for OwnedRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedRow")
            .field("cells", &self.cell_count())
            .field("size", &self.size)
            .finish()
    }
}

/// A row in one of its two lifetime states: a borrowed view over the
/// caller's wire buffer, or an [`OwnedRow`] in engine memory.
#[derive(Debug)]
pub enum Row<'a> {
    Borrowed(&'a [u8]),
    Owned(OwnedRow),
}

impl<'a> Row<'a> {
    pub fn cell(&self, columns: &Columns, i: usize) -> Cell<'_> {
        match self {
            Row::Borrowed(wire) => columns.column(i).cell_in(wire),
            Row::Owned(owned) => owned.cell(i),
        }
    }

    /// Converts a borrowed row into owned memory. Runs at most once; an
    /// already-owned row is left untouched.
    pub fn copy_to_own_memory(&mut self, alloc: &Allocator, columns: &Columns) -> Result<()> {
        if let Row::Borrowed(wire) = *self {
            *self = Row::Owned(OwnedRow::from_wire_row(alloc, columns, wire)?);
        }
        Ok(())
    }

    pub fn copy_to_wire_row(&self, columns: &Columns, out: &mut [u8]) {
        match self {
            Row::Borrowed(wire) => out.copy_from_slice(wire),
            Row::Owned(owned) => owned.copy_to_wire_row(columns, out),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Row::Owned(_))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::{MemoryMonitor, TableResourceMonitor};
    use crate::row::FieldDef;

    fn test_alloc() -> (Allocator, Arc<MemoryMonitor>) {
        let mem = Arc::new(MemoryMonitor::with_thresholds(usize::MAX, 0, false));
        let table = Arc::new(TableResourceMonitor::new(usize::MAX));
        (Allocator::new(Arc::clone(&mem), table, None), mem)
    }

    fn mixed_columns() -> Columns {
        Columns::from_defs(&[
            FieldDef::fixed(4),
            FieldDef::var(300).nullable(),
            FieldDef::var(10),
        ])
        .unwrap()
    }

    fn sample_wire(columns: &Columns) -> Vec<u8> {
        let mut wire = vec![0u8; columns.wire_row_len()];
        columns.column(0).write_cell(&Cell::new(b"\x01\x02\x03\x04"), &mut wire);
        columns.column(1).write_cell(&Cell::new(b"variable payload"), &mut wire);
        columns.column(2).write_cell(&Cell::new(b"tail"), &mut wire);
        wire
    }

    #[test]
    fn owned_row_preserves_cells() {
        let (alloc, _mem) = test_alloc();
        let columns = mixed_columns();
        let wire = sample_wire(&columns);

        let owned = OwnedRow::from_wire_row(&alloc, &columns, &wire).unwrap();
        assert_eq!(owned.cell_count(), 3);
        assert_eq!(owned.cell(0).data(), b"\x01\x02\x03\x04");
        assert_eq!(owned.cell(1).data(), b"variable payload");
        assert_eq!(owned.cell(2).data(), b"tail");
    }

    #[test]
    fn null_cells_survive_the_round_trip() {
        let (alloc, _mem) = test_alloc();
        let columns = mixed_columns();
        let mut wire = sample_wire(&columns);
        columns.column(1).write_cell(&Cell::null(), &mut wire);

        let owned = OwnedRow::from_wire_row(&alloc, &columns, &wire).unwrap();
        assert!(owned.cell(1).is_null());

        let mut out = vec![0u8; columns.wire_row_len()];
        owned.copy_to_wire_row(&columns, &mut out);
        assert!(columns.column(1).is_null_in(&out));
        assert_eq!(columns.column(0).cell_in(&out).data(), b"\x01\x02\x03\x04");
    }

    #[test]
    fn wire_round_trip_reproduces_defined_bytes() {
        let (alloc, _mem) = test_alloc();
        let columns = mixed_columns();
        let wire = sample_wire(&columns);

        let owned = OwnedRow::from_wire_row(&alloc, &columns, &wire).unwrap();
        let mut out = vec![0u8; columns.wire_row_len()];
        owned.copy_to_wire_row(&columns, &mut out);

        // Compare cell-wise: bytes past a variable cell's length are not
        // defined in either image.
        for i in 0..columns.len() {
            assert_eq!(
                columns.compare_wire_cells(i, &wire, &out),
                std::cmp::Ordering::Equal
            );
        }
        assert_eq!(&out[..columns.null_bitmap_bytes()], &wire[..columns.null_bitmap_bytes()]);
    }

    #[test]
    fn borrowed_row_becomes_owned_once() {
        let (alloc, mem) = test_alloc();
        let columns = mixed_columns();
        let wire = sample_wire(&columns);

        let mut row = Row::Borrowed(&wire);
        assert_eq!(row.cell(&columns, 2).data(), b"tail");
        assert!(!row.is_owned());

        row.copy_to_own_memory(&alloc, &columns).unwrap();
        assert!(row.is_owned());
        assert_eq!(row.cell(&columns, 2).data(), b"tail");

        // Idempotent on an owned row.
        row.copy_to_own_memory(&alloc, &columns).unwrap();
        assert!(row.is_owned());

        drop(row);
        assert_eq!(mem.ram_consumption(), 0);
    }

    #[test]
    fn owned_row_releases_its_chunk() {
        let (alloc, mem) = test_alloc();
        let columns = mixed_columns();
        let wire = sample_wire(&columns);

        let owned = OwnedRow::from_wire_row(&alloc, &columns, &wire).unwrap();
        assert!(mem.ram_consumption() > 0);
        drop(owned);
        drop(alloc);
        assert_eq!(mem.ram_consumption(), 0);
    }
}
