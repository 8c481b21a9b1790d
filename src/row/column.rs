//! # Column Layout Derivation
//!
//! The execution layer hands rows over in a flat "wire" image whose layout
//! is fixed per table. [`Columns::from_defs`] derives that layout once from
//! the field definitions:
//!
//! ```text
//! ┌─────────────┬───────────┬──────────────────────────┬───────────┐
//! │ null bitmap │ fixed col │ [len prefix][payload ...] │ fixed col │
//! └─────────────┴───────────┴──────────────────────────┴───────────┘
//!   one bit per    `len`      1 or 2 LE bytes, then       ...
//!   nullable col   bytes      `max_len` reserved bytes
//! ```
//!
//! Only nullable columns consume a bitmap bit. Variable-size columns carry
//! a little-endian length prefix sized by their maximum (1 byte under 256,
//! 2 bytes otherwise); the payload region is always reserved at full
//! `max_len`, so the wire row length is a constant for the table. Bytes
//! past a variable cell's actual length are not defined.

use std::cmp::Ordering;

use eyre::Result;

use crate::result::{engine_error, ErrorKind};
use crate::row::Cell;

/// Field metadata as consumed from the execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub nullable: bool,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Exactly this many payload bytes, no length prefix.
    Fixed(usize),
    /// Up to this many payload bytes behind a length prefix.
    Var(usize),
}

impl FieldDef {
    pub fn fixed(len: usize) -> Self {
        Self {
            nullable: false,
            kind: FieldKind::Fixed(len),
        }
    }

    pub fn var(max_len: usize) -> Self {
        Self {
            nullable: false,
            kind: FieldKind::Var(max_len),
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Derived wire layout of one column.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    is_nullable: bool,
    null_byte_offset: usize,
    null_bit_mask: u8,
    is_fixed: bool,
    /// 0 for fixed columns, 1 or 2 for variable ones.
    length_prefix_bytes: usize,
    /// Byte offset of the length prefix (variable) or payload (fixed).
    offset: usize,
    /// Fixed payload length, or the maximum for variable columns.
    length: usize,
}

impl Column {
    pub fn is_nullable(&self) -> bool {
        self.is_nullable
    }

    pub fn is_fixed(&self) -> bool {
        self.is_fixed
    }

    /// Maximum bytes a cell of this column can hold.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_null_in(&self, wire: &[u8]) -> bool {
        self.is_nullable && wire[self.null_byte_offset] & self.null_bit_mask != 0
    }

    /// Actual payload length of this column's cell in `wire`.
    pub fn user_data_len_in(&self, wire: &[u8]) -> usize {
        if self.is_fixed {
            return self.length;
        }
        match self.length_prefix_bytes {
            1 => wire[self.offset] as usize,
            _ => u16::from_le_bytes([wire[self.offset], wire[self.offset + 1]]) as usize,
        }
    }

    /// Zero-copy view of this column's cell in `wire`.
    pub fn cell_in<'a>(&self, wire: &'a [u8]) -> Cell<'a> {
        if self.is_null_in(wire) {
            return Cell::null();
        }
        let start = self.offset + self.length_prefix_bytes;
        let len = self.user_data_len_in(wire);
        Cell::new(&wire[start..start + len])
    }

    /// Writes `cell` back into `wire` at this column's position: null bit,
    /// length prefix and payload. The caller zeroes the bitmap up front.
    pub fn write_cell(&self, cell: &Cell<'_>, wire: &mut [u8]) {
        if cell.is_null() {
            debug_assert!(self.is_nullable, "null cell in a non-nullable column");
            wire[self.null_byte_offset] |= self.null_bit_mask;
            return;
        }

        let data = cell.data();
        debug_assert!(
            if self.is_fixed {
                data.len() == self.length
            } else {
                data.len() <= self.length
            },
            "cell length does not fit the column"
        );

        match self.length_prefix_bytes {
            0 => {}
            1 => wire[self.offset] = data.len() as u8,
            _ => wire[self.offset..self.offset + 2]
                .copy_from_slice(&(data.len() as u16).to_le_bytes()),
        }
        let start = self.offset + self.length_prefix_bytes;
        wire[start..start + data.len()].copy_from_slice(data);
    }
}

/// Per-table column metadata, derived once at table construction and shared
/// read-only by every row of the table.
#[derive(Debug, Clone)]
pub struct Columns {
    columns: Vec<Column>,
    null_bitmap_bytes: usize,
    wire_row_len: usize,
    all_fixed: bool,
}

impl Columns {
    pub fn from_defs(defs: &[FieldDef]) -> Result<Columns> {
        let nullable_bits = defs.iter().filter(|d| d.nullable).count();
        let null_bitmap_bytes = nullable_bits.div_ceil(8);

        let mut columns = Vec::with_capacity(defs.len());
        let mut next_null_bit = 0usize;
        let mut cursor = null_bitmap_bytes;
        let mut all_fixed = true;

        for def in defs {
            let (null_byte_offset, null_bit_mask) = if def.nullable {
                let bit = next_null_bit;
                next_null_bit += 1;
                (bit / 8, 1u8 << (bit % 8))
            } else {
                (0, 0)
            };

            let column = match def.kind {
                FieldKind::Fixed(len) => {
                    let column = Column {
                        is_nullable: def.nullable,
                        null_byte_offset,
                        null_bit_mask,
                        is_fixed: true,
                        length_prefix_bytes: 0,
                        offset: cursor,
                        length: len,
                    };
                    cursor += len;
                    column
                }
                FieldKind::Var(max_len) => {
                    if max_len > u16::MAX as usize {
                        return Err(engine_error(
                            ErrorKind::Unsupported,
                            format!("variable column of {max_len} bytes exceeds the 2-byte length prefix"),
                        ));
                    }
                    all_fixed = false;
                    let prefix = if max_len < 256 { 1 } else { 2 };
                    let column = Column {
                        is_nullable: def.nullable,
                        null_byte_offset,
                        null_bit_mask,
                        is_fixed: false,
                        length_prefix_bytes: prefix,
                        offset: cursor,
                        length: max_len,
                    };
                    cursor += prefix + max_len;
                    column
                }
            };
            columns.push(column);
        }

        Ok(Columns {
            columns,
            null_bitmap_bytes,
            wire_row_len: cursor,
            all_fixed,
        })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, i: usize) -> &Column {
        &self.columns[i]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Column> {
        self.columns.iter()
    }

    /// Constant byte length of this table's wire rows.
    pub fn wire_row_len(&self) -> usize {
        self.wire_row_len
    }

    /// True when every column is fixed-size, which lets the table store
    /// flat wire copies instead of owned cell arrays.
    pub fn all_fixed(&self) -> bool {
        self.all_fixed
    }

    pub fn null_bitmap_bytes(&self) -> usize {
        self.null_bitmap_bytes
    }

    /// Compares the cells of column `i` in two wire rows.
    pub fn compare_wire_cells(&self, i: usize, a: &[u8], b: &[u8]) -> Ordering {
        let column = &self.columns[i];
        column.cell_in(a).compare(&column.cell_in(b))
    }
}
