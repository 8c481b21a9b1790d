//! # Row Encoding
//!
//! Rows arrive from the execution layer in the flat wire format described
//! in [`column`], owned by the caller. A [`Row`] starts life as a borrowed
//! view over that buffer and is converted to owned memory exactly once, at
//! the point it must outlive the caller (insertion into storage). The
//! conversion never runs in reverse.
//!
//! ## Owned layout
//!
//! [`OwnedRow`] packs the row into a single allocator chunk, trading the
//! wire format's fixed reserved regions for a compact descriptor array:
//!
//! ```text
//! ┌───────┬──────────────────────────────┬──────────────────┐
//! │ count │ (offset, length, null) × cnt │ packed payloads  │
//! └───────┴──────────────────────────────┴──────────────────┘
//! ```
//!
//! `cell(i)` is then an O(1) descriptor read with zero copying, which is
//! what index comparisons run on. [`OwnedRow::copy_to_wire_row`] rebuilds
//! the wire image for the read path; bytes in a variable column's unused
//! payload tail are not defined.

mod cell;
mod column;
mod row;

pub use cell::Cell;
pub use column::{Column, Columns, FieldDef, FieldKind};
pub use row::{OwnedRow, Row};
