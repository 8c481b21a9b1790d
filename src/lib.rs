//! # temptable - In-Memory Temporary-Table Engine
//!
//! `temptable` is an embeddable row-store engine for internal temporary
//! tables: the working tables a query executor materializes for sorting,
//! grouping, derived tables and CTEs. Everything lives in process memory
//! (spilling to a memory-mapped scratch file under pressure) and vanishes
//! with the table. This implementation prioritizes:
//!
//! - **Zero-copy row access**: cells are views into stored buffers, index
//!   comparisons never copy payloads
//! - **Strict memory ceilings**: global RAM/MMAP and per-table budgets
//!   enforced on every block, with typed backpressure errors
//! - **Atomic mutations**: a failed insert/update/remove rolls back to the
//!   exact pre-call state
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use temptable::{FieldDef, IndexDef, MemoryMonitor, SharedBlockPool, Session};
//!
//! let monitor = Arc::new(MemoryMonitor::auto_detect());
//! let pool = SharedBlockPool::new();
//!
//! let mut session = Session::new(monitor, &pool);
//! session.create_table(
//!     "groupby",
//!     &[FieldDef::fixed(8), FieldDef::var(255).nullable()],
//!     &[IndexDef::hash(true, &[0])],
//!     16 * 1024 * 1024,
//! )?;
//! session.open("groupby")?.insert(&wire_row)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Session (handler API)        │
//! ├─────────────────────────────────────┤
//! │      Table (rollback semantics)     │
//! ├──────────────────┬──────────────────┤
//! │ Storage (paged   │ Indexes (tree,   │
//! │ row sequence)    │ hash × 2)        │
//! ├──────────────────┴──────────────────┤
//! │    Row / Cell / Column encoding     │
//! ├─────────────────────────────────────┤
//! │  Allocator (blocks, shared slots)   │
//! ├─────────────────────────────────────┤
//! │  Memory monitors + RAM/MMAP blocks  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`memory`]: blocks, chunks and the RAM/MMAP consumption monitors
//! - [`allocator`]: exponential block growth, RAM-then-MMAP sourcing, the
//!   shared-block slot pool
//! - [`row`]: wire-format decoding and the owned cell-array encoding
//! - [`storage`]: paged element container with tombstone deletion
//! - [`index`]: ordered multiset, hash multiset and hash set indexes
//! - [`table`]: mutation orchestration with all-or-nothing rollback
//! - [`handler`]: the session adapter an execution layer drives
//!
//! Each table is single-writer; only the monitors and the shared-block
//! pool are safe to touch from many threads.

pub mod allocator;
pub mod config;
pub mod handler;
pub mod index;
pub mod memory;
pub mod result;
pub mod row;
pub mod storage;
pub mod table;

pub use allocator::{current_thread_token, Allocator, SharedBlock, SharedBlockPool};
pub use handler::Session;
pub use index::{Cursor, ElementMode, Index, IndexAlgorithm, IndexCtx, IndexDef, IndexedCells, Lookup};
pub use memory::{MemoryMonitor, Source, TableResourceMonitor};
pub use result::{EngineError, ErrorKind};
pub use row::{Cell, Column, Columns, FieldDef, FieldKind, OwnedRow, Row};
pub use storage::{Storage, StorageSlot};
pub use table::Table;
