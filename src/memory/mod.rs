//! # Memory Layer
//!
//! The two leaf components every allocation passes through:
//!
//! - [`block`]: raw memory arenas ([`Block`]) sourced from the heap or from
//!   a memory-mapped temporary file, carved into self-describing chunks.
//! - [`monitor`]: lock-free consumption accounting against configured
//!   ceilings, at process scope ([`MemoryMonitor`]) and per-table scope
//!   ([`TableResourceMonitor`]).
//!
//! Neither component makes policy decisions; block sizing and the
//! RAM-versus-MMAP choice live in [`crate::allocator`].

mod block;
mod monitor;

pub use block::{chunk_footprint, Block, Chunk, Source};
pub use monitor::{MemoryMonitor, TableResourceMonitor};
