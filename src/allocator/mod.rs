//! # Allocator Layer
//!
//! Feeds a growing sequence of [`Block`](crate::memory::Block)s to
//! allocation requests while enforcing the global and per-table memory
//! monitors.
//!
//! - [`policy`]: how big the next block is ([`ExponentialPolicy`]) and
//!   where its memory comes from ([`PreferRamOverMmap`]). Composing the two
//!   yields the engine's single allocation scheme.
//! - [`shared_block`]: the process-wide, lock-free slot pool that lets
//!   cooperating allocators on one thread coalesce small allocations into
//!   one keep-alive block.
//! - [`Allocator`]: the rebindable handle servicing `allocate`/`deallocate`
//!   over shared, reference-counted state. It also implements
//!   `allocator_api2::alloc::Allocator`, which is how the index containers
//!   draw from it.

mod allocator;
mod policy;
mod shared_block;

pub use allocator::Allocator;
pub use policy::{ExponentialPolicy, PreferRamOverMmap};
pub use shared_block::{current_thread_token, SharedBlock, SharedBlockPool};
