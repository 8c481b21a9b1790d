//! Engine configuration.
//!
//! All tunable constants live in [`constants`]; runtime knobs (memory
//! ceilings, the MMAP enable flag, per-table limits) are plain numeric
//! values supplied by the embedder at construction time and are never
//! read from the environment by this crate.

mod constants;

pub use constants::*;
