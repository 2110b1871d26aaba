//! cellar: a tiered memory allocator over a reserved address range.
//!
//! A [`Context`] owns a contiguous virtual reservation partitioned into
//! 16 KiB cells. Requests route to one of three tiers by size: a sub-cell
//! slab with per-class bins and per-thread caches, a buddy allocator for
//! medium blocks, and direct OS mappings tracked in a registry. Cells are
//! aligned to their own size, so any live sub-cell pointer finds its
//! metadata with a single mask.
//!
//! ```no_run
//! use cellar::{Config, Context};
//!
//! let ctx = Context::new(Config { reserve_size: 1 << 30, ..Config::default() })?;
//! let p = ctx.alloc_bytes(100, 0);
//! assert!(!p.is_null());
//! unsafe { ctx.free_bytes(p) };
//! # Ok::<(), cellar::Error>(())
//! ```
//!
//! Allocation failures surface as null pointers; the only typed error is
//! reservation failure at construction. Optional adapters layer on top of
//! the context: a bump [`Arena`], a typed [`Pool`], and [`ContextAlloc`]
//! for `allocator-api2` containers.

mod arena;
#[cfg(feature = "budget")]
mod budget;
mod buddy;
mod cell;
mod cell_alloc;
mod config;
mod context;
mod large;
mod os;
mod pool;
mod shim;
mod slab;
mod tls;

#[cfg(feature = "budget")]
pub use budget::BudgetCallback;
pub use arena::{Arena, ArenaScope};
pub use config::{CELL_PAYLOAD_SIZE, CELL_SIZE, Config, MAX_SUBCELL_SIZE};
pub use context::{Context, ContextStats, Error};
pub use pool::Pool;
pub use shim::ContextAlloc;
