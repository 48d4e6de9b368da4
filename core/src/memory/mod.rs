//! # Device memory
//!
//! Variables of a compiled sequence are either *static*: their size is
//! known before execution and they get a fixed offset in a per comp node
//! arena laid out by [`schema`], or *dynamic*: they are allocated right
//! after their producer runs and freed once their last reader is done.
//!
//! Dynamic allocation failures are recovered once, by defragmenting the
//! comp node memory or, when rematerialization is enabled, by evicting
//! values that are cheap to compute again.
use serde::Serialize;

mod allocator;
mod defrag;
mod dynamic;
mod eviction;
mod pool;
pub mod schema;
mod static_mem;

pub use self::allocator::{DefaultAllocator, DeviceMemoryAllocator, DeviceStorage, MemAllocError};
pub use self::dynamic::{DynamicMemory, DynamicStats, Loaded, Recompute};
pub use self::pool::StaticStoragePool;
pub use self::schema::{Lifetime, MemSchema, Partition, VarMemReq};
pub(crate) use self::static_mem::StaticMemory;
#[cfg(test)]
pub(crate) use self::dynamic::tests as dynamic_tests;

/// Alignment of every storage, in bytes.
pub const ALIGNMENT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum MemClass {
    Static,
    Dynamic,
}

/// Memory state of a variable of a compiled sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum VarMemState {
    /// Not produced by the sequence, or not planned yet.
    Unallocated,
    /// Has an offset in the static arena, which is not allocated yet.
    StaticPlanned,
    /// The static arena holding it is allocated.
    StaticBound,
    /// Waits for its producer to run.
    DynamicPending,
    DynamicBound,
    /// Dropped to save memory, computed again when read.
    Evicted,
    /// Every reader is done and the storage is freed.
    Released,
}
