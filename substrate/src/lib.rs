//! # Substrate Storage Engine
//! The storage substrate for the StrataDB engine.
//! This crate is responsible for the on-disk and in-memory representation of
//! data: fixed-size paged storage with an accounted cost model, the slotted
//! page format, the buffer cache with pluggable eviction, and the transaction
//! plumbing (write-ahead-log hooks, schedulers, transaction manager).

/// The buffer cache and its eviction policies.
pub mod cache;
/// Error types shared across the substrate.
pub mod error;
/// File-backed storage over pre-sized segment files.
pub mod file_storage;
/// The two-phase-locking scheduler.
pub mod locking;
/// The slotted page layout.
pub mod page;
/// The scheduler contract plus timestamp-ordering and MVCC references.
pub mod scheduler;
/// Paged storage with the access-cost model.
pub mod storage;
/// The transaction manager and its cache wrapper.
pub mod transaction;
/// Write-ahead-log hooks.
pub mod wal;

/// The size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// A page identifier. Persisted references are always non-negative; `-1`
/// means "next available" in the bulk storage APIs only.
pub type PageId = i32;

/// A slot index inside a page's record directory.
pub type SlotId = i32;

/// A transaction descriptor, assigned monotonically by the manager.
pub type TxnId = u32;

pub use cache::{
    BufferCache, CacheConfig, CacheStats, EvictionPolicy, NoneCache, PageHandle, PageStore,
};
pub use error::StoreError;
pub use page::{GetResult, PutResult, SlottedPage, NEW_SLOT};
pub use storage::{MemStorage, Page, Storage};
