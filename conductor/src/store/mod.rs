//! Crash-safe file persistence.
//!
//! Layers, bottom up:
//! - [`atomic`]: temp-file-and-rename writes
//! - [`lock`]: lock records with expiry and stealing
//! - [`cache`]: LRU read cache with TTL
//! - [`batch`]: write queue with coalescing
//! - [`StateStore`]: all of the above behind one read/write API

pub mod atomic;
mod batch;
mod cache;
mod lock;
mod shared;
mod state_store;

pub use batch::{BatchConfig, BatchSink, BatchStats, WriteBatcher, WriteTicket};
pub use cache::{CacheConfig, CacheStats, EvictionHook, EvictionReason, LruTtlCache};
pub use lock::{lock_path_for, LockBackoff, LockConfig, LockManager, LockRecord, LockStats};
pub use shared::{install_shared_store, reset_shared_store, shared_store};
pub use state_store::{StateStore, StoreConfig, StoreMetrics};
