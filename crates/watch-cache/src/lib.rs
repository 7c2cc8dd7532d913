//! Watch caches and work queues
//!
//! Building blocks shared by the node controller's loops:
//! - `Store`: thread-safe mirror of a remote collection keyed by `namespace/name`
//! - `WatchCache`: applies a list/watch stream to a store, tracks sync state
//!   and delivers add/update/delete notifications to subscribers
//! - `WorkQueue`: keyed queue with per-key serialization and rate-limited requeues
//! - `ExponentialBackoff` / `ItemBackoff`: retry delays

pub mod backoff;
pub mod cache;
pub mod store;
pub mod workqueue;

pub use backoff::{ExponentialBackoff, ItemBackoff};
pub use cache::{EventHandler, WatchCache};
pub use store::{ObjectKey, Store};
pub use workqueue::WorkQueue;
