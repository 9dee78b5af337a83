//! qsync Cache - Cache Host and Query Fetching
//!
//! The cache host owns cached query results; the engine reads and writes
//! them through the [`CacheHost`] trait. [`InMemoryCacheHost`] is the
//! reference host with subscriber notification and stale tracking, and
//! [`QueryFetcher`] loads and refetches entries through a transport.

pub mod fetch;
pub mod host;
pub mod infinite;
pub mod memory;

pub use fetch::QueryFetcher;
pub use host::{keys_for_model, CacheHost};
pub use infinite::InfiniteData;
pub use memory::{CacheEvent, EntrySnapshot, InMemoryCacheHost};
