//! An LRU cache of decoded resources which fills itself in the background.
//!
//! Sometimes, you have something like an image behind a URL or a file on disk, and what you actually want in memory
//! is the decoded form.  Fetching and decoding is slow enough that you don't want to do it on the thread asking, and
//! common enough that you don't want to do it twice, but a plain map of keys to decoded values will just grow forever.
//! This crate provides a solution to that problem via two types and some traits:
//!
//! [LruStore] is a standard Lru cache bounded by an entry count.  This is the basic low-level building block, and is
//! exposed because it's useful in other contexts.  This is the simplest piece to use: you just throw items at it.
//!
//! The higher level piece is [FetchCache], which returns `Arc`s wrapping items decoded from bytes read through a
//! [Fetcher]:
//!
//! - A lookup that hits returns immediately.
//! - A lookup that misses returns `None` and hands the fetch and decode to a [WorkerPool], which never runs more than
//!   a configured number of fetches at once.
//! - When the value lands in the store, interested callers are notified through a [Dispatcher], which runs
//!   notifications one at a time on a context of the embedder's choosing.
//!
//! To use this crate, implement [Fetcher] (or use [FileFetcher]) and [Asset], then construct a [FetchCache] with your
//! chosen [FetchCacheConfig] and a dispatcher, for example from [notification_queue].
mod config;
mod dispatch;
mod error;
mod fetch_cache;
mod fs_fetcher;
mod lru_store;
mod stats;
mod traits;
mod worker_pool;

pub use config::*;
pub use dispatch::*;
pub use error::*;
pub use fetch_cache::*;
pub use fs_fetcher::*;
pub use lru_store::*;
pub use stats::CacheStats;
pub use traits::*;
pub use worker_pool::*;
