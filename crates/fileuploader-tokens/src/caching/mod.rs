//! # In-memory caching with request coalescing
//!
//! Tokens are expensive in the sense that every request is a round trip to the chat server, and
//! an upload of several files to the same server must not fire one request per file. The
//! [`CacheLoader`] therefore does two things:
//!
//! - It keeps the last successfully loaded item per key, and hands it out as long as the
//!   request's validity check accepts it. Items failing the check are evicted and loaded again.
//! - It deduplicates concurrent loads. While a load for a key is running, every lookup of that
//!   key attaches to the same shared future instead of starting another load.
//!
//! The settled items and the in-flight loads live in a single map pair behind one mutex. A load
//! stores its result and removes itself from the in-flight map in the same critical section, so a
//! lookup either sees the in-flight load or its result, never neither. This is what guarantees
//! that there is at most one load per key at any time.
//!
//! Failed loads are not cached. Everybody waiting on the load receives the same error, and the
//! next lookup starts a fresh load. Negative caching of expected failures is up to the user of the
//! loader, see [`TokenManager`](crate::tokens::TokenManager).
//!
//! ### Metrics
//!
//! All metrics are tagged with a `cache` field naming the [`CacheItemRequest`]:
//!
//! - `caches.access`: All lookups.
//! - `caches.memory.hit`: Lookups served by a valid cached item.
//! - `caches.invalid`: Cached items that failed validation and were evicted.
//! - `caches.channel.hit`: Lookups that attached to an in-flight load.
//! - `caches.channel.miss`: Lookups that started a new load.

mod loader;

pub use loader::{CacheItemRequest, CacheLoader, Lookup, PendingLoad};
