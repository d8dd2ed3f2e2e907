//! In-memory response cache that shares one origin fetch between concurrent clients.
//!
//! The first request for a key creates a [`CacheEntry`] and spawns a [`Receiver`] that
//! appends the raw origin response to it. Every client, the creator included, streams the
//! entry's bytes through its own [`Reader`]. Completed entries replay from offset 0; entries
//! that grow past the size cap switch to passthrough and only keep the window their attached
//! readers still need.

mod buffer;
mod entry;
pub mod key;
mod receiver;
mod store;
mod streamer;
mod sweeper;

pub use buffer::{BufferError, GrowableBuffer};
pub use entry::{AttachError, CacheEntry, EntrySnapshot, FetchState, Reader, StreamEnd};
pub use key::{build_key, is_cacheable};
pub use receiver::{FetchLimits, Receiver};
pub use store::{CacheStore, Lookup};
pub use streamer::{StreamError, StreamSummary};
pub use sweeper::{SweepPolicy, SweepStats, spawn_sweeper};
