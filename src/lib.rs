//! A concurrent key/value map that records when each value was last written.
//!
//! [`TimedMap`] answers "how long has this key held its current value" next
//! to the usual map operations, which makes it a building block for
//! heartbeat trackers, rate limiters and short-lived caches. Entries never
//! expire on their own; staleness is for the caller to judge through
//! [`TimedMap::elapsed_time`].
//!
//! Storage is delegated to a [`BackingStore`], by default a sharded
//! [`DashMap`](dashmap::DashMap). Conditional operations (`remove_if`,
//! `replace_if`, `put_if_absent`) each land as one atomic call on the key's
//! shard.

mod backing;
mod clock;
mod entry;
mod store;
mod view;

pub use backing::{check_snapshot, BackingStore, CasError};
pub use clock::Instant;
pub use entry::Entry;
pub use store::TimedMap;
pub use view::EntryView;
