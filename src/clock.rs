//! The monotonic clock entries are stamped with.
//!
//! Outside of unit tests this is `std::time::Instant`. Unit tests swap in
//! `mock_instant`'s thread-local clock so elapsed times can be advanced
//! explicitly with `MockClock::advance` instead of sleeping.

#[cfg(test)]
pub use mock_instant::thread_local::Instant;

#[cfg(not(test))]
pub use std::time::Instant;

#[cfg(test)]
pub use mock_instant::thread_local::MockClock;
