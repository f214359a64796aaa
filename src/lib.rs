//! # perdure
//!
//! Fully persistent (immutable) data structures for Rust.
//!
//! ## Overview
//!
//! Every mutating operation on a `perdure` container returns a new logical
//! container; previous versions remain valid and observable. Structural
//! sharing keeps updates cheap, and all containers are safe to share across
//! threads without external synchronization. The library includes:
//!
//! - [`PersistentStack`](persistent::PersistentStack): last-in, first-out,
//!   all operations worst-case O(1)
//! - [`PersistentQueue`](persistent::PersistentQueue): first-in, first-out
//!   with worst-case (not amortized) O(1) operations, built on Okasaki's
//!   real-time queue with a lazy schedule
//! - [`PersistentOrderedMap`](persistent::PersistentOrderedMap): key-ordered
//!   map with O(log n) worst-case insertion, deletion, lookup, neighbor
//!   queries, and rank queries, implemented as a red-black tree with
//!   double-black deletion
//! - [`LazyList`](persistent::LazyList): the thread-safe memoized lazy cons
//!   list underlying the queue's schedule
//!
//! ## Example
//!
//! ```rust
//! use perdure::prelude::*;
//!
//! let map = PersistentOrderedMap::new()
//!     .insert("foo", 1)
//!     .insert("bar", 2);
//! let updated = map.insert("baz", 3);
//!
//! // The original version is untouched
//! assert_eq!(map.len(), 2);
//! assert_eq!(updated.len(), 3);
//! ```
//!
//! ## Thread Safety
//!
//! All containers share nodes through `Arc`; nothing reachable from a
//! returned container is ever mutated in place, with one exception: the
//! one-shot memoization of a [`LazyList`](persistent::LazyList) tail, which
//! is synchronized so that concurrent observers all receive the identical
//! resolved tail.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Prelude module for convenient imports.
///
/// Re-exports commonly used types.
///
/// # Usage
///
/// ```rust
/// use perdure::prelude::*;
/// ```
pub mod prelude {
    pub use crate::persistent::*;
}

pub mod persistent;

#[cfg(test)]
mod tests {
    #[test]
    fn library_compiles() {
        // Basic smoke test to ensure the library compiles
    }
}
