//! Cache utilities
//!
//! - `hash` - stable content hashing for cache keys
//! - `memo` - keyed memoization with explicit invalidation

pub mod hash;
pub mod memo;

pub use hash::{content_hash, short_hash, CompositeKey};
pub use memo::MemoCache;
