//! Hashing
//!
//! - [`ConsistentHash`] - weighted consistent-hash ring used to shard cache keys

mod consistent;

pub use consistent::{ConsistentHash, DEFAULT_REPLICAS, TOP_WEIGHT};
