//! Synchronization primitives
//!
//! - [`SharedCalls`] - collapses concurrent identical-key calls into one

mod shared_calls;

pub use shared_calls::SharedCalls;
