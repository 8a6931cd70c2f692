//! Collections
//!
//! - [`TimingWheel`] - single-coordinator delayed task scheduler

mod timing_wheel;

pub use timing_wheel::{TimingWheel, DRAIN_WORKERS};
