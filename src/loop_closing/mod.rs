//! Loop closing: the background stage that detects map revisits.
//!
//! The stage receives keyframes from local mapping, queries the
//! place-recognition index, and owns the global-optimization in-flight flag
//! that gates system shutdown.

mod loop_closer;

pub use loop_closer::{LoopCloser, LoopCloserConfig, LoopCloserStats, LoopControl};
