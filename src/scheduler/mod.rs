//! Background jobs: the flush timer and the detection timer.

pub mod engine;

pub use self::engine::{run_detection_loop, run_flush_loop};
