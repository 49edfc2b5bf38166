//! Core trait definitions

mod sink;

pub use sink::FrameSink;
