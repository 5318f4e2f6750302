//! Test doubles for the segment pipeline.
mod in_memory_reporter;
mod in_memory_sink;

pub use in_memory_reporter::{InMemoryReporter, InMemoryReporterBuilder};
pub use in_memory_sink::InMemorySegmentSink;
