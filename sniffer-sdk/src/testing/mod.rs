//! In-memory sinks and reporters for testing purpose.

/// Structs used for testing
pub mod trace;
