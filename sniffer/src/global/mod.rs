//! Process-wide facilities shared by every agent component.
//!
//! The agent keeps no global tracer or engine instance: engines are built and
//! passed explicitly. What lives here are the internal diagnostics macros,
//! exported at the crate root.
mod internal_logging;
