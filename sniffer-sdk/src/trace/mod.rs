//! # Context engine
//!
//! The engine keeps one span stack per execution context. Spans pushed
//! between the first create and the last stop of a context form a
//! [`Segment`], which is sealed when the stack empties and handed to a
//! [`SegmentSink`].
//!
//! Work is linked across contexts in two ways:
//!
//! * across processes, an exit span fills a
//!   [`ContextCarrier`](sniffer::propagation::ContextCarrier) that the callee
//!   passes to its entry span;
//! * across threads, [`ContextEngine::capture`] takes a [`ContextSnapshot`]
//!   that the receiving context passes to [`ContextEngine::continued`].
//!   [`TracedTask`] does both for a closure.
mod context;
mod context_key;
mod engine;
mod id_generator;
mod sampler;
mod segment;
mod sink;
mod snapshot;
mod span_ref;
mod span_stack;
mod status;
mod task;

pub use context_key::ContextKey;
pub use engine::{ContextEngine, ContextEngineBuilder};
#[cfg(any(test, feature = "testing"))]
pub use id_generator::IncrementIdGenerator;
pub use id_generator::{GlobalIdGenerator, IdGenerator};
pub use segment::{
    LogEvent, RefType, Segment, SegmentReference, SpanKind, SpanLayer, SpanRecord,
};
pub use sink::{NoopSegmentSink, SegmentSink};
pub use snapshot::ContextSnapshot;
pub use span_ref::{SpanGuard, SpanRef};
pub use span_stack::ActiveSpan;
pub use status::StatusCheck;
pub(crate) use status::ErrorStatusChecker;
pub use task::TracedTask;
