//! # sniffer SDK
//!
//! The runtime of the sniffer tracing agent. It records what instrumented
//! code reports as spans and ships the result to a collector without ever
//! blocking or failing the application.
//!
//! * [`trace`]: the [`ContextEngine`](trace::ContextEngine), which keeps a
//!   span stack per execution context, seals finished stacks into segments
//!   and links contexts across threads ([`ContextSnapshot`]) and processes
//!   (`sw8` carriers from the `sniffer` crate).
//! * [`buffer`]: a partitioned, bounded [`SegmentBuffer`](buffer::SegmentBuffer)
//!   with a configurable overflow policy.
//! * [`dispatch`]: a worker pool moving batches of segments to a
//!   [`SegmentReporter`](export::SegmentReporter) with bounded retries.
//! * [`agent`]: the [`Agent`](agent::Agent) wiring all of the above.
//! * [`config`]: builders fed by environment variables, and the cells behind
//!   the settings that can change at runtime.
//!
//! ## Getting started
//!
//! ```
//! use sniffer::propagation::ContextCarrier;
//! use sniffer_sdk::trace::{ContextEngine, ContextKey, NoopSegmentSink};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! let engine = ContextEngine::builder(Arc::new(NoopSegmentSink)).build();
//! let key = ContextKey::current_thread();
//!
//! // Incoming request: continue the caller's trace if it sent one.
//! let headers: HashMap<String, String> = HashMap::new();
//! let incoming = ContextCarrier::extract(&headers);
//! let _request = engine.enter_entry_span(key, "GET /orders", incoming.as_ref());
//!
//! // Outgoing call: propagate the trace to the callee.
//! let mut outgoing = ContextCarrier::new();
//! {
//!     let _call = engine.enter_exit_span(key, "GET /stock", "stock:8080", Some(&mut outgoing));
//! }
//! let mut request_headers: HashMap<String, String> = HashMap::new();
//! outgoing.inject(&mut request_headers);
//! assert!(request_headers.contains_key("sw8"));
//! ```
//!
//! [`ContextSnapshot`]: trace::ContextSnapshot
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![allow(clippy::needless_doctest_main)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod agent;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod export;
#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
pub mod trace;

pub use agent::{Agent, AgentBuilder};
pub use error::{SdkError, SdkResult};
