//! # sniffer
//!
//! Propagation API of the sniffer tracing agent.
//!
//! This crate holds what an instrumentation library needs to link work
//! across process boundaries without depending on the agent runtime:
//!
//! * [`TraceId`] and [`SegmentId`], the identifiers that travel on the wire.
//! * The [`propagation`] module: the [`Injector`] / [`Extractor`] seams and
//!   the `sw8` [`ContextCarrier`] codec.
//! * Internal diagnostics macros ([`sniffer_warn!`] and friends) used by the
//!   agent and by custom reporters.
//!
//! The span stacks, snapshots and the dispatch pipeline live in the
//! `sniffer_sdk` crate.
//!
//! # Example
//!
//! ```
//! use sniffer::propagation::ContextCarrier;
//! use std::collections::HashMap;
//!
//! let mut headers = HashMap::new();
//! headers.insert("sw8".to_string(), "1-dHJhY2UtMQ==-c2VnbWVudC0x-3".to_string());
//!
//! let carrier = ContextCarrier::extract(&headers).expect("valid header");
//! assert_eq!(carrier.trace_id.unwrap().as_str(), "trace-1");
//! assert_eq!(carrier.parent_span_index, Some(3));
//! ```
//!
//! [`Injector`]: propagation::Injector
//! [`Extractor`]: propagation::Extractor
//! [`ContextCarrier`]: propagation::ContextCarrier
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod global;
mod ids;
pub mod propagation;

pub use ids::{SegmentId, TraceId};

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, info, warn}; // re-export for the internal logging macros
}
