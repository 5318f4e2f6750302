//! # Cross-process propagation
//!
//! A trace crosses a process boundary inside the messages the application
//! already exchanges (HTTP headers, RPC metadata, message properties). The
//! agent writes its [`ContextCarrier`] into those messages through an
//! [`Injector`] on the sending side and reads it back through an
//! [`Extractor`] on the receiving side.
//!
//! The carrier uses three keys:
//!
//! - `sw8`: the trace linkage itself, see [`ContextCarrier::serialize`].
//! - `sw8-x`: the [`ExtensionContext`].
//! - `sw8-correlation`: the [`CorrelationContext`], omitted when empty.
//!
//! Unknown keys are ignored and malformed values degrade to "no linkage";
//! extraction never fails hard.
use std::borrow::Cow;
use std::collections::HashMap;

pub mod carrier;
pub mod correlation;

pub use carrier::{ContextCarrier, ExtensionContext};
pub use correlation::CorrelationContext;

/// Injector provides an interface for adding fields to an outgoing message.
pub trait Injector {
    /// Add a key and value to the underlying data.
    fn set(&mut self, key: &str, value: String);
}

/// Extractor provides an interface for reading fields from an incoming message.
pub trait Extractor {
    /// Get a value from a key from the underlying data.
    fn get(&self, key: &str) -> Option<Cow<'_, str>>;

    /// Collect all the keys from the underlying data.
    fn keys(&self) -> Vec<Cow<'_, str>>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the HashMap.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the HashMap.
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(&key.to_lowercase())
            .map(|v| Cow::Borrowed(v.as_str()))
    }

    /// Collect all the keys from the HashMap.
    fn keys(&self) -> Vec<Cow<'_, str>> {
        self.keys()
            .map(|k| Cow::Borrowed(k.as_str()))
            .collect::<Vec<_>>()
    }
}

/// Errors raised while decoding propagated values.
///
/// These never reach instrumented code: the engine treats any of them as an
/// absent carrier. They are exposed for callers who want to know *why* a
/// header was rejected, see [`ContextCarrier::try_deserialize`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PropagationError {
    /// The header has fewer parts than the format requires.
    #[error("expected at least {expected} parts in header, found {found}")]
    MissingParts {
        /// Minimum number of parts.
        expected: usize,
        /// Number of parts present.
        found: usize,
    },

    /// A base64 encoded part could not be decoded.
    #[error("field `{0}` is not valid base64 encoded utf-8")]
    InvalidEncoding(&'static str),

    /// A numeric part could not be parsed.
    #[error("field `{0}` is not a valid number")]
    InvalidNumber(&'static str),

    /// The trace id is missing or empty.
    #[error("trace id is empty")]
    EmptyTraceId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_map_get() {
        let mut carrier = HashMap::new();
        carrier.set("SW8", "value".to_string());

        assert_eq!(
            Extractor::get(&carrier, "sw8"),
            Some(Cow::Borrowed("value")),
            "case insensitive extraction"
        );
    }

    #[test]
    fn hash_map_keys() {
        let mut carrier = HashMap::new();
        carrier.set("sw8", "a".to_string());
        carrier.set("sw8-x", "b".to_string());

        let mut keys = Extractor::keys(&carrier);
        keys.sort();
        assert_eq!(keys, vec![Cow::Borrowed("sw8"), Cow::Borrowed("sw8-x")]);
    }
}
