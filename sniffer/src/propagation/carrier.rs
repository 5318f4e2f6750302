//! # `sw8` carrier codec
//!
//! The `sw8` value is a single `-` separated string:
//!
//! `{sample}-{trace id}-{parent segment id}-{parent span index}-{parent service}-{parent instance}-{parent endpoint}-{address used at client}`
//!
//! Every string part is standard base64 (the alphabet never contains `-`),
//! the sample flag is `1` or `0` and the span index is a decimal number. Only
//! the sample flag and the trace id are required on extraction; missing
//! trailing parts leave the matching fields empty, which weakens linkage but
//! still joins the trace.
use super::{CorrelationContext, Extractor, Injector, PropagationError};
use crate::{SegmentId, TraceId};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Header holding the trace linkage.
pub const SW8_HEADER: &str = "sw8";
/// Header holding the [`ExtensionContext`].
pub const SW8_EXTENSION_HEADER: &str = "sw8-x";
/// Header holding the [`CorrelationContext`].
pub const SW8_CORRELATION_HEADER: &str = "sw8-correlation";

const SW8_PARTS: usize = 8;
const SW8_REQUIRED_PARTS: usize = 2;

/// Cross-process propagation token.
///
/// Filled by the engine when an exit span is created and consumed by the
/// receiving process when its entry span is created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextCarrier {
    /// Trace the sender belongs to. Required.
    pub trace_id: Option<TraceId>,
    /// Segment of the sender.
    pub parent_segment_id: Option<SegmentId>,
    /// Index of the sender's exit span within its segment.
    pub parent_span_index: Option<u32>,
    /// Whether the sender recorded this trace.
    pub sampled: bool,
    /// Service name of the sender.
    pub parent_service: String,
    /// Service instance of the sender.
    pub parent_service_instance: String,
    /// Operation name of the sender segment's first span.
    pub parent_endpoint: String,
    /// Peer address the sender used to reach this process.
    pub address_used_at_client: String,
    /// Propagated `sw8-x` values.
    pub extension: ExtensionContext,
    /// Propagated `sw8-correlation` values.
    pub correlation: CorrelationContext,
}

impl ContextCarrier {
    /// Create an empty carrier, to be filled by an exit span.
    pub fn new() -> Self {
        ContextCarrier::default()
    }

    /// A carrier is usable when it names a trace.
    pub fn is_valid(&self) -> bool {
        self.trace_id.as_ref().is_some_and(|id| !id.is_empty())
    }

    /// Whether the carrier also names the parent segment and span, so the
    /// receiver can record a cross-process reference.
    pub fn has_parent_span(&self) -> bool {
        self.is_valid()
            && self
                .parent_segment_id
                .as_ref()
                .is_some_and(|id| !id.is_empty())
            && self.parent_span_index.is_some()
    }

    /// Encodes the `sw8` value. Returns an empty string for invalid carriers.
    pub fn serialize(&self) -> String {
        let Some(trace_id) = self.trace_id.as_ref().filter(|id| !id.is_empty()) else {
            return String::new();
        };
        format!(
            "{}-{}-{}-{}-{}-{}-{}-{}",
            if self.sampled { 1 } else { 0 },
            STANDARD.encode(trace_id.as_str()),
            STANDARD.encode(self.parent_segment_id.as_ref().map_or("", |id| id.as_str())),
            self.parent_span_index
                .map(|index| index.to_string())
                .unwrap_or_default(),
            STANDARD.encode(&self.parent_service),
            STANDARD.encode(&self.parent_service_instance),
            STANDARD.encode(&self.parent_endpoint),
            STANDARD.encode(&self.address_used_at_client),
        )
    }

    /// Decodes a `sw8` value, reporting why it was rejected.
    pub fn try_deserialize(value: &str) -> Result<Self, PropagationError> {
        let parts = value.trim().splitn(SW8_PARTS, '-').collect::<Vec<_>>();
        if parts.len() < SW8_REQUIRED_PARTS {
            return Err(PropagationError::MissingParts {
                expected: SW8_REQUIRED_PARTS,
                found: parts.len(),
            });
        }

        let sampled = match parts[0] {
            "1" => true,
            "0" => false,
            _ => return Err(PropagationError::InvalidNumber("sample")),
        };
        let trace_id = decode(parts[1], "trace id")?;
        if trace_id.is_empty() {
            return Err(PropagationError::EmptyTraceId);
        }

        let part = |i: usize, field: &'static str| match parts.get(i) {
            Some(p) => decode(p, field),
            None => Ok(String::new()),
        };
        let parent_segment_id = part(2, "parent segment id")?;
        let parent_span_index = match parts.get(3).copied().filter(|p| !p.is_empty()) {
            Some(index) => Some(
                index
                    .parse::<u32>()
                    .map_err(|_| PropagationError::InvalidNumber("parent span index"))?,
            ),
            None => None,
        };

        Ok(ContextCarrier {
            trace_id: Some(TraceId::from(trace_id)),
            parent_segment_id: (!parent_segment_id.is_empty())
                .then(|| SegmentId::from(parent_segment_id)),
            parent_span_index,
            sampled,
            parent_service: part(4, "parent service")?,
            parent_service_instance: part(5, "parent service instance")?,
            parent_endpoint: part(6, "parent endpoint")?,
            address_used_at_client: part(7, "address used at client")?,
            extension: ExtensionContext::default(),
            correlation: CorrelationContext::default(),
        })
    }

    /// Decodes a `sw8` value. Malformed input yields an empty, invalid
    /// carrier.
    pub fn deserialize(value: &str) -> Self {
        ContextCarrier::try_deserialize(value).unwrap_or_default()
    }

    /// Writes `sw8`, `sw8-x` and, when non-empty, `sw8-correlation`.
    /// Invalid carriers write nothing.
    pub fn inject(&self, injector: &mut dyn Injector) {
        if !self.is_valid() {
            return;
        }
        injector.set(SW8_HEADER, self.serialize());
        injector.set(SW8_EXTENSION_HEADER, self.extension.serialize());
        if !self.correlation.is_empty() {
            injector.set(SW8_CORRELATION_HEADER, self.correlation.serialize());
        }
    }

    /// Reads a carrier from an incoming message.
    ///
    /// Returns `None` when `sw8` is absent or malformed; the caller then
    /// starts a new trace. Extension and correlation values are read
    /// leniently and never invalidate the carrier.
    pub fn extract(extractor: &dyn Extractor) -> Option<Self> {
        let header = extractor.get(SW8_HEADER)?;
        let mut carrier = ContextCarrier::try_deserialize(&header).ok()?;
        if let Some(extension) = extractor.get(SW8_EXTENSION_HEADER) {
            carrier.extension = ExtensionContext::deserialize(&extension);
        }
        if let Some(correlation) = extractor.get(SW8_CORRELATION_HEADER) {
            carrier.correlation = CorrelationContext::deserialize(&correlation);
        }
        Some(carrier)
    }
}

fn decode(part: &str, field: &'static str) -> Result<String, PropagationError> {
    STANDARD
        .decode(part)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(PropagationError::InvalidEncoding(field))
}

/// Values carried under `sw8-x`: `{skip analysis}-{send timestamp ms}`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtensionContext {
    /// The backend should not analyze the receiving segment.
    pub skip_analysis: bool,
    /// Wall clock time, in unix milliseconds, at which the sender injected
    /// the carrier.
    pub send_timestamp: Option<u64>,
}

impl ExtensionContext {
    /// Encodes the `sw8-x` value.
    pub fn serialize(&self) -> String {
        format!(
            "{}-{}",
            if self.skip_analysis { 1 } else { 0 },
            self.send_timestamp
                .map(|ts| ts.to_string())
                .unwrap_or_default()
        )
    }

    /// Decodes a `sw8-x` value, ignoring parts it does not understand.
    pub fn deserialize(value: &str) -> Self {
        let mut parts = value.trim().split('-');
        ExtensionContext {
            skip_analysis: parts.next() == Some("1"),
            send_timestamp: parts.next().and_then(|ts| ts.parse().ok()),
        }
    }

    /// Milliseconds between injection and `now_millis`, when known.
    pub fn transmission_latency(&self, now_millis: u64) -> Option<u64> {
        self.send_timestamp
            .filter(|sent| *sent <= now_millis)
            .map(|sent| now_millis - sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn full_carrier() -> ContextCarrier {
        ContextCarrier {
            trace_id: Some(TraceId::from("trace-1")),
            parent_segment_id: Some(SegmentId::from("segment-1")),
            parent_span_index: Some(3),
            sampled: true,
            parent_service: "checkout".into(),
            parent_service_instance: "checkout-7f9c@10.0.0.4".into(),
            parent_endpoint: "GET /cart".into(),
            address_used_at_client: "inventory:8080".into(),
            extension: ExtensionContext::default(),
            correlation: CorrelationContext::default(),
        }
    }

    #[test]
    fn serialize_encodes_every_part() {
        assert_eq!(
            full_carrier().serialize(),
            "1-dHJhY2UtMQ==-c2VnbWVudC0x-3-Y2hlY2tvdXQ=-Y2hlY2tvdXQtN2Y5Y0AxMC4wLjAuNA==-R0VUIC9jYXJ0-aW52ZW50b3J5OjgwODA="
        );
    }

    #[test]
    fn deserialize_restores_linkage() {
        let carrier = full_carrier();
        let decoded = ContextCarrier::deserialize(&carrier.serialize());
        assert_eq!(decoded, carrier);
        assert!(decoded.has_parent_span());
    }

    #[test]
    fn trace_id_only_is_valid_without_parent_span() {
        let carrier = ContextCarrier::deserialize("0-dHJhY2UtMQ==");
        assert!(carrier.is_valid());
        assert!(!carrier.sampled);
        assert!(!carrier.has_parent_span());
        assert_eq!(carrier.trace_id, Some(TraceId::from("trace-1")));
    }

    #[rustfmt::skip]
    #[rstest]
    #[case("",                                   "empty header")]
    #[case("1",                                  "missing trace id")]
    #[case("1--c2VnbWVudC0x-3",                  "empty trace id")]
    #[case("x-dHJhY2UtMQ==-c2VnbWVudC0x-3",      "bogus sample flag")]
    #[case("1-@@@-c2VnbWVudC0x-3",               "trace id not base64")]
    #[case("1-dHJhY2UtMQ==-c2VnbWVudC0x-three",  "span index not numeric")]
    #[case("1-dHJhY2UtMQ==-c2VnbWVudC0x--1",     "negative span index")]
    fn malformed_headers_degrade_to_empty(#[case] header: &str, #[case] reason: &str) {
        let carrier = ContextCarrier::deserialize(header);
        assert!(!carrier.is_valid(), "{reason}");
        assert_eq!(carrier, ContextCarrier::default(), "{reason}");
    }

    #[test]
    fn invalid_carrier_serializes_and_injects_nothing() {
        let carrier = ContextCarrier::new();
        assert_eq!(carrier.serialize(), "");

        let mut headers = HashMap::new();
        carrier.inject(&mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn inject_then_extract_through_headers() {
        let mut carrier = full_carrier();
        carrier.extension.send_timestamp = Some(1_700_000_000_000);
        carrier.correlation.put("tenant", "acme");

        let mut headers = HashMap::new();
        carrier.inject(&mut headers);
        headers.insert("x-unrelated".to_string(), "ignored".to_string());

        let extracted = ContextCarrier::extract(&headers).expect("valid carrier");
        assert_eq!(extracted, carrier);
    }

    #[test]
    fn extract_without_sw8_is_none() {
        let mut headers = HashMap::new();
        headers.insert("sw8-x".to_string(), "1-".to_string());
        assert!(ContextCarrier::extract(&headers).is_none());

        headers.insert("sw8".to_string(), "garbage".to_string());
        assert!(ContextCarrier::extract(&headers).is_none());
    }

    #[test]
    fn extension_is_lenient() {
        let ext = ExtensionContext::deserialize("1-1700000000000-future-field");
        assert!(ext.skip_analysis);
        assert_eq!(ext.send_timestamp, Some(1_700_000_000_000));
        assert_eq!(ext.transmission_latency(1_700_000_000_250), Some(250));
        assert_eq!(ext.transmission_latency(1_600_000_000_000), None);

        let ext = ExtensionContext::deserialize("nonsense");
        assert_eq!(ext, ExtensionContext::default());
        assert_eq!(ext.serialize(), "0-");
    }

    #[test]
    fn try_deserialize_reports_reason() {
        assert_eq!(
            ContextCarrier::try_deserialize("1"),
            Err(PropagationError::MissingParts {
                expected: 2,
                found: 1
            })
        );
        assert_eq!(
            ContextCarrier::try_deserialize("1-"),
            Err(PropagationError::EmptyTraceId)
        );
    }
}
