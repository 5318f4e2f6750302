/*
    Injects a fully populated sw8 carrier into a header map and extracts it
    back on every iteration, with a correlation entry so the sw8-correlation
    header is exercised too.
*/

use sniffer::propagation::ContextCarrier;
use sniffer::{SegmentId, TraceId};
use std::collections::HashMap;

mod throughput;

fn main() {
    throughput::test_throughput(test_round_trip);
}

fn test_round_trip(worker: usize) {
    let mut carrier = ContextCarrier::new();
    carrier.trace_id = Some(TraceId::from("a1b2c3d4e5f6.1.16000000000000001"));
    carrier.parent_segment_id = Some(SegmentId::from("a1b2c3d4e5f6.1.16000000000000002"));
    carrier.parent_span_index = Some(worker as u32);
    carrier.sampled = true;
    carrier.parent_service = "stress".to_string();
    carrier.parent_service_instance = "stress-1".to_string();
    carrier.parent_endpoint = "GET /stress".to_string();
    carrier.address_used_at_client = "stress:8080".to_string();
    carrier.correlation.put("tenant", "blue");

    let mut headers: HashMap<String, String> = HashMap::with_capacity(3);
    carrier.inject(&mut headers);
    let extracted = ContextCarrier::extract(&headers);
    debug_assert!(extracted.is_some_and(|carrier| carrier.is_valid()));
}
