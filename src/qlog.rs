//! qlog event hook: collects transport events and renders them in the
//! qlog draft-00 trace shape. Writing the JSON to disk is the caller's
//! business.

use serde_json::{json, Value};

use crate::packet::{
    PACKET_TYPE_HANDSHAKE, PACKET_TYPE_INITIAL, PACKET_TYPE_MASK, PACKET_TYPE_RETRY,
    PACKET_TYPE_ZERO_RTT,
};

/// Human-readable packet type for qlog output.
pub fn packet_type_name(packet_type: u8) -> &'static str {
    match packet_type & PACKET_TYPE_MASK {
        t if t == PACKET_TYPE_INITIAL & PACKET_TYPE_MASK => "INITIAL",
        t if t == PACKET_TYPE_HANDSHAKE & PACKET_TYPE_MASK => "HANDSHAKE",
        t if t == PACKET_TYPE_ZERO_RTT & PACKET_TYPE_MASK => "0RTT",
        t if t == PACKET_TYPE_RETRY & PACKET_TYPE_MASK => "RETRY",
        _ => "1RTT",
    }
}

/// An in-memory qlog trace.
#[derive(Default)]
pub struct QlogTrace {
    events: Vec<(f64, &'static str, &'static str, Value)>,
}

impl QlogTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_event(&mut self, now: f64, category: &'static str, event: &'static str, data: Value) {
        self.events.push((now, category, event, data));
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The trace as a qlog draft-00 document.
    pub fn to_json(&self) -> Value {
        let mut traces = Vec::new();
        if let Some(&(reference_time, _, _, _)) = self.events.first() {
            let events: Vec<Value> = self
                .events
                .iter()
                .map(|(time, category, event, data)| {
                    json!([
                        format!("{}", ((time - reference_time) * 1000.0) as u64),
                        category.to_uppercase(),
                        event.to_uppercase(),
                        data,
                    ])
                })
                .collect();
            traces.push(json!({
                "common_fields": {
                    "reference_time": format!("{}", (reference_time * 1000.0) as u64),
                },
                "event_fields": ["relative_time", "CATEGORY", "EVENT_TYPE", "DATA"],
                "events": events,
            }));
        }
        json!({
            "qlog_version": "draft-00",
            "traces": traces,
        })
    }
}
