//! Server-Sent Events framing for relaying bus payloads to browsers.
//!
//! The HTTP response lives elsewhere; this module produces the text frames
//! (`event: <name>\ndata: <json>\n\n`) in the order they should be written.

use crate::events::{EventPayload, EventStream};
use crate::utils::clock::{system_clock, Clock};
use futures::Stream;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One SSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    /// Serialized JSON.
    pub data: String,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: &Value) -> Self {
        Self {
            event: event.into(),
            data: data.to_string(),
        }
    }

    pub fn from_payload(payload: &EventPayload) -> Self {
        Self::new(payload.event.clone(), &payload.data)
    }

    /// Wire form. Multi-line data is split over several `data:` lines.
    pub fn encode(&self) -> String {
        let mut out = format!("event: {}\n", self.event);
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

impl fmt::Display for SseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Turns one channel subscription into SSE frames.
///
/// Starts with a `connected` frame, then interleaves relayed events with a
/// `heartbeat` frame every [`HEARTBEAT_INTERVAL`]. Ends when the subscription
/// ends.
pub struct SseRelay {
    events: EventStream,
    heartbeat: Interval,
    clock: Arc<dyn Clock>,
    greeting: Option<Value>,
}

impl SseRelay {
    pub fn new(events: EventStream) -> Self {
        Self::with_heartbeat(events, HEARTBEAT_INTERVAL)
    }

    pub fn with_heartbeat(events: EventStream, period: Duration) -> Self {
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let greeting = json!({
            "channel": events.channel(),
            "message": "connected to event stream",
        });
        Self {
            events,
            heartbeat,
            clock: system_clock(),
            greeting: Some(greeting),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Extra fields merged into the `connected` frame (e.g. the instance id).
    pub fn with_greeting(mut self, fields: Value) -> Self {
        if let (Some(Value::Object(greeting)), Value::Object(extra)) = (self.greeting.as_mut(), fields) {
            greeting.extend(extra);
        }
        self
    }

    pub async fn next_frame(&mut self) -> Option<SseFrame> {
        if let Some(mut greeting) = self.greeting.take() {
            greeting["timestamp"] = json!(self.clock.now_ms());
            return Some(SseFrame::new("connected", &greeting));
        }
        tokio::select! {
            biased;
            payload = self.events.recv() => payload.map(|p| SseFrame::from_payload(&p)),
            _ = self.heartbeat.tick() => {
                Some(SseFrame::new("heartbeat", &json!({ "timestamp": self.clock.now_ms() })))
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = SseFrame> + Send {
        futures::stream::unfold(self, |mut relay| async move {
            relay.next_frame().await.map(|frame| (frame, relay))
        })
    }
}
