#[cfg(test)]
mod tests;

use std::{sync::Arc, time::Duration};

use serde_json::Value;

use crate::{
    session::{LongPollSession, parse_cursor},
    transport::{HttpTransport, TransportError},
};

/// The only event kind the bot consumes; anything else is dropped.
pub const MESSAGE_NEW: &str = "message_new";

/// An event as received from the long-poll server, before projection.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// The `type` field, e.g. `message_new`.
    pub kind: String,
    /// The event's `object`.
    pub payload: Value,
}

/// The classified result of one long-poll exchange.
#[derive(Debug)]
pub enum PollOutcome {
    /// New cursor and the recognised events delivered with it.
    Continue {
        /// Cursor for the next poll.
        ts: u64,
        /// Events in arrival order.
        events: Vec<RawEvent>,
    },
    /// The cursor is stale; key and server are still valid.
    SoftExpired {
        /// Cursor VK asks to continue from.
        ts: u64,
    },
    /// Key or server are no longer valid and the session must be
    /// re-acquired.
    HardExpired,
    /// The request failed or the body could not be understood. The session
    /// is left as it was.
    TransportError(TransportError),
}

/// Issues a single long-poll request per call and classifies the response.
/// Retries are left to the caller.
#[derive(Clone)]
pub struct LongPollClient {
    transport: Arc<dyn HttpTransport>,
    // Long-poll hold time in seconds, sent as `wait`.
    wait: u64,
    // Outer bound on the whole exchange.
    request_timeout: Duration,
}

impl LongPollClient {
    /// Creates a client holding each poll for `wait` seconds, giving up on
    /// the exchange after `request_timeout`.
    pub fn new(transport: Arc<dyn HttpTransport>, wait: u64, request_timeout: Duration) -> Self {
        Self { transport, wait, request_timeout }
    }

    /// Polls `session` once.
    pub async fn poll(&self, session: &LongPollSession) -> PollOutcome {
        let params = vec![
            ("act".to_string(), "a_check".to_string()),
            ("key".to_string(), session.key().to_string()),
            ("ts".to_string(), session.ts().to_string()),
            ("wait".to_string(), self.wait.to_string()),
        ];

        tracing::debug!("Polling {} at ts {}", session.server(), session.ts());
        let request = self.transport.get_json(session.server(), &params);
        let body = match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return PollOutcome::TransportError(e),
            Err(_) => {
                return PollOutcome::TransportError(TransportError::Timeout(
                    self.request_timeout,
                ));
            }
        };

        Self::classify(body, session.ts())
    }

    fn classify(mut body: Value, current_ts: u64) -> PollOutcome {
        if let Some(failed) = body.get("failed") {
            return match failed.as_i64() {
                Some(1) => {
                    let ts = body.get("ts").and_then(parse_cursor).unwrap_or(current_ts);
                    PollOutcome::SoftExpired { ts }
                }
                _ => PollOutcome::HardExpired,
            };
        }

        let Some(ts) = body.get("ts").and_then(parse_cursor) else {
            return PollOutcome::TransportError(TransportError::Decode(format!(
                "missing or invalid ts in {body}"
            )));
        };

        let updates = match body.get_mut("updates").map(Value::take) {
            Some(Value::Array(updates)) => updates,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return PollOutcome::TransportError(TransportError::Decode(format!(
                    "updates is not an array: {other}"
                )));
            }
        };

        let events = updates.into_iter().filter_map(Self::decode_event).collect();

        PollOutcome::Continue { ts, events }
    }

    fn decode_event(mut update: Value) -> Option<RawEvent> {
        let kind = update.get("type").and_then(Value::as_str)?;
        if kind != MESSAGE_NEW {
            tracing::debug!("Dropping update of unsupported type {kind}");
            return None;
        }
        let kind = kind.to_string();
        let payload = update.get_mut("object").map(Value::take).unwrap_or(Value::Null);
        Some(RawEvent { kind, payload })
    }
}
