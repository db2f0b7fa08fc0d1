//! Internal diagnostic channel for failures the monitor absorbs.
//!
//! Nothing here is ever shown to the end user or changes a run's phase.
//! Diagnostics exist so that malformed payloads and dropped connections
//! stay observable in logs and tests.

use crate::events::ProgressEvent;

/// A failure the monitor recovered from locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A stream message was not a decodable event and was dropped.
    MalformedPayload { reason: String, raw: String },
    /// A `plan_complete` carried a `steps` field that is not a valid plan.
    MalformedSteps { reason: String },
    /// A type-specific field was missing or had the wrong shape.
    MalformedField { event_type: String, field: String },
    /// A `step_complete` named a step that is not on the board.
    UnknownStep { step_number: u32 },
    /// An event type the monitor does not interpret.
    UnrecognizedType { event_type: String },
    /// The transport failed before a terminal event arrived.
    TransportClosed { reason: String },
    /// The server closed the stream before a terminal event arrived.
    StreamEnded,
}

impl Diagnostic {
    pub(crate) fn malformed_field(event: &ProgressEvent, field: &str) -> Self {
        Self::MalformedField {
            event_type: event.event_type.clone(),
            field: field.to_string(),
        }
    }

    /// Emit this diagnostic to the tracing subscriber.
    pub fn trace(&self, test_id: &str) {
        match self {
            Self::TransportClosed { reason } => {
                tracing::warn!(test_id, %reason, "Live stream transport closed before a terminal event");
            }
            Self::StreamEnded => {
                tracing::warn!(test_id, "Live stream ended before a terminal event");
            }
            Self::MalformedPayload { reason, .. } => {
                tracing::debug!(test_id, %reason, "Dropped malformed stream message");
            }
            other => tracing::debug!(test_id, diagnostic = ?other, "Ignored event detail"),
        }
    }
}
