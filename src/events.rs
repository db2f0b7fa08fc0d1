//! Progress events received over a run's live stream.
//!
//! The producer writes every event as a flat JSON object with a `type`, a
//! human-readable `message`, an ISO-8601 `timestamp`, and a handful of
//! type-specific extras. All extras are stringified on the producer side,
//! so booleans arrive as `"True"`/`"False"` and step numbers as `"3"`.
//!
//! [`ProgressEvent`] keeps the payload verbatim for the event log, while
//! [`Signal`] is the typed reading of it that the reducer folds.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::diagnostics::Diagnostic;
use crate::error::{Error, Result};

/// Rendered in place of a timestamp that cannot be parsed.
pub const UNKNOWN_CLOCK: &str = "??:??:??";

/// A single event from the live stream, kept exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Wire event type (`plan_start`, `step_complete`, ...).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Human-readable text for the log.
    #[serde(default, deserialize_with = "loose_text")]
    pub message: String,
    /// Origin-assigned ISO-8601 timestamp. Display only, never used for ordering.
    #[serde(default, deserialize_with = "loose_text")]
    pub timestamp: String,
    /// Type-specific extras and any fields this crate does not know about.
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl ProgressEvent {
    /// Create an event with no extra fields.
    pub fn new(
        event_type: impl Into<String>,
        message: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            message: message.into(),
            timestamp: timestamp.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Attach a type-specific field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Decode one stream payload.
    ///
    /// Only `type` is required. Anything that is not a JSON object carrying a
    /// string `type` is rejected.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::MalformedEvent(e.to_string()))
    }

    /// The recognised kind of this event.
    pub fn kind(&self) -> EventKind {
        EventKind::from_wire(&self.event_type)
    }

    /// A string-valued extra field.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// The `step_number` extra, stringified or numeric.
    pub fn step_number(&self) -> Option<u32> {
        match self.fields.get("step_number")? {
            Value::String(s) => s.trim().parse().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        }
    }

    /// The `passed` extra, read through [`parse_wire_bool`].
    pub fn passed(&self) -> bool {
        parse_wire_bool(self.fields.get("passed"))
    }

    /// Timestamp rendered as a 24-hour `HH:MM:SS` clock in the local zone.
    pub fn clock_time(&self) -> String {
        self.clock_time_in(&Local)
    }

    /// Timestamp rendered as a 24-hour `HH:MM:SS` clock in `tz`.
    ///
    /// Timestamps without an offset are shown as written. Anything
    /// unparseable renders as [`UNKNOWN_CLOCK`].
    pub fn clock_time_in<Tz>(&self, tz: &Tz) -> String
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let ts = self.timestamp.trim();
        if let Ok(at) = DateTime::parse_from_rfc3339(ts) {
            return at.with_timezone(tz).format("%H:%M:%S").to_string();
        }
        NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").map_or_else(
            |_| UNKNOWN_CLOCK.to_string(),
            |at| at.format("%H:%M:%S").to_string(),
        )
    }
}

/// Read any JSON value as display text: `null` is empty, strings are taken
/// as-is, and everything else is rendered as JSON.
fn loose_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Event types the monitor knows how to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PlanStart,
    PlanComplete,
    BrowserStart,
    BrowserPreview,
    StepComplete,
    EvalStart,
    EvalComplete,
    Error,
    /// Any other type. Logged, otherwise ignored.
    Other,
}

impl EventKind {
    /// Map a wire `type` string to its kind.
    pub fn from_wire(event_type: &str) -> Self {
        match event_type {
            "plan_start" => Self::PlanStart,
            "plan_complete" => Self::PlanComplete,
            "browser_start" => Self::BrowserStart,
            "browser_preview" => Self::BrowserPreview,
            "step_complete" => Self::StepComplete,
            "eval_start" => Self::EvalStart,
            "eval_complete" => Self::EvalComplete,
            "error" => Self::Error,
            _ => Self::Other,
        }
    }

    /// Whether this kind ends the stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::EvalComplete | Self::Error)
    }
}

/// A planned browser step, as announced by `plan_complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub step_number: u32,
    pub description: String,
}

/// Decode the JSON-array-string carried in a `plan_complete` event's `steps`.
pub fn decode_plan(raw: &str) -> Result<Vec<PlannedStep>> {
    let steps: Vec<PlannedStep> = serde_json::from_str(raw)?;
    if let Some(bad) = steps.iter().find(|s| s.step_number == 0) {
        return Err(Error::MalformedEvent(format!(
            "step numbers start at 1, got {} for {:?}",
            bad.step_number, bad.description
        )));
    }
    Ok(steps)
}

/// Read one of the producer's stringly-typed booleans.
///
/// The producer stringifies Python booleans, so `"True"` is what normally
/// arrives; `"true"` is accepted as well. A real JSON boolean is taken at
/// face value. Every other value, including other spellings and a missing
/// field, is `false`.
pub fn parse_wire_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => s == "true" || s == "True",
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

/// Typed interpretation of a [`ProgressEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    PlanStart,
    /// `steps` is `None` when the field was missing or malformed.
    PlanComplete { steps: Option<Vec<PlannedStep>> },
    BrowserStart,
    BrowserPreview { streaming_url: Option<String> },
    StepComplete { step_number: Option<u32>, passed: bool },
    EvalStart,
    EvalComplete { passed: bool },
    Error,
    Unrecognized,
}

impl Signal {
    /// Interpret an event. Never fails: a malformed type-specific field
    /// leaves an empty payload and is reported as a diagnostic.
    pub fn interpret(event: &ProgressEvent) -> (Self, Option<Diagnostic>) {
        match event.kind() {
            EventKind::PlanStart => (Self::PlanStart, None),
            EventKind::PlanComplete => match event.text("steps") {
                Some(raw) => match decode_plan(raw) {
                    Ok(steps) => (Self::PlanComplete { steps: Some(steps) }, None),
                    Err(e) => (
                        Self::PlanComplete { steps: None },
                        Some(Diagnostic::MalformedSteps {
                            reason: e.to_string(),
                        }),
                    ),
                },
                None => (
                    Self::PlanComplete { steps: None },
                    Some(Diagnostic::malformed_field(event, "steps")),
                ),
            },
            EventKind::BrowserStart => (Self::BrowserStart, None),
            EventKind::BrowserPreview => {
                let streaming_url = event
                    .text("streaming_url")
                    .filter(|url| !url.is_empty())
                    .map(ToString::to_string);
                let diag = streaming_url
                    .is_none()
                    .then(|| Diagnostic::malformed_field(event, "streaming_url"));
                (Self::BrowserPreview { streaming_url }, diag)
            }
            EventKind::StepComplete => {
                let step_number = event.step_number();
                let diag = step_number
                    .is_none()
                    .then(|| Diagnostic::malformed_field(event, "step_number"));
                let passed = event.passed();
                (
                    Self::StepComplete {
                        step_number,
                        passed,
                    },
                    diag,
                )
            }
            EventKind::EvalStart => (Self::EvalStart, None),
            EventKind::EvalComplete => (
                Self::EvalComplete {
                    passed: event.passed(),
                },
                None,
            ),
            EventKind::Error => (Self::Error, None),
            EventKind::Other => (
                Self::Unrecognized,
                Some(Diagnostic::UnrecognizedType {
                    event_type: event.event_type.clone(),
                }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_decode_keeps_unknown_fields() {
        let event = ProgressEvent::decode(
            r#"{"type":"screenshot_captured","message":"Captured","timestamp":"2025-01-01T10:00:00+00:00","label":"before"}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), EventKind::Other);
        assert_eq!(event.text("label"), Some("before"));
    }

    #[test]
    fn test_decode_rejects_non_objects_and_missing_type() {
        assert!(ProgressEvent::decode("not json").is_err());
        assert!(ProgressEvent::decode("[1,2]").is_err());
        assert!(ProgressEvent::decode(r#"{"message":"no type"}"#).is_err());
    }

    #[test]
    fn test_decode_defaults_message_and_timestamp() {
        let event = ProgressEvent::decode(r#"{"type":"eval_start"}"#).unwrap();
        assert_eq!(event.message, "");
        assert_eq!(event.timestamp, "");
    }

    #[test]
    fn test_decode_tolerates_non_string_message_and_timestamp() {
        let event =
            ProgressEvent::decode(r#"{"type":"error","message":null,"timestamp":null}"#).unwrap();
        assert_eq!(event.kind(), EventKind::Error);
        assert_eq!(event.message, "");
        assert_eq!(event.timestamp, "");

        let event = ProgressEvent::decode(
            r#"{"type":"eval_complete","message":{"detail":"x"},"timestamp":1700000000}"#,
        )
        .unwrap();
        assert_eq!(event.message, r#"{"detail":"x"}"#);
        assert_eq!(event.timestamp, "1700000000");
        assert_eq!(event.clock_time_in(&Utc), UNKNOWN_CLOCK);
    }

    #[test]
    fn test_parse_wire_bool() {
        assert!(parse_wire_bool(Some(&json!("True"))));
        assert!(parse_wire_bool(Some(&json!("true"))));
        assert!(parse_wire_bool(Some(&json!(true))));
        assert!(!parse_wire_bool(Some(&json!("TRUE"))));
        assert!(!parse_wire_bool(Some(&json!("yes"))));
        assert!(!parse_wire_bool(Some(&json!("False"))));
        assert!(!parse_wire_bool(Some(&json!(1))));
        assert!(!parse_wire_bool(None));
    }

    #[test]
    fn test_step_number_accepts_string_and_number() {
        let e = ProgressEvent::new("step_complete", "", "").with_field("step_number", "3");
        assert_eq!(e.step_number(), Some(3));
        let e = ProgressEvent::new("step_complete", "", "").with_field("step_number", 4);
        assert_eq!(e.step_number(), Some(4));
        let e = ProgressEvent::new("step_complete", "", "").with_field("step_number", "three");
        assert_eq!(e.step_number(), None);
    }

    #[test]
    fn test_decode_plan_rejects_step_zero() {
        assert!(decode_plan(r#"[{"step_number":0,"description":"x"}]"#).is_err());
        assert_eq!(
            decode_plan(r#"[{"step_number":1,"description":"Open page"}]"#)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_interpret_step_complete_without_number() {
        let e = ProgressEvent::new("step_complete", "Step ?", "").with_field("passed", "True");
        let (signal, diag) = Signal::interpret(&e);
        assert_eq!(
            signal,
            Signal::StepComplete {
                step_number: None,
                passed: true
            }
        );
        assert!(matches!(diag, Some(Diagnostic::MalformedField { .. })));
    }

    #[test]
    fn test_clock_time() {
        let e = ProgressEvent::new("plan_start", "", "2025-03-04T09:05:07.123456+00:00");
        assert_eq!(e.clock_time_in(&Utc), "09:05:07");

        let naive = ProgressEvent::new("plan_start", "", "2025-03-04T21:00:01");
        assert_eq!(naive.clock_time_in(&Utc), "21:00:01");

        let bad = ProgressEvent::new("plan_start", "", "yesterday");
        assert_eq!(bad.clock_time_in(&Utc), UNKNOWN_CLOCK);
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(EventKind::EvalComplete.is_terminal());
        assert!(EventKind::Error.is_terminal());
        assert!(!EventKind::StepComplete.is_terminal());
        assert!(!EventKind::Other.is_terminal());
    }
}
