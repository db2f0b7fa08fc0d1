//! QA Live Monitor
//!
//! Watches a single browser-test run as it happens. A backend pipeline plans
//! the test, drives a browser through each step and evaluates the outcome,
//! publishing typed progress events on a per-test live stream. This crate
//! opens that stream, folds the events into a phase state machine and a
//! per-step status board, and manages the stream's lifecycle.
//!
//! # Architecture
//!
//! - **Stream Controller**: one connection per run trigger, settle delay,
//!   terminal close, auto-hide, teardown
//! - **Run State Reducer**: pure `(snapshot, event) -> snapshot` fold
//!
//! # Modules
//!
//! - [`events`]: Wire model of progress events
//! - [`reducer`]: Phase state machine and step inference
//! - [`controller`]: Connection lifecycle and timers
//! - [`transport`]: Stream connectors and the run API client
//! - [`sse`]: `text/event-stream` frame decoding
//! - [`view`]: Presentation model for the host
//! - [`diagnostics`]: Internal channel for absorbed failures
//! - [`config`]: Layered configuration
//! - [`telemetry`]: Tracing subscriber setup

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod reducer;
pub mod sse;
pub mod telemetry;
pub mod transport;
pub mod view;

pub use controller::{MonitorTiming, RunTrigger, StreamController};
pub use diagnostics::Diagnostic;
pub use error::{Error, Result};
pub use events::{EventKind, PlannedStep, ProgressEvent};
pub use reducer::{Phase, RunSnapshot, StepState, StepStatus, reduce};
pub use transport::{ApiClient, HttpConnector, MessageStream, StreamConnector};
pub use view::MonitorView;
