//! Run state reducer.
//!
//! Folds [`ProgressEvent`]s into a [`RunSnapshot`]: the coarse [`Phase`] of
//! the pipeline, a per-step status board, the append-only event log, the
//! latest browser preview URL and the final verdict.
//!
//! The reducer knows nothing about transport. It is total: unknown event
//! types and malformed fields only ever reach the log.
//!
//! # Phase transitions
//!
//! Phases only move forward along
//! `Idle -> Planning -> Browsing -> Evaluating -> Complete`. `Error` can be
//! entered from any non-terminal phase. Once `Complete` or `Error` is
//! reached the phase never changes again.
//!
//! # Step inference
//!
//! The producer never announces that a step started, so the board infers it:
//! `browser_start` marks the first step running, and every `step_complete`
//! promotes the following step (by number) from pending to running. This
//! assumes strictly sequential, gap-free execution on the producer side.

use serde::Serialize;

use crate::diagnostics::Diagnostic;
use crate::events::{EventKind, PlannedStep, ProgressEvent, Signal};

/// Coarse pipeline stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Planning,
    Browsing,
    Evaluating,
    Complete,
    Error,
}

impl Phase {
    /// Whether no further event may change this phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Position on the linear progress path. `Error` sorts after everything.
    pub fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Planning => 1,
            Self::Browsing => 2,
            Self::Evaluating => 3,
            Self::Complete => 4,
            Self::Error => 5,
        }
    }

    /// The phase after an event implying `target`.
    ///
    /// Backward moves are ignored, `Error` overrides any non-terminal phase,
    /// and terminal phases absorb everything.
    #[must_use]
    pub fn advance(self, target: Self) -> Self {
        if self.is_terminal() {
            return self;
        }
        match target {
            Self::Error => Self::Error,
            _ if target.rank() > self.rank() => target,
            _ => self,
        }
    }

    /// The phase an event of `kind` moves towards, if it moves any.
    pub fn implied_by(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::PlanStart => Some(Self::Planning),
            EventKind::PlanComplete => Some(Self::Browsing),
            EventKind::EvalStart => Some(Self::Evaluating),
            EventKind::EvalComplete => Some(Self::Complete),
            EventKind::Error => Some(Self::Error),
            EventKind::BrowserStart
            | EventKind::BrowserPreview
            | EventKind::StepComplete
            | EventKind::Other => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Browsing => "browsing",
            Self::Evaluating => "evaluating",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a single planned step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
}

/// A planned step together with its inferred state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepStatus {
    pub step_number: u32,
    pub description: String,
    pub state: StepState,
}

impl From<PlannedStep> for StepStatus {
    fn from(step: PlannedStep) -> Self {
        Self {
            step_number: step.step_number,
            description: step.description,
            state: StepState::Pending,
        }
    }
}

/// Everything the monitor knows about the current run.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RunSnapshot {
    pub phase: Phase,
    /// Ascending by step number, unique per number.
    pub steps: Vec<StepStatus>,
    /// Every decoded event, in arrival order.
    pub events: Vec<ProgressEvent>,
    pub streaming_url: Option<String>,
    /// Set only when the run reached `Complete`.
    pub final_result: Option<bool>,
}

/// Outcome of folding one raw stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folded {
    pub kind: EventKind,
    /// Anomaly absorbed while interpreting the event, if any.
    pub diagnostic: Option<Diagnostic>,
}

/// Fold `event` into `snapshot`.
#[must_use]
pub fn reduce(mut snapshot: RunSnapshot, event: ProgressEvent) -> RunSnapshot {
    snapshot.apply(event);
    snapshot
}

impl RunSnapshot {
    /// Decode a raw stream message and fold it.
    ///
    /// A message that does not decode leaves the snapshot untouched, the log
    /// included, and comes back as the error.
    pub fn ingest(&mut self, raw: &str) -> Result<Folded, Diagnostic> {
        let event = ProgressEvent::decode(raw).map_err(|e| Diagnostic::MalformedPayload {
            reason: e.to_string(),
            raw: raw.to_string(),
        })?;
        let kind = event.kind();
        let diagnostic = self.apply(event);
        Ok(Folded { kind, diagnostic })
    }

    /// Fold a decoded event, returning the anomaly it carried, if any.
    pub fn apply(&mut self, event: ProgressEvent) -> Option<Diagnostic> {
        let (signal, mut diagnostic) = Signal::interpret(&event);
        let before = self.phase;
        if let Some(target) = Phase::implied_by(event.kind()) {
            self.phase = before.advance(target);
        }
        self.events.push(event);

        match signal {
            Signal::PlanComplete { steps: Some(steps) } => {
                if !before.is_terminal() && before.rank() <= Phase::Browsing.rank() {
                    self.steps = step_board(steps);
                }
            }
            Signal::BrowserStart => {
                if let Some(first) = self.steps.first_mut() {
                    if first.state == StepState::Pending {
                        first.state = StepState::Running;
                    }
                }
            }
            Signal::BrowserPreview {
                streaming_url: Some(url),
            } => self.streaming_url = Some(url),
            Signal::StepComplete {
                step_number: Some(step_number),
                passed,
            } => {
                if !self.complete_step(step_number, passed) {
                    diagnostic = diagnostic.or(Some(Diagnostic::UnknownStep { step_number }));
                }
            }
            Signal::EvalComplete { passed } => {
                if before != Phase::Complete && self.phase == Phase::Complete {
                    self.final_result = Some(passed);
                }
            }
            _ => {}
        }

        diagnostic
    }

    /// Mark `step_number` passed/failed and promote its successor.
    ///
    /// Returns whether the step was on the board.
    fn complete_step(&mut self, step_number: u32, passed: bool) -> bool {
        let mut found = false;
        for step in &mut self.steps {
            if step.step_number == step_number {
                step.state = if passed {
                    StepState::Passed
                } else {
                    StepState::Failed
                };
                found = true;
            } else if Some(step.step_number) == step_number.checked_add(1)
                && step.state == StepState::Pending
            {
                step.state = StepState::Running;
            }
        }
        found
    }
}

fn step_board(mut steps: Vec<PlannedStep>) -> Vec<StepStatus> {
    steps.sort_by_key(|s| s.step_number);
    steps.dedup_by_key(|s| s.step_number);
    steps.into_iter().map(StepStatus::from).collect()
}
