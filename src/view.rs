//! Read-only presentation model derived from a run snapshot.

use std::fmt;

use chrono::{Local, TimeZone};
use serde::Serialize;

use crate::controller::RunTrigger;
use crate::events::EventKind;
use crate::reducer::{Phase, RunSnapshot};

/// What the host view renders: the current snapshot plus visibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorView {
    /// Trigger of the run this snapshot belongs to.
    pub trigger: RunTrigger,
    pub snapshot: RunSnapshot,
    pub visible: bool,
}

/// State of one stage badge in the phase indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeState {
    Pending,
    Active,
    Done,
    Failed,
}

/// The three pipeline stages shown in the phase indicator.
pub const STAGES: [Phase; 3] = [Phase::Planning, Phase::Browsing, Phase::Evaluating];

/// Stage badges for a snapshot, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseIndicator {
    pub badges: [(Phase, BadgeState); 3],
}

impl PhaseIndicator {
    pub fn for_snapshot(snapshot: &RunSnapshot) -> Self {
        let badges = match snapshot.phase {
            Phase::Complete => STAGES.map(|stage| (stage, BadgeState::Done)),
            Phase::Error => {
                let failed_at = match stage_reached(snapshot) {
                    Phase::Idle => Phase::Planning,
                    reached => reached,
                };
                STAGES.map(|stage| (stage, relative(stage, failed_at, BadgeState::Failed)))
            }
            current => STAGES.map(|stage| (stage, relative(stage, current, BadgeState::Active))),
        };
        Self { badges }
    }
}

fn relative(stage: Phase, current: Phase, at_current: BadgeState) -> BadgeState {
    if stage.rank() < current.rank() {
        BadgeState::Done
    } else if stage == current {
        at_current
    } else {
        BadgeState::Pending
    }
}

/// Furthest stage the run reached before its `error` event.
fn stage_reached(snapshot: &RunSnapshot) -> Phase {
    snapshot
        .events
        .iter()
        .map(|e| e.kind())
        .take_while(|kind| *kind != EventKind::Error)
        .filter_map(Phase::implied_by)
        .fold(Phase::Idle, Phase::advance)
}

/// One rendered entry of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub clock: String,
    pub message: String,
    pub is_error: bool,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {}", self.clock, self.message)
    }
}

impl MonitorView {
    /// The run is in flight: past idle, not yet terminal.
    pub fn is_busy(&self) -> bool {
        let phase = self.snapshot.phase;
        phase != Phase::Idle && !phase.is_terminal()
    }

    /// Browsing has started but no preview URL has arrived.
    pub fn awaiting_preview(&self) -> bool {
        self.snapshot.phase == Phase::Browsing && self.snapshot.streaming_url.is_none()
    }

    /// Pass/fail verdict, only once the run completed.
    pub fn verdict(&self) -> Option<bool> {
        match self.snapshot.phase {
            Phase::Complete => self.snapshot.final_result,
            _ => None,
        }
    }

    pub fn phase_indicator(&self) -> PhaseIndicator {
        PhaseIndicator::for_snapshot(&self.snapshot)
    }

    /// Event log rendered with local clock times.
    pub fn log_lines(&self) -> Vec<LogLine> {
        self.log_lines_in(&Local)
    }

    pub fn log_lines_in<Tz>(&self, tz: &Tz) -> Vec<LogLine>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        self.snapshot
            .events
            .iter()
            .map(|e| LogLine {
                clock: e.clock_time_in(tz),
                message: e.message.clone(),
                is_error: e.kind() == EventKind::Error,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProgressEvent;
    use crate::reducer::reduce;
    use chrono::Utc;

    fn view_after(types: &[&str]) -> MonitorView {
        let snapshot = types.iter().fold(RunSnapshot::default(), |s, t| {
            reduce(s, ProgressEvent::new(*t, format!("{t} happened"), "2025-01-01T08:30:00Z"))
        });
        MonitorView {
            trigger: RunTrigger::new(1),
            snapshot,
            visible: true,
        }
    }

    fn states(view: &MonitorView) -> Vec<BadgeState> {
        view.phase_indicator().badges.iter().map(|(_, s)| *s).collect()
    }

    #[test]
    fn test_indicator_while_browsing() {
        let view = view_after(&["plan_start", "plan_complete"]);
        assert_eq!(
            states(&view),
            vec![BadgeState::Done, BadgeState::Active, BadgeState::Pending]
        );
        assert!(view.is_busy());
        assert!(view.awaiting_preview());
    }

    #[test]
    fn test_indicator_complete() {
        let view = view_after(&["plan_start", "eval_complete"]);
        assert_eq!(states(&view), vec![BadgeState::Done; 3]);
        assert!(!view.is_busy());
    }

    #[test]
    fn test_indicator_error_marks_stage_reached() {
        let view = view_after(&["plan_start", "plan_complete", "error", "eval_start"]);
        assert_eq!(
            states(&view),
            vec![BadgeState::Done, BadgeState::Failed, BadgeState::Pending]
        );
        assert_eq!(view.verdict(), None);
    }

    #[test]
    fn test_indicator_error_before_planning() {
        let view = view_after(&["error"]);
        assert_eq!(
            states(&view),
            vec![BadgeState::Failed, BadgeState::Pending, BadgeState::Pending]
        );
    }

    #[test]
    fn test_log_lines() {
        let view = view_after(&["plan_start", "error"]);
        let lines = view.log_lines_in(&Utc);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].to_string(), "08:30:00  plan_start happened");
        assert!(!lines[0].is_error);
        assert!(lines[1].is_error);
    }
}
