//! Sync state tracking for status reporting.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the manager is in a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// No sync running.
    #[default]
    Idle,
    /// Asking central for a session.
    Negotiating,
    Pushing,
    Pulling,
    /// Applying staged changes and advancing cursors.
    Committing,
    /// A run failed and is cleaning up.
    Errored,
}

impl SyncPhase {
    /// Whether a run is in progress.
    pub fn is_running(self) -> bool {
        self != Self::Idle
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Pushing => "pushing",
            Self::Pulling => "pulling",
            Self::Committing => "committing",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Summary of the most recent finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastRun {
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Records pushed, zero when the run failed before pushing.
    pub pushed: usize,
    pub pulled: u64,
    /// Records written to model tables by the apply step.
    pub saved: usize,
    /// Central answered with a queue position instead of a session.
    pub queued: bool,
    pub error: Option<String>,
}

impl LastRun {
    /// Whether the run finished without error.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Live state of one sync manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub phase: SyncPhase,
    pub last_run: Option<LastRun>,
    /// Runs started since the manager was created, queued ones included.
    pub runs: u64,
    pub failures: u64,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `phase`.
    pub fn enter(&mut self, phase: SyncPhase) {
        self.phase = phase;
    }

    /// Record a finished run and return to idle.
    pub fn finish(&mut self, run: LastRun) {
        if !run.succeeded() {
            self.failures += 1;
        }
        self.last_run = Some(run);
        self.phase = SyncPhase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(error: Option<&str>) -> LastRun {
        LastRun {
            completed_at: Utc::now(),
            duration_ms: 12,
            pushed: 1,
            pulled: 2,
            saved: 2,
            queued: false,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_finish_returns_to_idle() {
        let mut state = SyncState::new();
        state.enter(SyncPhase::Pushing);
        assert!(state.phase.is_running());

        state.finish(run(None));
        assert_eq!(state.phase, SyncPhase::Idle);
        assert_eq!(state.failures, 0);
        assert!(state.last_run.as_ref().unwrap().succeeded());
    }

    #[test]
    fn test_failures_are_counted() {
        let mut state = SyncState::new();
        state.enter(SyncPhase::Errored);
        state.finish(run(Some("central unavailable")));
        assert_eq!(state.failures, 1);
        assert!(!state.last_run.unwrap().succeeded());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(SyncPhase::Committing.to_string(), "committing");
        assert_eq!(
            serde_json::to_string(&SyncPhase::Negotiating).unwrap(),
            "\"negotiating\""
        );
    }
}
