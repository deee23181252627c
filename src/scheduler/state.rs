//! Group lifecycle state machine
//!
//! Pure transitions for one browser-instance group. The driver loop in the
//! parent module feeds events in; keeping the decisions here makes the
//! restart and rotation rules testable without a browser or a clock.

use std::time::Duration;

/// Lifecycle of one scheduler group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Browser session being launched, workers not yet logged in.
    Starting,
    /// Every assigned worker has completed its login.
    LoggedIn,
    /// Update passes are running.
    Running,
    /// Session is being torn down and relaunched; all workers re-login.
    Restarting,
    /// Stop requested; workers are being shut down.
    Stopping,
    /// Terminal.
    Stopped,
}

impl GroupState {
    pub fn is_terminal(self) -> bool {
        matches!(self, GroupState::Stopped)
    }
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GroupState::Starting => "starting",
            GroupState::LoggedIn => "logged_in",
            GroupState::Running => "running",
            GroupState::Restarting => "restarting",
            GroupState::Stopping => "stopping",
            GroupState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Events the driver loop reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEvent {
    /// Every assigned worker finished `perform_login`.
    LoginComplete,
    /// One full update pass finished.
    PassCompleted {
        /// Whether any worker's pass failed (pass aborted at that worker).
        failed: bool,
        /// Wall-clock time since the last successful login.
        session_age: Duration,
    },
    /// External stop request.
    StopRequested,
    /// Workers shut down and the session released.
    ShutdownComplete,
}

/// Whether the shared session must be rotated before external auth expiry.
/// Rotation is proactive: it triggers on age alone, independent of failures.
pub fn rotation_due(session_age: Duration, max_session: Duration) -> bool {
    session_age > max_session
}

/// Advance the group state. Stop requests win over everything except the
/// terminal state; unexpected events leave the state unchanged.
pub fn transition(state: GroupState, event: GroupEvent, max_session: Duration) -> GroupState {
    use GroupEvent::*;
    use GroupState::*;

    match (state, event) {
        (Stopped, _) => Stopped,
        (_, StopRequested) => Stopping,
        (Stopping, ShutdownComplete) => Stopped,
        (Stopping, _) => Stopping,

        (Starting | Restarting, LoginComplete) => LoggedIn,

        (LoggedIn | Running, PassCompleted { failed, session_age }) => {
            if failed || rotation_due(session_age, max_session) {
                Restarting
            } else {
                Running
            }
        }

        // Anything else is a driver bug; hold position rather than guess.
        (state, _) => state,
    }
}
