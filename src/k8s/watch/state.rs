/**
 * Session state machine, kept free of I/O so transitions can be tested alone
 */
use std::time::Duration;
use tokio::time::Instant;

/// Where a session is in its list/watch lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No stream; waiting for the resync checker
    Idle,
    /// Initial list and connect in flight
    Listing,
    /// Stream open and being read
    Watching,
    /// A resync-driven list and connect in flight
    ReconnectPending,
    GivingUp,
    Aborted,
}

/// Inputs that move a session between phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Start,
    Connected,
    /// Connect refused or stream failed or ended
    Disconnected,
    /// Resync found the session stale and the budget allows another try
    ResyncDue,
    /// Resync found the session stale and the budget is spent
    BudgetExhausted,
    Abort,
}

impl Phase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::GivingUp | Self::Aborted)
    }

    /// Apply `input`. Terminal phases absorb everything.
    #[must_use]
    pub const fn on(self, input: Input) -> Self {
        if self.is_terminal() {
            return self;
        }
        match (self, input) {
            (_, Input::Abort) => Self::Aborted,
            (_, Input::BudgetExhausted) => Self::GivingUp,
            (Self::Idle, Input::Start) => Self::Listing,
            (Self::Listing | Self::ReconnectPending, Input::Connected) => Self::Watching,
            (_, Input::Disconnected) => Self::Idle,
            // Duplicate resyncs while reconnecting coalesce into the same phase
            (_, Input::ResyncDue) => Self::ReconnectPending,
            (phase, _) => phase,
        }
    }
}

/// When the stream last proved it was alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSeen {
    /// Nothing decoded yet; the resync checker stays quiet
    Unset,
    /// A failure asked for a reconnect at the next check
    ForcedResync,
    ObservedAt(Instant),
}

impl LastSeen {
    /// `true` when the resync checker should act
    #[must_use]
    pub fn is_due(self, now: Instant, limit: Duration) -> bool {
        match self {
            Self::Unset => false,
            Self::ForcedResync => true,
            Self::ObservedAt(at) => now.saturating_duration_since(at) > limit,
        }
    }
}

/// What a due resync check has to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncAction {
    /// Not due
    Skip,
    /// Count the failure, then reconnect
    Reconnect,
    /// Count the failure; a reconnect is already running
    Coalesce,
    GiveUp,
}

/// Decide the outcome of one resync check
#[must_use]
pub fn resync_action(
    last_seen: LastSeen,
    now: Instant,
    limit: Duration,
    within_budget: bool,
    phase: Phase,
) -> ResyncAction {
    if phase.is_terminal() || !last_seen.is_due(now, limit) {
        ResyncAction::Skip
    } else if !within_budget {
        ResyncAction::GiveUp
    } else if phase == Phase::ReconnectPending {
        ResyncAction::Coalesce
    } else {
        ResyncAction::Reconnect
    }
}
