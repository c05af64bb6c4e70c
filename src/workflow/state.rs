//! Workflow lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a workflow record.
///
/// The edit loop re-enters `Generating → Generated → Notifying →
/// AwaitingReply`; iterations are told apart by `edit_iteration`, not by
/// separate states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Record created, nothing requested yet.
    Pending,
    /// Generation request in flight.
    Generating,
    /// Draft available, notification not yet requested.
    Generated,
    /// Draft notification in flight.
    Notifying,
    /// Waiting for the human's reply.
    AwaitingReply,
    /// Final delivery in flight.
    SendingFinal,
    /// Reply delivered.
    Sent,
    /// Human chose to ignore the item.
    Ignored,
    /// Retries exhausted, fatal error, or edit limit exceeded.
    Failed,
    /// No reply before the deadline.
    TimedOut,
}

impl WorkflowState {
    /// Every state, in lifecycle order.
    pub const ALL: [WorkflowState; 10] = [
        Self::Pending,
        Self::Generating,
        Self::Generated,
        Self::Notifying,
        Self::AwaitingReply,
        Self::SendingFinal,
        Self::Sent,
        Self::Ignored,
        Self::Failed,
        Self::TimedOut,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        use WorkflowState::*;

        if !self.is_terminal() && target == Failed {
            return true;
        }

        matches!(
            (self, target),
            (Pending, Generating) |
            (Generating, Generated) | (Generating, Generating) |
            (Generated, Notifying) |
            (Notifying, AwaitingReply) | (Notifying, Notifying) |
            (AwaitingReply, SendingFinal) | (AwaitingReply, Generating) |
            (AwaitingReply, Ignored) | (AwaitingReply, TimedOut) |
            (SendingFinal, Sent) | (SendingFinal, SendingFinal) |
            // Manual re-arm
            (Failed, Generating) | (Failed, Notifying) | (Failed, SendingFinal)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Ignored | Self::Failed | Self::TimedOut
        )
    }

    /// States representing an outstanding collaborator call.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Generating | Self::Notifying | Self::SendingFinal)
    }

    /// States waiting on the human; `timeout_at` is set exactly here.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::AwaitingReply)
    }

    /// States the engine advances on its own (in-flight plus the two
    /// hand-off states before them).
    pub fn needs_drive(&self) -> bool {
        matches!(self, Self::Pending | Self::Generated) || self.is_in_flight()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Generated => "generated",
            Self::Notifying => "notifying",
            Self::AwaitingReply => "awaiting_reply",
            Self::SendingFinal => "sending_final",
            Self::Sent => "sent",
            Self::Ignored => "ignored",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Unknown workflow state: {s}"))
    }
}
