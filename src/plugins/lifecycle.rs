//! Artifact lifecycle state machine.
//!
//! ```text
//!   create ──▶ proposed ──validate──▶ validation_failed   (nothing persisted)
//!                 │
//!                 └──tests run──▶ pending_review ──approve──▶ enabled ◀──enable── disabled
//!                                      │                        │                   ▲
//!                                      └──reject──▶ rejected    └──────disable──────┘
//! ```
//!
//! `enabled` and `disabled` are the two sub-states of the `available`
//! membership. Rollback and code updates never change state.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Proposed,
    ValidationFailed,
    PendingReview,
    Enabled,
    Disabled,
    Rejected,
}

impl LifecycleState {
    /// The membership set holding artifacts in this state. `None` for the
    /// transient states that never reach disk.
    pub fn membership(&self) -> Option<Membership> {
        match self {
            LifecycleState::Proposed | LifecycleState::ValidationFailed => None,
            LifecycleState::PendingReview => Some(Membership::Pending),
            LifecycleState::Enabled | LifecycleState::Disabled => Some(Membership::Available),
            LifecycleState::Rejected => Some(Membership::Failed),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, LifecycleState::Enabled)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Proposed => "proposed",
            LifecycleState::ValidationFailed => "validation_failed",
            LifecycleState::PendingReview => "pending_review",
            LifecycleState::Enabled => "enabled",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Mutually exclusive directory sets an artifact can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Pending,
    Available,
    Failed,
}

impl Membership {
    pub const ALL: [Membership; 3] = [Membership::Pending, Membership::Available, Membership::Failed];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Membership::Pending => "pending",
            Membership::Available => "available",
            Membership::Failed => "failed",
        }
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Human or agent actions on a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
    Enable,
    Disable,
    Rollback,
    UpdateCode,
    ResetAttempts,
}

impl Action {
    /// Whether the action is allowed from `state`.
    pub fn permits(&self, state: LifecycleState) -> bool {
        use LifecycleState::*;
        match self {
            Action::Approve | Action::Reject => state == PendingReview,
            Action::Enable | Action::Disable | Action::Rollback => {
                matches!(state, Enabled | Disabled)
            }
            Action::UpdateCode => matches!(state, PendingReview | Enabled | Disabled),
            Action::ResetAttempts => matches!(state, PendingReview | Enabled | Disabled | Rejected),
        }
    }

    /// State after the action succeeds from `state`.
    pub fn target(&self, state: LifecycleState) -> LifecycleState {
        match self {
            Action::Approve | Action::Enable => LifecycleState::Enabled,
            Action::Reject => LifecycleState::Rejected,
            Action::Disable => LifecycleState::Disabled,
            Action::Rollback | Action::UpdateCode | Action::ResetAttempts => state,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Enable => "enable",
            Action::Disable => "disable",
            Action::Rollback => "roll back",
            Action::UpdateCode => "update",
            Action::ResetAttempts => "reset attempts of",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_mapping() {
        assert_eq!(LifecycleState::Proposed.membership(), None);
        assert_eq!(LifecycleState::ValidationFailed.membership(), None);
        assert_eq!(LifecycleState::PendingReview.membership(), Some(Membership::Pending));
        assert_eq!(LifecycleState::Enabled.membership(), Some(Membership::Available));
        assert_eq!(LifecycleState::Disabled.membership(), Some(Membership::Available));
        assert_eq!(LifecycleState::Rejected.membership(), Some(Membership::Failed));
    }

    #[test]
    fn test_review_transitions() {
        assert!(Action::Approve.permits(LifecycleState::PendingReview));
        assert!(!Action::Approve.permits(LifecycleState::Enabled));
        assert!(!Action::Reject.permits(LifecycleState::Rejected));
        assert_eq!(
            Action::Approve.target(LifecycleState::PendingReview),
            LifecycleState::Enabled
        );
        assert_eq!(
            Action::Reject.target(LifecycleState::PendingReview),
            LifecycleState::Rejected
        );
    }

    #[test]
    fn test_toggle_and_side_transitions() {
        assert!(Action::Disable.permits(LifecycleState::Enabled));
        assert!(Action::Enable.permits(LifecycleState::Disabled));
        assert!(!Action::Enable.permits(LifecycleState::PendingReview));
        assert!(Action::Rollback.permits(LifecycleState::Disabled));
        assert!(!Action::Rollback.permits(LifecycleState::Rejected));
        assert!(Action::UpdateCode.permits(LifecycleState::PendingReview));
        assert!(!Action::UpdateCode.permits(LifecycleState::Rejected));

        for state in [LifecycleState::Enabled, LifecycleState::Disabled] {
            assert_eq!(Action::Rollback.target(state), state);
            assert_eq!(Action::UpdateCode.target(state), state);
        }
    }

    #[test]
    fn test_serde_names() {
        let s = serde_yml::to_string(&LifecycleState::PendingReview).unwrap();
        assert_eq!(s.trim(), "pending_review");
        assert_eq!(LifecycleState::ValidationFailed.to_string(), "validation_failed");
        assert_eq!(Membership::Available.to_string(), "available");
    }
}
