//! Collaboration invitations between two users on a child profile.

use crate::{Error, ProfileId, RecordId, RecordPayload, Result, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a collaboration invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationStatus {
    Pending,
    Accepted,
    Declined,
    Revoked,
}

impl CollaborationStatus {
    /// Returns true if moving from `self` to `next` is allowed:
    /// `pending -> accepted | declined` and `accepted -> revoked`.
    pub fn can_transition_to(self, next: CollaborationStatus) -> bool {
        use CollaborationStatus::*;
        matches!(
            (self, next),
            (Pending, Accepted) | (Pending, Declined) | (Accepted, Revoked)
        )
    }

    /// Returns true for states that grant access.
    pub fn is_active(self) -> bool {
        self == CollaborationStatus::Accepted
    }
}

impl fmt::Display for CollaborationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// An invitation from `inviter_id` to `invitee_id` to co-manage a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaboration {
    pub profile_id: ProfileId,
    pub inviter_id: UserId,
    pub invitee_id: UserId,
    pub status: CollaborationStatus,
}

impl Collaboration {
    /// Creates a pending invitation.
    pub fn invite(profile_id: ProfileId, inviter_id: UserId, invitee_id: UserId) -> Self {
        Self {
            profile_id,
            inviter_id,
            invitee_id,
            status: CollaborationStatus::Pending,
        }
    }

    /// Moves to `next`, rejecting transitions outside the state machine.
    pub fn transition(&mut self, next: CollaborationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Returns true if this collaboration links `a` and `b`, in either
    /// direction.
    pub fn connects(&self, a: &UserId, b: &UserId) -> bool {
        (&self.inviter_id == a && &self.invitee_id == b)
            || (&self.inviter_id == b && &self.invitee_id == a)
    }

    /// Id of the profile record this collaboration grants access to.
    pub fn profile_record_id(&self) -> RecordId {
        RecordId::from_uuid(self.profile_id.as_uuid())
    }
}

impl RecordPayload for Collaboration {
    const COLLECTION: &'static str = "collaborations";
}
