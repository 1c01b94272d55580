use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::actor::UserId;
use crate::domain::history::HistoryEntry;
use crate::domain::opportunity::{Opportunity, OpportunityId, StageSnapshot};
use crate::domain::stage::StageId;
use crate::patch::Patch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerExpectation {
    Any,
    Unowned,
    OwnedBy(UserId),
}

/// Preconditions a conditional update checks against the stored row. The row must
/// also still be active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityGuard {
    pub owner: OwnerExpectation,
    pub stage: Option<StageSnapshot>,
}

impl OpportunityGuard {
    pub fn unowned() -> Self {
        Self { owner: OwnerExpectation::Unowned, stage: None }
    }

    pub fn owner(owner: Option<UserId>) -> Self {
        let owner = match owner {
            Some(id) => OwnerExpectation::OwnedBy(id),
            None => OwnerExpectation::Unowned,
        };
        Self { owner, stage: None }
    }

    pub fn snapshot(snapshot: StageSnapshot) -> Self {
        Self { owner: OwnerExpectation::Any, stage: Some(snapshot) }
    }

    pub fn with_owner(mut self, owner: OwnerExpectation) -> Self {
        self.owner = owner;
        self
    }

    pub fn matches(&self, opportunity: &Opportunity) -> bool {
        if !opportunity.active {
            return false;
        }
        let owner_ok = match self.owner {
            OwnerExpectation::Any => true,
            OwnerExpectation::Unowned => opportunity.owner.is_none(),
            OwnerExpectation::OwnedBy(id) => opportunity.owner == Some(id),
        };
        let stage_ok = self.stage.map(|snapshot| opportunity.snapshot() == snapshot).unwrap_or(true);
        owner_ok && stage_ok
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMove {
    pub stage: StageId,
    pub entered_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityChange {
    pub owner: Patch<UserId>,
    pub stage: Option<StageMove>,
    pub active: Option<bool>,
}

impl OpportunityChange {
    pub fn apply_to(&self, opportunity: &mut Opportunity) {
        opportunity.owner = self.owner.clone().apply_nullable(opportunity.owner);
        if let Some(stage_move) = self.stage {
            opportunity.current_stage = stage_move.stage;
            opportunity.entered_stage_at = stage_move.entered_at;
        }
        if let Some(active) = self.active {
            opportunity.active = active;
        }
    }
}

/// A single atomic write: guard, change and the history row that records it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityMutation {
    pub opportunity_id: OpportunityId,
    pub guard: OpportunityGuard,
    pub change: OpportunityChange,
    pub history: HistoryEntry,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConditionalUpdate<T> {
    Applied(T),
    /// The guard no longer matched the stored row; nothing was written.
    Stale,
}

impl<T> ConditionalUpdate<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Stale => None,
        }
    }
}

/// Timestamp for a stage entry, truncated to microseconds and strictly after `previous`.
pub fn next_entered_at(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    if now > previous {
        now
    } else {
        previous.trunc_subsecs(6) + Duration::microseconds(1)
    }
}
