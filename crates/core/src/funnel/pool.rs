//! Claim, release and reassignment between the unassigned pool and promoters.

use chrono::{DateTime, Utc};

use crate::domain::actor::{Actor, UserId};
use crate::domain::history::{HistoryEntry, HistoryKind};
use crate::domain::mutation::{
    OpportunityChange, OpportunityGuard, OpportunityMutation, OwnerExpectation,
};
use crate::domain::opportunity::Opportunity;
use crate::domain::stage::Stage;
use crate::errors::{FunnelError, ValidationFailure};
use crate::funnel::capability::{Capability, CapabilityTable};
use crate::patch::Patch;

#[derive(Clone, Debug, Default)]
pub struct PoolPlanner {
    capabilities: CapabilityTable,
}

impl PoolPlanner {
    pub fn new(capabilities: CapabilityTable) -> Self {
        Self { capabilities }
    }

    /// Plans a claim guarded on the owner still being empty. The actor becomes owner.
    pub fn plan_claim(
        &self,
        opportunity: &Opportunity,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<OpportunityMutation, FunnelError> {
        self.capabilities.require(actor, Capability::ClaimFromPool)?;
        let claimant = person(actor)?;
        require_active(opportunity)?;
        if let Some(owner) = opportunity.owner {
            return Err(FunnelError::Conflict(format!(
                "opportunity `{}` is already owned by user `{owner}`",
                opportunity.id
            )));
        }

        Ok(OpportunityMutation {
            opportunity_id: opportunity.id,
            guard: OpportunityGuard::unowned(),
            change: OpportunityChange { owner: Patch::Value(claimant), ..Default::default() },
            history: HistoryEntry::new(opportunity.id, Some(claimant), HistoryKind::Claim, now),
        })
    }

    /// Plans a release back to the pool. Returns `None` when the opportunity is already
    /// unowned; nothing needs writing then.
    ///
    /// Actors who may act on any opportunity clear the owner whoever holds it. A
    /// promoter releasing their own opportunity is guarded on still being the owner.
    pub fn plan_release(
        &self,
        opportunity: &Opportunity,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Option<OpportunityMutation>, FunnelError> {
        require_active(opportunity)?;
        let guard = if self.capabilities.allows(actor.role, Capability::ActOnAnyOpportunity) {
            OpportunityGuard { owner: OwnerExpectation::Any, stage: None }
        } else {
            match actor.id {
                Some(id) if opportunity.owner == Some(id) => OpportunityGuard::owner(Some(id)),
                _ => {
                    return Err(FunnelError::forbidden(
                        actor.role,
                        Capability::ActOnAnyOpportunity.describe(),
                    ))
                }
            }
        };
        if opportunity.in_pool() {
            return Ok(None);
        }

        Ok(Some(OpportunityMutation {
            opportunity_id: opportunity.id,
            guard,
            change: OpportunityChange { owner: Patch::Null, ..Default::default() },
            history: HistoryEntry::new(opportunity.id, actor.id, HistoryKind::Release, now),
        }))
    }

    /// Plans handing the opportunity to `new_owner`, guarded on the owner read now.
    /// Opportunities sitting in an EXIT stage cannot be reassigned.
    pub fn plan_reassign(
        &self,
        opportunity: &Opportunity,
        current_stage: &Stage,
        new_owner: UserId,
        actor: &Actor,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OpportunityMutation, FunnelError> {
        self.capabilities.require(actor, Capability::ReassignOpportunity)?;
        require_active(opportunity)?;
        if current_stage.is_exit() {
            return Err(ValidationFailure::Invalid(format!(
                "opportunity `{}` is in exit stage `{}` and cannot be reassigned",
                opportunity.id, current_stage.name
            ))
            .into());
        }
        if opportunity.owner == Some(new_owner) {
            return Err(ValidationFailure::Invalid(format!(
                "opportunity `{}` is already owned by user `{new_owner}`",
                opportunity.id
            ))
            .into());
        }

        let note = note.map(str::trim).filter(|value| !value.is_empty()).map(str::to_owned);
        Ok(OpportunityMutation {
            opportunity_id: opportunity.id,
            guard: OpportunityGuard::owner(opportunity.owner),
            change: OpportunityChange { owner: Patch::Value(new_owner), ..Default::default() },
            history: HistoryEntry::new(opportunity.id, actor.id, HistoryKind::Reassignment, now)
                .with_note(note),
        })
    }
}

fn person(actor: &Actor) -> Result<UserId, FunnelError> {
    actor.id.ok_or_else(|| {
        ValidationFailure::Invalid("an identified user is required for this action".to_owned())
            .into()
    })
}

fn require_active(opportunity: &Opportunity) -> Result<(), FunnelError> {
    if opportunity.active {
        Ok(())
    } else {
        Err(FunnelError::not_found("active opportunity", opportunity.id))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    use super::PoolPlanner;
    use crate::domain::actor::{Actor, Role, UserId};
    use crate::domain::history::HistoryKind;
    use crate::domain::mutation::OwnerExpectation;
    use crate::domain::opportunity::{Opportunity, OpportunityId};
    use crate::domain::stage::{Stage, StageId, StageType};
    use crate::errors::FunnelError;
    use crate::patch::Patch;

    fn opportunity(owner: Option<UserId>) -> Opportunity {
        let at = Utc.with_ymd_and_hms(2026, 4, 6, 8, 30, 0).single().expect("valid timestamp");
        Opportunity {
            id: OpportunityId(3),
            owner,
            current_stage: StageId(1),
            entered_stage_at: at,
            agreement_type: "PENSIONADOS".to_string(),
            fields: BTreeMap::new(),
            active: true,
            created_at: at,
        }
    }

    fn stage(stage_type: StageType) -> Stage {
        Stage {
            id: StageId(1),
            name: "Assigned".to_string(),
            order: 1,
            stage_type,
            idle_timeout_hours: Some(72),
            color: "#1565c0".to_string(),
            active: true,
        }
    }

    #[test]
    fn claim_is_guarded_on_empty_owner() {
        let now = Utc::now();
        let mutation = PoolPlanner::default()
            .plan_claim(&opportunity(None), &Actor::user(UserId(8), Role::Promoter), now)
            .expect("pooled opportunity is claimable");

        assert_eq!(mutation.guard.owner, OwnerExpectation::Unowned);
        assert_eq!(mutation.guard.stage, None);
        assert_eq!(mutation.change.owner, Patch::Value(UserId(8)));
        assert_eq!(mutation.change.stage, None);
        assert_eq!(mutation.history.kind, HistoryKind::Claim);
    }

    #[test]
    fn claiming_an_owned_opportunity_conflicts() {
        let error = PoolPlanner::default()
            .plan_claim(
                &opportunity(Some(UserId(8))),
                &Actor::user(UserId(8), Role::Promoter),
                Utc::now(),
            )
            .expect_err("already owned");
        assert!(error.is_retryable());
    }

    #[test]
    fn claiming_a_closed_opportunity_is_not_found() {
        let mut closed = opportunity(None);
        closed.active = false;
        let error = PoolPlanner::default()
            .plan_claim(&closed, &Actor::user(UserId(8), Role::Promoter), Utc::now())
            .expect_err("closed");
        assert!(matches!(error, FunnelError::NotFound(_)));
    }

    #[test]
    fn release_of_pooled_opportunity_writes_nothing() {
        let planned = PoolPlanner::default()
            .plan_release(&opportunity(None), &Actor::user(UserId(1), Role::Admin), Utc::now())
            .expect("release allowed");
        assert!(planned.is_none());
    }

    #[test]
    fn promoter_may_release_only_their_own() {
        let planner = PoolPlanner::default();
        let mutation = planner
            .plan_release(
                &opportunity(Some(UserId(8))),
                &Actor::user(UserId(8), Role::Promoter),
                Utc::now(),
            )
            .expect("owner releases")
            .expect("write planned");
        assert_eq!(mutation.change.owner, Patch::Null);
        assert_eq!(mutation.guard.owner, OwnerExpectation::OwnedBy(UserId(8)));

        let error = planner
            .plan_release(
                &opportunity(Some(UserId(9))),
                &Actor::user(UserId(8), Role::Promoter),
                Utc::now(),
            )
            .expect_err("not the owner");
        assert!(matches!(error, FunnelError::Authorization { .. }));
    }

    #[test]
    fn supervisor_release_clears_whichever_owner_holds_it() {
        let read = opportunity(Some(UserId(8)));
        let mutation = PoolPlanner::default()
            .plan_release(&read, &Actor::user(UserId(50), Role::Supervisor), Utc::now())
            .expect("supervisor releases")
            .expect("write planned");
        assert_eq!(mutation.guard.owner, OwnerExpectation::Any);

        let mut reassigned = opportunity(Some(UserId(9)));
        assert!(mutation.guard.matches(&reassigned), "a concurrent reassign does not block it");
        reassigned.active = false;
        assert!(!mutation.guard.matches(&reassigned), "closed rows stay untouched");
    }

    #[test]
    fn reassign_requires_capability_and_non_exit_stage() {
        let planner = PoolPlanner::default();
        let opp = opportunity(Some(UserId(8)));

        let error = planner
            .plan_reassign(
                &opp,
                &stage(StageType::Advance),
                UserId(9),
                &Actor::user(UserId(8), Role::Promoter),
                None,
                Utc::now(),
            )
            .expect_err("promoters cannot reassign");
        assert!(matches!(error, FunnelError::Authorization { .. }));

        let error = planner
            .plan_reassign(
                &opp,
                &stage(StageType::Exit),
                UserId(9),
                &Actor::user(UserId(1), Role::Admin),
                None,
                Utc::now(),
            )
            .expect_err("exit stage");
        assert!(matches!(error, FunnelError::Validation(_)));

        let mutation = planner
            .plan_reassign(
                &opp,
                &stage(StageType::Advance),
                UserId(9),
                &Actor::user(UserId(4), Role::BranchManager),
                Some("  vacation cover "),
                Utc::now(),
            )
            .expect("manager reassigns");
        assert_eq!(mutation.change.owner, Patch::Value(UserId(9)));
        assert_eq!(mutation.guard.owner, OwnerExpectation::OwnedBy(UserId(8)));
        assert_eq!(mutation.history.note.as_deref(), Some("vacation cover"));
        assert_eq!(mutation.history.kind, HistoryKind::Reassignment);
    }
}
