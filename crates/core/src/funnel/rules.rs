//! Transition gate.
//!
//! The evaluator only decides; it never writes. A successful decision yields a
//! [`TransitionAuthorization`] that carries the stage snapshot it was made against,
//! and committing it goes through a conditional update guarded on that snapshot. When
//! the decision rested on the actor owning the opportunity, the owner is guarded too.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::actor::Actor;
use crate::domain::agreement::AgreementFieldRule;
use crate::domain::history::{HistoryEntry, HistoryKind};
use crate::domain::mutation::{
    next_entered_at, OpportunityChange, OpportunityGuard, OpportunityMutation,
    OwnerExpectation, StageMove,
};
use crate::domain::opportunity::{Opportunity, OpportunityId, StageSnapshot};
use crate::domain::stage::{Stage, StageType};
use crate::domain::transition::Transition;
use crate::errors::{FunnelError, ValidationFailure};
use crate::funnel::capability::{Capability, CapabilityTable};
use crate::funnel::fields::validate_fields;
use crate::patch::Patch;

/// Permission to move one opportunity along one transition, valid only while the
/// opportunity still matches `snapshot` and `owner`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionAuthorization {
    pub opportunity_id: OpportunityId,
    pub transition: Transition,
    pub snapshot: StageSnapshot,
    pub owner: OwnerExpectation,
    pub actor: Actor,
    pub note: Option<String>,
    pub escalation: bool,
}

impl TransitionAuthorization {
    /// Builds the atomic write for this decision. `terminal` soft-closes the
    /// opportunity in the same commit.
    pub fn into_mutation(self, terminal: bool, now: DateTime<Utc>) -> OpportunityMutation {
        let entered_at = next_entered_at(self.snapshot.entered_at, now);
        let destination = self.transition.destination_stage;
        let owner = if self.transition.returns_to_pool { Patch::Null } else { Patch::Absent };
        let kind =
            if self.escalation { HistoryKind::TimerEscalation } else { HistoryKind::StageChange };

        OpportunityMutation {
            opportunity_id: self.opportunity_id,
            guard: OpportunityGuard::snapshot(self.snapshot).with_owner(self.owner),
            change: OpportunityChange {
                owner,
                stage: Some(StageMove { stage: destination, entered_at }),
                active: terminal.then_some(false),
            },
            history: HistoryEntry::new(self.opportunity_id, self.actor.id, kind, entered_at)
                .with_stages(self.snapshot.stage, destination)
                .with_note(self.note),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuleEvaluator {
    capabilities: CapabilityTable,
}

impl RuleEvaluator {
    pub fn new(capabilities: CapabilityTable) -> Self {
        Self { capabilities }
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Gates a manual transition request.
    ///
    /// Checks run in a fixed order: applicability, note, ownership, supervisor gate,
    /// then required agreement fields (only when `destination` is an ADVANCE stage).
    pub fn evaluate_transition(
        &self,
        opportunity: &Opportunity,
        transition: &Transition,
        destination: &Stage,
        actor: &Actor,
        note: Option<&str>,
        field_rules: &[AgreementFieldRule],
    ) -> Result<TransitionAuthorization, FunnelError> {
        check_applicable(opportunity, transition)?;
        self.capabilities.require(actor, Capability::ExecuteTransition)?;

        let note = note.map(str::trim).filter(|value| !value.is_empty());
        if transition.requires_note && note.is_none() {
            return Err(ValidationFailure::MissingNote { action: transition.action_name.clone() }
                .into());
        }

        let owner = if self.capabilities.allows(actor.role, Capability::ActOnAnyOpportunity) {
            OwnerExpectation::Any
        } else {
            match actor.id {
                Some(id) if opportunity.owner == Some(id) => OwnerExpectation::OwnedBy(id),
                _ => {
                    return Err(FunnelError::forbidden(
                        actor.role,
                        Capability::ActOnAnyOpportunity.describe(),
                    ))
                }
            }
        };

        if transition.requires_supervisor {
            self.capabilities.require(actor, Capability::ApproveGatedTransition)?;
        }

        check_destination_fields(opportunity, destination, field_rules)?;

        Ok(TransitionAuthorization {
            opportunity_id: opportunity.id,
            transition: transition.clone(),
            snapshot: opportunity.snapshot(),
            owner,
            actor: *actor,
            note: note.map(str::to_owned),
            escalation: false,
        })
    }

    /// Gates a timer-driven escalation. Note and supervisor rules do not apply; the
    /// field check still does for ADVANCE destinations.
    pub fn authorize_escalation(
        &self,
        opportunity: &Opportunity,
        transition: &Transition,
        destination: &Stage,
        field_rules: &[AgreementFieldRule],
    ) -> Result<TransitionAuthorization, FunnelError> {
        let actor = Actor::system();
        check_applicable(opportunity, transition)?;
        self.capabilities.require(&actor, Capability::Escalate)?;
        check_destination_fields(opportunity, destination, field_rules)?;

        Ok(TransitionAuthorization {
            opportunity_id: opportunity.id,
            transition: transition.clone(),
            snapshot: opportunity.snapshot(),
            owner: OwnerExpectation::Any,
            actor,
            note: None,
            escalation: true,
        })
    }
}

fn check_applicable(opportunity: &Opportunity, transition: &Transition) -> Result<(), FunnelError> {
    if !opportunity.active {
        return Err(FunnelError::not_found("active opportunity", opportunity.id));
    }
    if transition.origin_stage != opportunity.current_stage {
        return Err(FunnelError::NotFound(format!(
            "transition `{}` does not apply from stage `{}`",
            transition.id, opportunity.current_stage
        )));
    }
    if !transition.active {
        return Err(FunnelError::not_found("active transition", transition.id));
    }
    Ok(())
}

fn check_destination_fields(
    opportunity: &Opportunity,
    destination: &Stage,
    field_rules: &[AgreementFieldRule],
) -> Result<(), FunnelError> {
    match destination.stage_type {
        StageType::Advance => validate_fields(opportunity, field_rules),
        StageType::Exit => Ok(()),
    }
}
