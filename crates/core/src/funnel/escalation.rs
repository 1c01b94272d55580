//! Timer escalation planning. The sweep loop itself lives in the engine; this module
//! decides, per opportunity, whether and how it escalates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::opportunity::{Opportunity, OpportunityId};
use crate::domain::stage::Stage;
use crate::domain::transition::Transition;
use crate::funnel::catalog::CatalogSnapshot;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    #[default]
    Idle,
    Scanning,
    Applying,
}

impl SweepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Applying => "applying",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    NoDefaultTransition,
    DefaultTransitionInactive,
    DestinationInactive,
    MissingField(String),
    StageMissing,
    /// The evaluator refused the escalation for a reason other than a missing field.
    Rejected(String),
    Persistence(String),
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoDefaultTransition => "no_default_transition",
            Self::DefaultTransitionInactive => "default_transition_inactive",
            Self::DestinationInactive => "destination_inactive",
            Self::MissingField(_) => "missing_field",
            Self::StageMissing => "stage_missing",
            Self::Rejected(_) => "rejected",
            Self::Persistence(_) => "persistence",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSkip {
    pub opportunity_id: OpportunityId,
    pub reason: SkipReason,
}

/// Outcome of one sweep tick.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub escalated: Vec<OpportunityId>,
    pub skipped: Vec<SweepSkip>,
    /// Items whose snapshot moved between scan and commit.
    pub conflicts: Vec<OpportunityId>,
}

impl SweepReport {
    pub fn skip(&mut self, opportunity_id: OpportunityId, reason: SkipReason) {
        self.skipped.push(SweepSkip { opportunity_id, reason });
    }

    pub fn is_quiet(&self) -> bool {
        self.escalated.is_empty() && self.skipped.is_empty() && self.conflicts.is_empty()
    }
}

/// True once the opportunity has sat in `stage` for at least the stage's idle timeout.
/// Stages without a timeout never elapse.
pub fn idle_elapsed(opportunity: &Opportunity, stage: &Stage, now: DateTime<Utc>) -> bool {
    match stage.idle_timeout() {
        Some(timeout) => now.signed_duration_since(opportunity.entered_stage_at) >= timeout,
        None => false,
    }
}

/// The edge and destination a timed-out opportunity escalates along.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationTarget<'a> {
    pub transition: &'a Transition,
    pub destination: &'a Stage,
}

pub fn select_default_transition<'a>(
    catalog: &'a CatalogSnapshot,
    opportunity: &Opportunity,
) -> Result<EscalationTarget<'a>, SkipReason> {
    let transition = catalog
        .default_transition(opportunity.current_stage)
        .ok_or(SkipReason::NoDefaultTransition)?;
    if !transition.active {
        return Err(SkipReason::DefaultTransitionInactive);
    }
    let destination =
        catalog.stage(transition.destination_stage).ok_or(SkipReason::StageMissing)?;
    if !destination.active {
        return Err(SkipReason::DestinationInactive);
    }
    Ok(EscalationTarget { transition, destination })
}
