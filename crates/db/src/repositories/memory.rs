use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use embudo_core::domain::agreement::{AgreementFieldRule, FieldRuleId, NewFieldRule};
use embudo_core::domain::history::HistoryEntry;
use embudo_core::domain::mutation::{ConditionalUpdate, OpportunityMutation};
use embudo_core::domain::opportunity::{Opportunity, OpportunityId};
use embudo_core::domain::stage::{NewStage, Stage, StageId};
use embudo_core::domain::transition::{NewTransition, Transition, TransitionId};

use super::{
    CandidateCursor, FieldRuleRepository, OpportunityDraft, OpportunityRepository, RepositoryError,
    StageRepository, TransitionRepository,
};

#[derive(Default)]
struct MemoryState {
    stages: BTreeMap<StageId, Stage>,
    transitions: BTreeMap<TransitionId, Transition>,
    field_rules: BTreeMap<FieldRuleId, AgreementFieldRule>,
    opportunities: BTreeMap<OpportunityId, Opportunity>,
    history: Vec<HistoryEntry>,
    next_id: i64,
}

impl MemoryState {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_stage_order(&self, stage: &Stage) -> Result<(), RepositoryError> {
        let collision = self.stages.values().any(|other| {
            other.id != stage.id && other.active && stage.active && other.order == stage.order
        });
        if collision {
            return Err(RepositoryError::Constraint(format!(
                "active stage order {} already in use",
                stage.order
            )));
        }
        Ok(())
    }

    fn check_transition(&self, transition: &Transition) -> Result<(), RepositoryError> {
        for stage in [transition.origin_stage, transition.destination_stage] {
            if !self.stages.contains_key(&stage) {
                return Err(RepositoryError::Constraint(format!("stage `{stage}` does not exist")));
            }
        }
        let second_default = transition.is_default
            && transition.active
            && self.transitions.values().any(|other| {
                other.id != transition.id
                    && other.origin_stage == transition.origin_stage
                    && other.is_default
                    && other.active
            });
        if second_default {
            return Err(RepositoryError::Constraint(format!(
                "stage `{}` already has an active default transition",
                transition.origin_stage
            )));
        }
        Ok(())
    }
}

/// In-memory store used by engine and server tests. All writes, including conditional
/// updates, run under one write lock, which gives the same all-or-nothing behavior as
/// the SQL transaction.
#[derive(Default)]
pub struct InMemoryFunnelStore {
    state: RwLock<MemoryState>,
}

impl InMemoryFunnelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an opportunity row verbatim, id included. Lets tests place rows in states
    /// the public API would not produce directly.
    pub async fn put_opportunity(&self, opportunity: Opportunity) {
        let mut state = self.state.write().await;
        state.next_id = state.next_id.max(opportunity.id.0);
        state.opportunities.insert(opportunity.id, opportunity);
    }
}

#[async_trait::async_trait]
impl StageRepository for InMemoryFunnelStore {
    async fn list_stages(&self, include_inactive: bool) -> Result<Vec<Stage>, RepositoryError> {
        let state = self.state.read().await;
        let mut stages: Vec<Stage> = state
            .stages
            .values()
            .filter(|stage| include_inactive || stage.active)
            .cloned()
            .collect();
        stages.sort_by_key(|stage| (stage.order, stage.id));
        Ok(stages)
    }

    async fn find_stage(&self, id: StageId) -> Result<Option<Stage>, RepositoryError> {
        Ok(self.state.read().await.stages.get(&id).cloned())
    }

    async fn insert_stage(&self, stage: NewStage) -> Result<Stage, RepositoryError> {
        let mut state = self.state.write().await;
        let mut created = Stage {
            id: StageId(0),
            name: stage.name,
            order: stage.order,
            stage_type: stage.stage_type,
            idle_timeout_hours: stage.idle_timeout_hours,
            color: stage.color,
            active: true,
        };
        state.check_stage_order(&created)?;
        created.id = StageId(state.allocate());
        state.stages.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_stage(&self, stage: Stage) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.check_stage_order(&stage)?;
        if let Some(slot) = state.stages.get_mut(&stage.id) {
            *slot = stage;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TransitionRepository for InMemoryFunnelStore {
    async fn list_transitions(
        &self,
        origin: Option<StageId>,
        include_inactive: bool,
    ) -> Result<Vec<Transition>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .transitions
            .values()
            .filter(|transition| origin.map_or(true, |stage| transition.origin_stage == stage))
            .filter(|transition| include_inactive || transition.active)
            .cloned()
            .collect())
    }

    async fn find_transition(
        &self,
        id: TransitionId,
    ) -> Result<Option<Transition>, RepositoryError> {
        Ok(self.state.read().await.transitions.get(&id).cloned())
    }

    async fn insert_transition(
        &self,
        transition: NewTransition,
    ) -> Result<Transition, RepositoryError> {
        let mut state = self.state.write().await;
        let mut created = Transition {
            id: TransitionId(0),
            origin_stage: transition.origin_stage,
            destination_stage: transition.destination_stage,
            action_name: transition.action_name,
            requires_note: transition.requires_note,
            requires_supervisor: transition.requires_supervisor,
            returns_to_pool: transition.returns_to_pool,
            is_default: transition.is_default,
            active: true,
        };
        state.check_transition(&created)?;
        created.id = TransitionId(state.allocate());
        state.transitions.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_transition(&self, transition: Transition) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.check_transition(&transition)?;
        if let Some(slot) = state.transitions.get_mut(&transition.id) {
            *slot = transition;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FieldRuleRepository for InMemoryFunnelStore {
    async fn list_field_rules(
        &self,
        agreement_type: Option<&str>,
    ) -> Result<Vec<AgreementFieldRule>, RepositoryError> {
        let state = self.state.read().await;
        let mut rules: Vec<AgreementFieldRule> = state
            .field_rules
            .values()
            .filter(|rule| agreement_type.map_or(true, |kind| rule.agreement_type == kind))
            .cloned()
            .collect();
        rules.sort_by(|left, right| {
            (&left.agreement_type, &left.field_name).cmp(&(&right.agreement_type, &right.field_name))
        });
        Ok(rules)
    }

    async fn upsert_field_rule(
        &self,
        rule: NewFieldRule,
    ) -> Result<AgreementFieldRule, RepositoryError> {
        let mut state = self.state.write().await;
        let existing = state.field_rules.values_mut().find(|stored| {
            stored.agreement_type == rule.agreement_type && stored.field_name == rule.field_name
        });
        if let Some(stored) = existing {
            stored.required = rule.required;
            return Ok(stored.clone());
        }

        let created = AgreementFieldRule {
            id: FieldRuleId(state.allocate()),
            agreement_type: rule.agreement_type,
            field_name: rule.field_name,
            required: rule.required,
        };
        state.field_rules.insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete_field_rule(&self, id: FieldRuleId) -> Result<bool, RepositoryError> {
        Ok(self.state.write().await.field_rules.remove(&id).is_some())
    }
}

#[async_trait::async_trait]
impl OpportunityRepository for InMemoryFunnelStore {
    async fn find_opportunity(
        &self,
        id: OpportunityId,
    ) -> Result<Option<Opportunity>, RepositoryError> {
        Ok(self.state.read().await.opportunities.get(&id).cloned())
    }

    async fn insert_opportunity(
        &self,
        draft: OpportunityDraft,
    ) -> Result<Opportunity, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.stages.contains_key(&draft.stage) {
            return Err(RepositoryError::Constraint(format!(
                "stage `{}` does not exist",
                draft.stage
            )));
        }
        let opportunity = Opportunity {
            id: OpportunityId(state.allocate()),
            owner: draft.owner,
            current_stage: draft.stage,
            entered_stage_at: draft.entered_stage_at,
            agreement_type: draft.agreement_type,
            fields: draft.fields,
            active: true,
            created_at: draft.entered_stage_at,
        };
        state.opportunities.insert(opportunity.id, opportunity.clone());
        Ok(opportunity)
    }

    async fn conditional_update(
        &self,
        mutation: OpportunityMutation,
    ) -> Result<ConditionalUpdate<Opportunity>, RepositoryError> {
        let mut state = self.state.write().await;
        let Some(stored) = state.opportunities.get_mut(&mutation.opportunity_id) else {
            return Ok(ConditionalUpdate::Stale);
        };
        if !mutation.guard.matches(stored) {
            return Ok(ConditionalUpdate::Stale);
        }
        mutation.change.apply_to(stored);
        let updated = stored.clone();
        state.history.push(mutation.history);
        Ok(ConditionalUpdate::Applied(updated))
    }

    async fn history_for(&self, id: OpportunityId) -> Result<Vec<HistoryEntry>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.history.iter().filter(|entry| entry.opportunity_id == id).cloned().collect())
    }

    async fn escalation_candidates(
        &self,
        now: DateTime<Utc>,
        after: Option<CandidateCursor>,
        limit: u32,
    ) -> Result<Vec<Opportunity>, RepositoryError> {
        let state = self.state.read().await;
        let mut candidates: Vec<Opportunity> = state
            .opportunities
            .values()
            .filter(|opportunity| opportunity.active)
            .filter(|opportunity| after.map_or(true, |cursor| cursor.precedes(opportunity)))
            .filter(|opportunity| {
                state
                    .stages
                    .get(&opportunity.current_stage)
                    .and_then(Stage::idle_timeout)
                    .map_or(false, |timeout| now - opportunity.entered_stage_at >= timeout)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|opportunity| (opportunity.entered_stage_at, opportunity.id));
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn list_pool(&self, limit: u32) -> Result<Vec<Opportunity>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .opportunities
            .values()
            .filter(|opportunity| opportunity.active && opportunity.owner.is_none())
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
