//! Request-side orchestration of the funnel.
//!
//! Every opportunity write follows the same path: read the row, let a core planner
//! decide, then commit through `conditional_update`. A stale guard becomes
//! `FunnelError::Conflict`; the service never retries on the caller's behalf.

use std::sync::Arc;

use chrono::SubsecRound;
use tracing::info;
use uuid::Uuid;

use embudo_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use embudo_core::domain::actor::{Actor, UserId};
use embudo_core::domain::agreement::{AgreementFieldRule, FieldRuleId, NewFieldRule};
use embudo_core::domain::history::{HistoryEntry, HistoryKind};
use embudo_core::domain::mutation::{ConditionalUpdate, OpportunityMutation};
use embudo_core::domain::opportunity::{NewOpportunity, Opportunity, OpportunityId};
use embudo_core::domain::stage::{NewStage, Stage, StageId, StagePatch};
use embudo_core::domain::transition::{NewTransition, Transition, TransitionId, TransitionPatch};
use embudo_core::errors::{ApplicationError, FunnelError, ValidationFailure};
use embudo_core::funnel::catalog::{
    apply_stage_patch, apply_transition_patch, validate_field_rule, validate_new_stage,
    validate_new_transition,
};
use embudo_core::funnel::fields::missing_fields;
use embudo_core::{Capability, CapabilityTable, CatalogSnapshot, PoolPlanner, RuleEvaluator};
use embudo_db::repositories::{
    FieldRuleRepository, OpportunityRepository, StageRepository, TransitionRepository,
};
use embudo_db::{FunnelStore, OpportunityDraft, RepositoryError};

use crate::audit::TracingAuditSink;
use crate::cache::CatalogCache;
use crate::clock::{Clock, SystemClock};
use crate::notifier::{NoopNotifier, Notifier, StageChangeNotice};

const MAX_POOL_PAGE: u32 = 500;

/// Who is asking, plus the id that ties their request to logs and audit events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub actor: Actor,
    pub correlation_id: String,
}

impl RequestContext {
    pub fn new(actor: Actor) -> Self {
        Self { actor, correlation_id: Uuid::new_v4().to_string() }
    }

    pub fn with_correlation_id(actor: Actor, correlation_id: impl Into<String>) -> Self {
        Self { actor, correlation_id: correlation_id.into() }
    }
}

pub struct FunnelService {
    pub(crate) store: Arc<dyn FunnelStore>,
    pub(crate) catalog: Arc<CatalogCache>,
    pub(crate) evaluator: RuleEvaluator,
    pool: PoolPlanner,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl FunnelService {
    pub fn new(store: Arc<dyn FunnelStore>) -> Self {
        let catalog = Arc::new(CatalogCache::new(Arc::clone(&store)));
        Self {
            store,
            catalog,
            evaluator: RuleEvaluator::default(),
            pool: PoolPlanner::default(),
            notifier: Arc::new(NoopNotifier),
            audit: Arc::new(TracingAuditSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.evaluator = RuleEvaluator::new(capabilities.clone());
        self.pool = PoolPlanner::new(capabilities);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub async fn catalog_snapshot(&self) -> Result<Arc<CatalogSnapshot>, ApplicationError> {
        self.catalog.snapshot().await.map_err(persistence)
    }

    /// Active stages ordered by `order`.
    pub async fn list_stages(&self) -> Result<Vec<Stage>, ApplicationError> {
        let catalog = self.catalog_snapshot().await?;
        Ok(catalog.active_stages().cloned().collect())
    }

    /// Active transitions leaving `stage_id`, ordered by id.
    pub async fn list_transitions(
        &self,
        stage_id: StageId,
    ) -> Result<Vec<Transition>, ApplicationError> {
        let catalog = self.catalog_snapshot().await?;
        if catalog.stage(stage_id).is_none() {
            return Err(FunnelError::not_found("stage", stage_id).into());
        }
        Ok(catalog.outgoing(stage_id).cloned().collect())
    }

    pub async fn create_opportunity(
        &self,
        ctx: &RequestContext,
        new: NewOpportunity,
    ) -> Result<Opportunity, ApplicationError> {
        let result = self.try_create_opportunity(ctx, new).await;
        let opportunity_id = result.as_ref().ok().map(|opportunity| opportunity.id);
        let category = AuditCategory::Transition;
        self.audit_result(ctx, opportunity_id, "opportunity.create", category, &result);
        result
    }

    async fn try_create_opportunity(
        &self,
        ctx: &RequestContext,
        new: NewOpportunity,
    ) -> Result<Opportunity, ApplicationError> {
        self.require(ctx, Capability::ExecuteTransition)?;
        if let Some(owner) = new.owner {
            if ctx.actor.id != Some(owner) {
                self.require(ctx, Capability::ReassignOpportunity)?;
            }
        }

        let agreement_type = new.agreement_type.trim();
        if agreement_type.is_empty() {
            let failure = ValidationFailure::Invalid("agreement type is required".to_string());
            return Err(failure.into());
        }

        let catalog = self.catalog_snapshot().await?;
        let stage = match new.stage {
            Some(id) => catalog
                .stage(id)
                .filter(|stage| stage.active)
                .ok_or_else(|| FunnelError::not_found("active stage", id))?,
            None => catalog
                .first_active_stage()
                .ok_or_else(|| FunnelError::Config("funnel has no active stages".to_string()))?,
        };

        let fields = new
            .fields
            .into_iter()
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .filter(|(name, value)| !name.is_empty() && !value.is_empty())
            .collect();

        let opportunity = self
            .store
            .insert_opportunity(OpportunityDraft {
                owner: new.owner,
                stage: stage.id,
                entered_stage_at: self.clock.now().trunc_subsecs(6),
                agreement_type: agreement_type.to_string(),
                fields,
            })
            .await
            .map_err(persistence)?;

        info!(
            event_name = "funnel.opportunity.created",
            correlation_id = %ctx.correlation_id,
            opportunity_id = %opportunity.id,
            stage_id = %stage.id,
            pooled = opportunity.in_pool(),
            "opportunity created"
        );
        Ok(opportunity)
    }

    /// Reads one opportunity, closed ones included.
    pub async fn get_opportunity(
        &self,
        id: OpportunityId,
    ) -> Result<Opportunity, ApplicationError> {
        self.store
            .find_opportunity(id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| FunnelError::not_found("opportunity", id).into())
    }

    pub async fn history(&self, id: OpportunityId) -> Result<Vec<HistoryEntry>, ApplicationError> {
        self.get_opportunity(id).await?;
        self.store.history_for(id).await.map_err(persistence)
    }

    /// Every required field the opportunity still lacks for its agreement type.
    pub async fn missing_fields(&self, id: OpportunityId) -> Result<Vec<String>, ApplicationError> {
        let opportunity = self.get_opportunity(id).await?;
        let catalog = self.catalog_snapshot().await?;
        Ok(missing_fields(&opportunity, &catalog.field_rules_for(&opportunity.agreement_type)))
    }

    pub async fn list_pool(
        &self,
        ctx: &RequestContext,
        limit: u32,
    ) -> Result<Vec<Opportunity>, ApplicationError> {
        self.require(ctx, Capability::ClaimFromPool)?;
        self.store.list_pool(limit.clamp(1, MAX_POOL_PAGE)).await.map_err(persistence)
    }

    /// Executes a manual transition and returns the committed opportunity.
    pub async fn execute_transition(
        &self,
        ctx: &RequestContext,
        opportunity_id: OpportunityId,
        transition_id: TransitionId,
        note: Option<&str>,
    ) -> Result<Opportunity, ApplicationError> {
        let result = self.try_execute_transition(ctx, opportunity_id, transition_id, note).await;
        self.audit_result(
            ctx,
            Some(opportunity_id),
            "funnel.transition",
            AuditCategory::Transition,
            &result,
        );
        result
    }

    async fn try_execute_transition(
        &self,
        ctx: &RequestContext,
        opportunity_id: OpportunityId,
        transition_id: TransitionId,
        note: Option<&str>,
    ) -> Result<Opportunity, ApplicationError> {
        let opportunity = self.get_opportunity(opportunity_id).await?;
        let catalog = self.catalog_snapshot().await?;
        let transition = catalog
            .transition(transition_id)
            .ok_or_else(|| FunnelError::not_found("transition", transition_id))?;
        let destination = catalog
            .stage(transition.destination_stage)
            .filter(|stage| stage.active)
            .ok_or_else(|| FunnelError::not_found("active stage", transition.destination_stage))?;

        let field_rules = catalog.field_rules_for(&opportunity.agreement_type);
        let authorization = self.evaluator.evaluate_transition(
            &opportunity,
            transition,
            destination,
            &ctx.actor,
            note,
            &field_rules,
        )?;

        let terminal = catalog.is_terminal_exit(transition, destination);
        let mutation = authorization.into_mutation(terminal, self.clock.now());
        let previous_stage = opportunity.current_stage;
        let updated = self.commit(mutation, "moved since it was read; re-evaluate").await?;

        info!(
            event_name = "funnel.transition.committed",
            correlation_id = %ctx.correlation_id,
            opportunity_id = %updated.id,
            transition_id = %transition.id,
            from_stage = %previous_stage,
            to_stage = %updated.current_stage,
            returned_to_pool = transition.returns_to_pool,
            closed = !updated.active,
            "transition committed"
        );
        self.notify(ctx, &updated, previous_stage, HistoryKind::StageChange).await;
        Ok(updated)
    }

    pub async fn claim(
        &self,
        ctx: &RequestContext,
        opportunity_id: OpportunityId,
    ) -> Result<Opportunity, ApplicationError> {
        let result = self.try_claim(ctx, opportunity_id).await;
        self.audit_result(ctx, Some(opportunity_id), "pool.claim", AuditCategory::Pool, &result);
        result
    }

    async fn try_claim(
        &self,
        ctx: &RequestContext,
        opportunity_id: OpportunityId,
    ) -> Result<Opportunity, ApplicationError> {
        let opportunity = self.get_opportunity(opportunity_id).await?;
        let mutation = self.pool.plan_claim(&opportunity, &ctx.actor, self.clock.now())?;
        self.commit(mutation, "was claimed by someone else first").await
    }

    /// Returns the opportunity to the pool. Releasing a pooled opportunity is a no-op.
    pub async fn release(
        &self,
        ctx: &RequestContext,
        opportunity_id: OpportunityId,
    ) -> Result<Opportunity, ApplicationError> {
        let result = self.try_release(ctx, opportunity_id).await;
        self.audit_result(ctx, Some(opportunity_id), "pool.release", AuditCategory::Pool, &result);
        result
    }

    async fn try_release(
        &self,
        ctx: &RequestContext,
        opportunity_id: OpportunityId,
    ) -> Result<Opportunity, ApplicationError> {
        let opportunity = self.get_opportunity(opportunity_id).await?;
        match self.pool.plan_release(&opportunity, &ctx.actor, self.clock.now())? {
            Some(mutation) => self.commit(mutation, "changed owner since it was read").await,
            None => Ok(opportunity),
        }
    }

    pub async fn reassign(
        &self,
        ctx: &RequestContext,
        opportunity_id: OpportunityId,
        new_owner: UserId,
        note: Option<&str>,
    ) -> Result<Opportunity, ApplicationError> {
        let result = self.try_reassign(ctx, opportunity_id, new_owner, note).await;
        self.audit_result(
            ctx,
            Some(opportunity_id),
            "pool.reassign",
            AuditCategory::Pool,
            &result,
        );
        result
    }

    async fn try_reassign(
        &self,
        ctx: &RequestContext,
        opportunity_id: OpportunityId,
        new_owner: UserId,
        note: Option<&str>,
    ) -> Result<Opportunity, ApplicationError> {
        let opportunity = self.get_opportunity(opportunity_id).await?;
        let catalog = self.catalog_snapshot().await?;
        let stage = catalog
            .stage(opportunity.current_stage)
            .ok_or_else(|| FunnelError::not_found("stage", opportunity.current_stage))?;
        let mutation = self.pool.plan_reassign(
            &opportunity,
            stage,
            new_owner,
            &ctx.actor,
            note,
            self.clock.now(),
        )?;
        self.commit(mutation, "changed owner since it was read").await
    }

    /// All stages, inactive ones included.
    pub async fn admin_list_stages(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<Stage>, ApplicationError> {
        self.require(ctx, Capability::AdministerCatalog)?;
        Ok(self.catalog_snapshot().await?.stages.clone())
    }

    pub async fn create_stage(
        &self,
        ctx: &RequestContext,
        new: NewStage,
    ) -> Result<Stage, ApplicationError> {
        let result = self.try_create_stage(ctx, new).await;
        self.audit_catalog(ctx, "catalog.stage.create", &result, |stage| stage.id.to_string());
        result
    }

    async fn try_create_stage(
        &self,
        ctx: &RequestContext,
        new: NewStage,
    ) -> Result<Stage, ApplicationError> {
        self.require(ctx, Capability::AdministerCatalog)?;
        let existing = self.store.list_stages(true).await.map_err(persistence)?;
        validate_new_stage(&new, &existing)?;
        let stage = self.store.insert_stage(new).await.map_err(catalog_write)?;
        self.catalog.invalidate().await;
        Ok(stage)
    }

    pub async fn update_stage(
        &self,
        ctx: &RequestContext,
        id: StageId,
        patch: StagePatch,
    ) -> Result<Stage, ApplicationError> {
        let result = self.try_update_stage(ctx, id, patch).await;
        self.audit_catalog(ctx, "catalog.stage.update", &result, |stage| stage.id.to_string());
        result
    }

    async fn try_update_stage(
        &self,
        ctx: &RequestContext,
        id: StageId,
        patch: StagePatch,
    ) -> Result<Stage, ApplicationError> {
        self.require(ctx, Capability::AdministerCatalog)?;
        let existing = self.store.list_stages(true).await.map_err(persistence)?;
        let current = existing
            .iter()
            .find(|stage| stage.id == id)
            .ok_or_else(|| FunnelError::not_found("stage", id))?;
        let next = apply_stage_patch(current, patch, &existing)?;
        self.store.update_stage(next.clone()).await.map_err(catalog_write)?;
        self.catalog.invalidate().await;
        Ok(next)
    }

    /// All transitions, inactive ones included.
    pub async fn admin_list_transitions(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<Transition>, ApplicationError> {
        self.require(ctx, Capability::AdministerCatalog)?;
        Ok(self.catalog_snapshot().await?.transitions.clone())
    }

    pub async fn create_transition(
        &self,
        ctx: &RequestContext,
        new: NewTransition,
    ) -> Result<Transition, ApplicationError> {
        let result = self.try_create_transition(ctx, new).await;
        self.audit_catalog(ctx, "catalog.transition.create", &result, |transition| {
            transition.id.to_string()
        });
        result
    }

    async fn try_create_transition(
        &self,
        ctx: &RequestContext,
        new: NewTransition,
    ) -> Result<Transition, ApplicationError> {
        self.require(ctx, Capability::AdministerCatalog)?;
        let stages = self.store.list_stages(true).await.map_err(persistence)?;
        let transitions = self.store.list_transitions(None, true).await.map_err(persistence)?;
        validate_new_transition(&new, &stages, &transitions)?;
        let transition = self.store.insert_transition(new).await.map_err(catalog_write)?;
        self.catalog.invalidate().await;
        Ok(transition)
    }

    pub async fn update_transition(
        &self,
        ctx: &RequestContext,
        id: TransitionId,
        patch: TransitionPatch,
    ) -> Result<Transition, ApplicationError> {
        let result = self.try_update_transition(ctx, id, patch).await;
        self.audit_catalog(ctx, "catalog.transition.update", &result, |transition| {
            transition.id.to_string()
        });
        result
    }

    async fn try_update_transition(
        &self,
        ctx: &RequestContext,
        id: TransitionId,
        patch: TransitionPatch,
    ) -> Result<Transition, ApplicationError> {
        self.require(ctx, Capability::AdministerCatalog)?;
        let stages = self.store.list_stages(true).await.map_err(persistence)?;
        let transitions = self.store.list_transitions(None, true).await.map_err(persistence)?;
        let current = transitions
            .iter()
            .find(|transition| transition.id == id)
            .ok_or_else(|| FunnelError::not_found("transition", id))?;
        let next = apply_transition_patch(current, patch, &stages, &transitions)?;
        self.store.update_transition(next.clone()).await.map_err(catalog_write)?;
        self.catalog.invalidate().await;
        Ok(next)
    }

    pub async fn list_field_rules(
        &self,
        ctx: &RequestContext,
        agreement_type: Option<&str>,
    ) -> Result<Vec<AgreementFieldRule>, ApplicationError> {
        self.require(ctx, Capability::AdministerCatalog)?;
        self.store.list_field_rules(agreement_type).await.map_err(persistence)
    }

    pub async fn upsert_field_rule(
        &self,
        ctx: &RequestContext,
        rule: NewFieldRule,
    ) -> Result<AgreementFieldRule, ApplicationError> {
        let result = self.try_upsert_field_rule(ctx, rule).await;
        self.audit_catalog(ctx, "catalog.field_rule.upsert", &result, |saved| {
            saved.id.0.to_string()
        });
        result
    }

    async fn try_upsert_field_rule(
        &self,
        ctx: &RequestContext,
        rule: NewFieldRule,
    ) -> Result<AgreementFieldRule, ApplicationError> {
        self.require(ctx, Capability::AdministerCatalog)?;
        validate_field_rule(&rule)?;
        let rule = NewFieldRule {
            agreement_type: rule.agreement_type.trim().to_string(),
            field_name: rule.field_name.trim().to_string(),
            required: rule.required,
        };
        let saved = self.store.upsert_field_rule(rule).await.map_err(catalog_write)?;
        self.catalog.invalidate().await;
        Ok(saved)
    }

    pub async fn delete_field_rule(
        &self,
        ctx: &RequestContext,
        id: FieldRuleId,
    ) -> Result<(), ApplicationError> {
        let result = self.try_delete_field_rule(ctx, id).await;
        self.audit_catalog(ctx, "catalog.field_rule.delete", &result, |_| id.0.to_string());
        result
    }

    async fn try_delete_field_rule(
        &self,
        ctx: &RequestContext,
        id: FieldRuleId,
    ) -> Result<(), ApplicationError> {
        self.require(ctx, Capability::AdministerCatalog)?;
        if !self.store.delete_field_rule(id).await.map_err(persistence)? {
            return Err(FunnelError::not_found("field rule", id.0).into());
        }
        self.catalog.invalidate().await;
        Ok(())
    }

    fn require(
        &self,
        ctx: &RequestContext,
        capability: Capability,
    ) -> Result<(), ApplicationError> {
        self.evaluator.capabilities().require(&ctx.actor, capability)?;
        Ok(())
    }

    pub(crate) async fn commit(
        &self,
        mutation: OpportunityMutation,
        stale_detail: &str,
    ) -> Result<Opportunity, ApplicationError> {
        let opportunity_id = mutation.opportunity_id;
        match self.store.conditional_update(mutation).await.map_err(persistence)? {
            ConditionalUpdate::Applied(opportunity) => Ok(opportunity),
            ConditionalUpdate::Stale => Err(FunnelError::Conflict(format!(
                "opportunity `{opportunity_id}` {stale_detail}"
            ))
            .into()),
        }
    }

    pub(crate) async fn notify(
        &self,
        ctx: &RequestContext,
        updated: &Opportunity,
        previous_stage: StageId,
        kind: HistoryKind,
    ) {
        self.notifier
            .stage_changed(StageChangeNotice {
                opportunity_id: updated.id,
                stage_id: updated.current_stage,
                previous_stage_id: previous_stage,
                owner: updated.owner,
                kind,
                correlation_id: ctx.correlation_id.clone(),
                occurred_at: updated.entered_stage_at,
            })
            .await;
    }

    fn audit_result<T>(
        &self,
        ctx: &RequestContext,
        opportunity_id: Option<OpportunityId>,
        operation: &str,
        category: AuditCategory,
        result: &Result<T, ApplicationError>,
    ) {
        let (suffix, outcome) = match result {
            Ok(_) => ("applied", AuditOutcome::Success),
            Err(error) => outcome_of(error),
        };
        let mut event = AuditEvent::new(
            opportunity_id,
            ctx.correlation_id.clone(),
            format!("{operation}.{suffix}"),
            category,
            ctx.actor.label(),
            outcome,
        );
        if let Err(error) = result {
            event = event.with_metadata("error", error);
            if let Some(funnel) = error.funnel() {
                event = event.with_metadata("error_kind", funnel.kind());
            }
        }
        self.audit.emit(event);
    }

    fn audit_catalog<T>(
        &self,
        ctx: &RequestContext,
        operation: &str,
        result: &Result<T, ApplicationError>,
        entity_id: impl FnOnce(&T) -> String,
    ) {
        let (suffix, outcome) = match result {
            Ok(_) => ("applied", AuditOutcome::Success),
            Err(error) => outcome_of(error),
        };
        let mut event = AuditEvent::new(
            None,
            ctx.correlation_id.clone(),
            format!("{operation}.{suffix}"),
            AuditCategory::Catalog,
            ctx.actor.label(),
            outcome,
        );
        match result {
            Ok(value) => event = event.with_metadata("entity_id", entity_id(value)),
            Err(error) => event = event.with_metadata("error", error),
        }
        self.audit.emit(event);
    }
}

fn outcome_of(error: &ApplicationError) -> (&'static str, AuditOutcome) {
    match error {
        ApplicationError::Funnel(FunnelError::Conflict(_)) => ("conflict", AuditOutcome::Conflict),
        ApplicationError::Funnel(_) => ("rejected", AuditOutcome::Rejected),
        _ => ("failed", AuditOutcome::Failed),
    }
}

pub(crate) fn persistence(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}

/// Catalog writes that trip a store constraint are configuration mistakes, not outages.
fn catalog_write(error: RepositoryError) -> ApplicationError {
    match error {
        RepositoryError::Constraint(detail) => FunnelError::Config(detail).into(),
        other => persistence(other),
    }
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use embudo_core::audit::{AuditOutcome, InMemoryAuditSink};
    use embudo_core::domain::actor::{Actor, Role, UserId};
    use embudo_core::domain::agreement::NewFieldRule;
    use embudo_core::domain::history::HistoryKind;
    use embudo_core::domain::opportunity::{NewOpportunity, Opportunity};
    use embudo_core::domain::stage::{NewStage, Stage, StageId, StagePatch, StageType};
    use embudo_core::domain::transition::{NewTransition, Transition, TransitionPatch};
    use embudo_core::errors::{ApplicationError, FunnelError, ValidationFailure};
    use embudo_core::patch::Patch;
    use embudo_db::InMemoryFunnelStore;

    use super::{FunnelService, RequestContext};
    use crate::clock::{Clock, FixedClock};
    use crate::notifier::RecordingNotifier;

    struct Harness {
        service: FunnelService,
        audit: InMemoryAuditSink,
        notifier: RecordingNotifier,
        clock: Arc<FixedClock>,
    }

    impl Harness {
        fn new() -> Self {
            let audit = InMemoryAuditSink::default();
            let notifier = RecordingNotifier::default();
            let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single();
            let clock = Arc::new(FixedClock::new(start.expect("valid timestamp")));
            let service = FunnelService::new(Arc::new(InMemoryFunnelStore::new()))
                .with_audit_sink(Arc::new(audit.clone()))
                .with_notifier(Arc::new(notifier.clone()))
                .with_clock(clock.clone());
            Self { service, audit, notifier, clock }
        }

        async fn stage(&self, name: &str, order: i32, exit: bool, idle: Option<i64>) -> Stage {
            let stage_type = if exit { StageType::Exit } else { StageType::Advance };
            self.service
                .create_stage(&admin(), new_stage(name, order, stage_type, idle))
                .await
                .expect("create stage")
        }

        async fn edge(&self, transition: NewTransition) -> Transition {
            self.service.create_transition(&admin(), transition).await.expect("create transition")
        }

        async fn owned_by(&self, owner: i64) -> Opportunity {
            let new = NewOpportunity {
                agreement_type: "IMSS".to_string(),
                owner: Some(UserId(owner)),
                ..NewOpportunity::default()
            };
            self.service.create_opportunity(&promoter(owner), new).await.expect("intake")
        }
    }

    fn admin() -> RequestContext {
        RequestContext::with_correlation_id(Actor::user(UserId(1), Role::Admin), "req-admin")
    }

    fn promoter(id: i64) -> RequestContext {
        RequestContext::with_correlation_id(Actor::user(UserId(id), Role::Promoter), "req-promoter")
    }

    fn supervisor() -> RequestContext {
        RequestContext::with_correlation_id(Actor::user(UserId(50), Role::Supervisor), "req-sup")
    }

    fn new_stage(name: &str, order: i32, stage_type: StageType, idle: Option<i64>) -> NewStage {
        NewStage {
            name: name.to_string(),
            order,
            stage_type,
            idle_timeout_hours: idle,
            color: "#1565c0".to_string(),
        }
    }

    fn plain_edge(origin: StageId, destination: StageId, action: &str) -> NewTransition {
        NewTransition {
            origin_stage: origin,
            destination_stage: destination,
            action_name: action.to_string(),
            requires_note: false,
            requires_supervisor: false,
            returns_to_pool: false,
            is_default: false,
        }
    }

    fn funnel_error(result: Result<impl std::fmt::Debug, ApplicationError>) -> FunnelError {
        match result {
            Err(ApplicationError::Funnel(error)) => error,
            other => panic!("expected a funnel error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn noted_transition_rejects_blank_note_then_commits() {
        let h = Harness::new();
        let contact = h.stage("Contacto", 1, false, None).await;
        let follow = h.stage("Seguimiento", 2, false, None).await;
        let mut noted = plain_edge(contact.id, follow.id, "Dar seguimiento");
        noted.requires_note = true;
        let noted = h.edge(noted).await;
        let created = h.owned_by(7).await;

        let blank =
            h.service.execute_transition(&promoter(7), created.id, noted.id, Some("  ")).await;
        assert!(matches!(
            funnel_error(blank),
            FunnelError::Validation(ValidationFailure::MissingNote { .. })
        ));
        assert_eq!(h.service.get_opportunity(created.id).await.expect("read"), created);

        h.clock.advance(Duration::minutes(5));
        let moved = h
            .service
            .execute_transition(&promoter(7), created.id, noted.id, Some("followed up"))
            .await
            .expect("commit");
        assert_eq!(moved.current_stage, follow.id);
        assert_eq!(moved.entered_stage_at, h.clock.now());
        assert_eq!(moved.owner, Some(UserId(7)));

        let history = h.service.history(created.id).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, HistoryKind::StageChange);
        assert_eq!(history[0].note.as_deref(), Some("followed up"));

        let notices = h.notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].stage_id, follow.id);
        assert_eq!(notices[0].previous_stage_id, contact.id);
        assert_eq!(h.audit.events_of("funnel.transition.rejected").len(), 1);
        assert_eq!(h.audit.events_of("funnel.transition.applied").len(), 1);
    }

    #[tokio::test]
    async fn supervisor_gate_blocks_promoters_and_admits_supervisors() {
        let h = Harness::new();
        let open = h.stage("Interesado", 1, false, None).await;
        let dropped = h.stage("Descartado", 2, true, None).await;
        let mut gated = plain_edge(open.id, dropped.id, "Descartar");
        gated.requires_supervisor = true;
        let gated = h.edge(gated).await;
        let created = h.owned_by(7).await;

        let denied = h.service.execute_transition(&promoter(7), created.id, gated.id, None).await;
        assert!(matches!(funnel_error(denied), FunnelError::Authorization { .. }));
        assert_eq!(h.service.get_opportunity(created.id).await.expect("read"), created);

        let closed = h
            .service
            .execute_transition(&supervisor(), created.id, gated.id, None)
            .await
            .expect("supervisor approves");
        assert_eq!(closed.current_stage, dropped.id);
        assert!(!closed.active, "exit without outgoing edges closes the opportunity");

        let after_close = h.service.claim(&promoter(8), created.id).await;
        assert!(matches!(funnel_error(after_close), FunnelError::NotFound(_)));
    }

    #[tokio::test]
    async fn pool_returning_transition_clears_owner_and_keeps_row_active() {
        let h = Harness::new();
        let start = h.stage("Asignado", 1, false, None).await;
        let lost = h.stage("No contactado", 2, true, None).await;
        let mut back = plain_edge(start.id, lost.id, "No se logro contactar");
        back.returns_to_pool = true;
        let back = h.edge(back).await;
        let created = h.owned_by(7).await;

        let moved = h
            .service
            .execute_transition(&promoter(7), created.id, back.id, None)
            .await
            .expect("commit");
        assert_eq!(moved.owner, None);
        assert!(moved.active);

        let pool = h.service.list_pool(&promoter(8), 10).await.expect("pool");
        let pooled: Vec<_> = pool.iter().map(|opportunity| opportunity.id).collect();
        assert_eq!(pooled, vec![created.id]);
    }

    #[tokio::test]
    async fn transition_into_incomplete_advance_stage_names_missing_field() {
        let h = Harness::new();
        let first = h.stage("Contactado", 1, false, None).await;
        let second = h.stage("Interesado", 2, false, None).await;
        let forward = h.edge(plain_edge(first.id, second.id, "Avanzar")).await;
        let rule = NewFieldRule {
            agreement_type: " IMSS ".to_string(),
            field_name: "nss".to_string(),
            required: true,
        };
        let saved = h.service.upsert_field_rule(&admin(), rule).await.expect("rule");
        assert_eq!(saved.agreement_type, "IMSS");

        let new = NewOpportunity {
            agreement_type: "IMSS".to_string(),
            owner: Some(UserId(7)),
            fields: BTreeMap::from([("phone".to_string(), "5512345678".to_string())]),
            stage: None,
        };
        let created = h.service.create_opportunity(&promoter(7), new).await.expect("intake");
        assert_eq!(h.service.missing_fields(created.id).await.expect("hints"), vec!["nss"]);

        let blocked =
            h.service.execute_transition(&promoter(7), created.id, forward.id, None).await;
        assert!(matches!(
            funnel_error(blocked),
            FunnelError::Validation(ValidationFailure::MissingRequiredField { ref field, .. })
                if field == "nss"
        ));
    }

    #[tokio::test]
    async fn promoters_cannot_move_someone_elses_opportunity() {
        let h = Harness::new();
        let first = h.stage("Contactado", 1, false, None).await;
        let second = h.stage("Interesado", 2, false, None).await;
        let forward = h.edge(plain_edge(first.id, second.id, "Avanzar")).await;
        let created = h.owned_by(7).await;

        let denied = h.service.execute_transition(&promoter(8), created.id, forward.id, None).await;
        assert!(matches!(funnel_error(denied), FunnelError::Authorization { .. }));
    }

    #[tokio::test]
    async fn claim_then_release_round_trips_through_the_pool() {
        let h = Harness::new();
        let start = h.stage("Asignado", 1, false, Some(72)).await;
        let pooled = NewOpportunity { agreement_type: "ISSSTE".to_string(), ..Default::default() };
        let created = h.service.create_opportunity(&admin(), pooled).await.expect("intake");
        assert!(created.in_pool());

        let claimed = h.service.claim(&promoter(7), created.id).await.expect("claim");
        assert_eq!(claimed.owner, Some(UserId(7)));

        let second = h.service.claim(&promoter(8), created.id).await;
        assert!(matches!(funnel_error(second), FunnelError::Conflict(_)));

        let released = h.service.release(&promoter(7), created.id).await.expect("release");
        assert_eq!(released.owner, None);
        assert_eq!(released.current_stage, start.id);
        assert_eq!(released.entered_stage_at, created.entered_stage_at);

        let again = h.service.release(&promoter(7), created.id).await.expect("no-op release");
        assert_eq!(again, released);

        let history = h.service.history(created.id).await.expect("history");
        let kinds: Vec<HistoryKind> = history.into_iter().map(|entry| entry.kind).collect();
        assert_eq!(kinds, vec![HistoryKind::Claim, HistoryKind::Release]);

        let conflicts = h.audit.events_of("pool.claim.conflict");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].outcome, AuditOutcome::Conflict);
    }

    #[tokio::test]
    async fn reassign_requires_capability_and_a_new_owner() {
        let h = Harness::new();
        h.stage("Asignado", 1, false, None).await;
        let created = h.owned_by(7).await;

        let denied = h.service.reassign(&promoter(7), created.id, UserId(9), None).await;
        assert!(matches!(funnel_error(denied), FunnelError::Authorization { .. }));

        let same = h.service.reassign(&supervisor(), created.id, UserId(7), None).await;
        assert!(matches!(funnel_error(same), FunnelError::Validation(_)));

        let moved = h
            .service
            .reassign(&supervisor(), created.id, UserId(9), Some("cartera redistribuida"))
            .await
            .expect("reassign");
        assert_eq!(moved.owner, Some(UserId(9)));
        let history = h.service.history(created.id).await.expect("history");
        assert_eq!(history[0].kind, HistoryKind::Reassignment);
        assert_eq!(history[0].note.as_deref(), Some("cartera redistribuida"));
    }

    #[tokio::test]
    async fn catalog_admin_enforces_order_timeout_and_single_default() {
        let h = Harness::new();
        let first = h.stage("Asignado", 1, false, Some(24)).await;
        let exit = h.stage("Sin respuesta", 2, true, None).await;

        let clash =
            h.service.create_stage(&admin(), new_stage("Doble", 1, StageType::Advance, None)).await;
        assert!(matches!(funnel_error(clash), FunnelError::Config(_)));

        let zero_timeout = new_stage("Cero", 3, StageType::Advance, Some(0));
        let zero = h.service.create_stage(&admin(), zero_timeout).await;
        assert!(matches!(funnel_error(zero), FunnelError::Config(_)));

        let outsider = new_stage("Nuevo", 4, StageType::Advance, None);
        let denied = h.service.create_stage(&supervisor(), outsider).await;
        assert!(matches!(funnel_error(denied), FunnelError::Authorization { .. }));

        let mut timer = plain_edge(first.id, exit.id, "Timer vencido");
        timer.is_default = true;
        h.edge(timer.clone()).await;
        let second_default = h.service.create_transition(&admin(), timer).await;
        assert!(matches!(funnel_error(second_default), FunnelError::Config(_)));

        let dangling = plain_edge(first.id, StageId(999), "Nada");
        let missing = h.service.create_transition(&admin(), dangling).await;
        assert!(matches!(funnel_error(missing), FunnelError::NotFound(_)));

        let clear_timeout = StagePatch { idle_timeout_hours: Patch::Null, ..StagePatch::default() };
        let cleared =
            h.service.update_stage(&admin(), first.id, clear_timeout).await.expect("patch");
        assert_eq!(cleared.idle_timeout_hours, None);
        assert_eq!(cleared.name, "Asignado");

        let clear_name = StagePatch { name: Patch::Null, ..StagePatch::default() };
        let rejected = h.service.update_stage(&admin(), first.id, clear_name).await;
        assert!(matches!(funnel_error(rejected), FunnelError::Config(_)));

        let stages = h.service.list_stages().await.expect("stages");
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].idle_timeout_hours, None, "cache reloads after an admin write");
    }

    #[tokio::test]
    async fn deactivated_transition_leaves_listing_and_execution() {
        let h = Harness::new();
        let first = h.stage("Contactado", 1, false, None).await;
        let second = h.stage("Interesado", 2, false, None).await;
        let forward = h.edge(plain_edge(first.id, second.id, "Avanzar")).await;
        assert_eq!(h.service.list_transitions(first.id).await.expect("list").len(), 1);

        let deactivate =
            TransitionPatch { active: Patch::Value(false), ..TransitionPatch::default() };
        h.service.update_transition(&admin(), forward.id, deactivate).await.expect("deactivate");
        assert!(h.service.list_transitions(first.id).await.expect("list").is_empty());
        assert_eq!(h.service.admin_list_transitions(&admin()).await.expect("all").len(), 1);

        let created = h.owned_by(7).await;
        let inactive =
            h.service.execute_transition(&promoter(7), created.id, forward.id, None).await;
        assert!(matches!(funnel_error(inactive), FunnelError::NotFound(_)));
    }

    #[tokio::test]
    async fn intake_without_active_stages_is_a_config_error() {
        let h = Harness::new();
        let pooled = NewOpportunity { agreement_type: "IMSS".to_string(), ..Default::default() };
        let empty = h.service.create_opportunity(&admin(), pooled).await;
        assert!(matches!(funnel_error(empty), FunnelError::Config(_)));
    }

    #[tokio::test]
    async fn intake_rejects_a_blank_agreement_type() {
        let h = Harness::new();
        h.stage("Asignado", 1, false, None).await;
        let blank = NewOpportunity { agreement_type: "   ".to_string(), ..Default::default() };
        let rejected = h.service.create_opportunity(&admin(), blank).await;
        assert!(matches!(
            funnel_error(rejected),
            FunnelError::Validation(ValidationFailure::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn owner_decision_goes_stale_when_the_opportunity_is_reassigned() {
        let h = Harness::new();
        let contact = h.stage("Contacto", 1, false, None).await;
        let follow = h.stage("Seguimiento", 2, false, None).await;
        let edge = h.edge(plain_edge(contact.id, follow.id, "Dar seguimiento")).await;
        let opportunity = h.owned_by(7).await;

        let authorization = h
            .service
            .evaluator
            .evaluate_transition(&opportunity, &edge, &follow, &promoter(7).actor, None, &[])
            .expect("owner may move");
        h.service
            .reassign(&supervisor(), opportunity.id, UserId(99), Some("cobertura"))
            .await
            .expect("reassign");

        let mutation = authorization.into_mutation(false, h.clock.now());
        let stale = h.service.commit(mutation, "changed owner since it was read").await;
        assert!(matches!(funnel_error(stale), FunnelError::Conflict(_)));

        let current = h.service.get_opportunity(opportunity.id).await.expect("read");
        assert_eq!(current.owner, Some(UserId(99)));
        assert_eq!(current.current_stage, contact.id);
    }

    #[tokio::test]
    async fn deleting_an_unknown_field_rule_is_not_found() {
        let h = Harness::new();
        let missing = h.service.delete_field_rule(&admin(), super::FieldRuleId(41)).await;
        assert!(matches!(funnel_error(missing), FunnelError::NotFound(_)));
    }
}
