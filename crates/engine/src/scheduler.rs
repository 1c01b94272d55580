//! Timer-driven escalation.
//!
//! One sweep: read the catalog once, then page through due candidates (SCANNING) and
//! commit each against the snapshot it was read with (APPLYING). Items are
//! independent; a skip or conflict on one never stops the others.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use embudo_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use embudo_core::config::SchedulerConfig;
use embudo_core::domain::actor::Actor;
use embudo_core::domain::history::HistoryKind;
use embudo_core::domain::opportunity::Opportunity;
use embudo_core::errors::{ApplicationError, FunnelError, ValidationFailure};
use embudo_core::funnel::escalation::{idle_elapsed, select_default_transition};
use embudo_core::{CatalogSnapshot, SkipReason, SweepPhase, SweepReport};
use embudo_db::repositories::{CandidateCursor, OpportunityRepository};

use crate::clock::Clock;
use crate::service::{persistence, FunnelService, RequestContext};

enum ItemOutcome {
    Escalated,
    Conflict,
    Skipped(SkipReason),
}

pub struct EscalationScheduler {
    service: Arc<FunnelService>,
    interval: Duration,
    batch_limit: u32,
    phase: Mutex<SweepPhase>,
    sweep_lock: tokio::sync::Mutex<()>,
}

impl EscalationScheduler {
    pub fn new(service: Arc<FunnelService>, interval: Duration, batch_limit: u32) -> Self {
        Self {
            service,
            interval,
            batch_limit: batch_limit.max(1),
            phase: Mutex::new(SweepPhase::Idle),
            sweep_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(service: Arc<FunnelService>, config: &SchedulerConfig) -> Self {
        Self::new(service, Duration::from_secs(config.interval_secs), config.batch_limit)
    }

    pub fn phase(&self) -> SweepPhase {
        match self.phase.lock() {
            Ok(phase) => *phase,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_phase(&self, next: SweepPhase) {
        match self.phase.lock() {
            Ok(mut phase) => *phase = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Ticks until `shutdown` flips to true. Shutdown is observed between ticks; a sweep
    /// that has started runs to completion.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            event_name = "scheduler.started",
            interval_secs = self.interval.as_secs(),
            batch_limit = self.batch_limit,
            "escalation scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.service.clock().now();
                    if let Err(error) = self.sweep_once(now).await {
                        warn!(
                            event_name = "scheduler.sweep.failed",
                            error = %error,
                            "escalation sweep failed; retrying next tick"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(event_name = "scheduler.stopped", "escalation scheduler stopped");
    }

    /// Runs one sweep as of `now`. Only a failure to read the catalog or the first
    /// candidate page is an error; per-item problems land in the report.
    ///
    /// Candidates are paged by `(entered_stage_at, id)`, so items that keep being
    /// skipped never hide later due items. `batch_limit` bounds both the page size and
    /// the number of commits attempted in one sweep.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, ApplicationError> {
        let _sweep = self.sweep_lock.lock().await;
        let ctx = RequestContext::with_correlation_id(
            Actor::system(),
            format!("sweep-{}", Uuid::new_v4()),
        );

        self.set_phase(SweepPhase::Scanning);
        let catalog = match self.service.catalog_snapshot().await {
            Ok(catalog) => catalog,
            Err(error) => {
                self.set_phase(SweepPhase::Idle);
                return Err(error);
            }
        };

        let mut report = SweepReport::default();
        let mut processed = HashSet::new();
        let mut cursor = None;
        let mut attempted = 0u32;
        loop {
            self.set_phase(SweepPhase::Scanning);
            let page = match self.page(now, cursor).await {
                Ok(page) => page,
                Err(error) if cursor.is_none() => {
                    self.set_phase(SweepPhase::Idle);
                    return Err(error);
                }
                Err(error) => {
                    warn!(
                        event_name = "scheduler.sweep.page_failed",
                        correlation_id = %ctx.correlation_id,
                        error = %error,
                        "candidate page failed; remaining items wait for the next tick"
                    );
                    break;
                }
            };
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(CandidateCursor::after(last));
            let exhausted = page.len() < self.batch_limit as usize;
            report.scanned += page.len();
            self.set_phase(SweepPhase::Applying);

            for opportunity in page {
                if attempted >= self.batch_limit {
                    break;
                }
                if !processed.insert(opportunity.id) {
                    continue;
                }
                let Some(stage) = catalog.stage(opportunity.current_stage) else {
                    report.skip(opportunity.id, SkipReason::StageMissing);
                    continue;
                };
                if !idle_elapsed(&opportunity, stage, now) {
                    continue;
                }

                match self.escalate(&ctx, &catalog, &opportunity, now).await {
                    ItemOutcome::Escalated => {
                        attempted += 1;
                        report.escalated.push(opportunity.id);
                    }
                    ItemOutcome::Conflict => {
                        attempted += 1;
                        report.conflicts.push(opportunity.id);
                    }
                    ItemOutcome::Skipped(reason) => {
                        warn!(
                            event_name = "scheduler.item.skipped",
                            correlation_id = %ctx.correlation_id,
                            opportunity_id = %opportunity.id,
                            stage_id = %opportunity.current_stage,
                            reason = reason.as_str(),
                            detail = ?reason,
                            "opportunity not escalated"
                        );
                        report.skip(opportunity.id, reason);
                    }
                }
            }

            if exhausted || attempted >= self.batch_limit {
                break;
            }
        }

        self.set_phase(SweepPhase::Idle);
        if report.is_quiet() {
            debug!(
                event_name = "scheduler.sweep.completed",
                correlation_id = %ctx.correlation_id,
                scanned = report.scanned,
                "escalation sweep found nothing due"
            );
        } else {
            info!(
                event_name = "scheduler.sweep.completed",
                correlation_id = %ctx.correlation_id,
                scanned = report.scanned,
                escalated = report.escalated.len(),
                skipped = report.skipped.len(),
                conflicts = report.conflicts.len(),
                "escalation sweep completed"
            );
        }
        Ok(report)
    }

    async fn page(
        &self,
        now: DateTime<Utc>,
        after: Option<CandidateCursor>,
    ) -> Result<Vec<Opportunity>, ApplicationError> {
        self.service
            .store
            .escalation_candidates(now, after, self.batch_limit)
            .await
            .map_err(persistence)
    }

    async fn escalate(
        &self,
        ctx: &RequestContext,
        catalog: &CatalogSnapshot,
        opportunity: &Opportunity,
        now: DateTime<Utc>,
    ) -> ItemOutcome {
        let outcome = self.try_escalate(ctx, catalog, opportunity, now).await;
        self.audit(ctx, opportunity, &outcome);
        outcome
    }

    async fn try_escalate(
        &self,
        ctx: &RequestContext,
        catalog: &CatalogSnapshot,
        opportunity: &Opportunity,
        now: DateTime<Utc>,
    ) -> ItemOutcome {
        let target = match select_default_transition(catalog, opportunity) {
            Ok(target) => target,
            Err(reason) => return ItemOutcome::Skipped(reason),
        };
        let field_rules = catalog.field_rules_for(&opportunity.agreement_type);
        let authorization = match self.service.evaluator.authorize_escalation(
            opportunity,
            target.transition,
            target.destination,
            &field_rules,
        ) {
            Ok(authorization) => authorization,
            Err(error) => return ItemOutcome::Skipped(skip_reason(error)),
        };

        let terminal = catalog.is_terminal_exit(target.transition, target.destination);
        let mutation = authorization.into_mutation(terminal, now);
        match self.service.commit(mutation, "moved before escalation").await {
            Ok(updated) => {
                info!(
                    event_name = "scheduler.item.escalated",
                    correlation_id = %ctx.correlation_id,
                    opportunity_id = %updated.id,
                    transition_id = %target.transition.id,
                    from_stage = %opportunity.current_stage,
                    to_stage = %updated.current_stage,
                    returned_to_pool = updated.in_pool(),
                    "opportunity escalated"
                );
                self.service
                    .notify(ctx, &updated, opportunity.current_stage, HistoryKind::TimerEscalation)
                    .await;
                ItemOutcome::Escalated
            }
            Err(ApplicationError::Funnel(FunnelError::Conflict(detail))) => {
                debug!(
                    event_name = "scheduler.item.conflict",
                    correlation_id = %ctx.correlation_id,
                    opportunity_id = %opportunity.id,
                    detail = %detail,
                    "opportunity moved between scan and commit"
                );
                ItemOutcome::Conflict
            }
            Err(error) => ItemOutcome::Skipped(SkipReason::Persistence(error.to_string())),
        }
    }

    fn audit(&self, ctx: &RequestContext, opportunity: &Opportunity, outcome: &ItemOutcome) {
        let (event_type, audit_outcome) = match outcome {
            ItemOutcome::Escalated => ("funnel.escalation.applied", AuditOutcome::Success),
            ItemOutcome::Conflict => ("funnel.escalation.conflict", AuditOutcome::Conflict),
            ItemOutcome::Skipped(_) => ("funnel.escalation.failed", AuditOutcome::Failed),
        };
        let mut event = AuditEvent::new(
            Some(opportunity.id),
            ctx.correlation_id.clone(),
            event_type,
            AuditCategory::Escalation,
            ctx.actor.label(),
            audit_outcome,
        )
        .with_metadata("from_stage", opportunity.current_stage);
        if let ItemOutcome::Skipped(reason) = outcome {
            event = event.with_metadata("reason", reason.as_str());
        }
        self.service.audit.emit(event);
    }
}

fn skip_reason(error: FunnelError) -> SkipReason {
    match error {
        FunnelError::Validation(ValidationFailure::MissingRequiredField { field, .. }) => {
            SkipReason::MissingField(field)
        }
        other => SkipReason::Rejected(other.to_string()),
    }
}
