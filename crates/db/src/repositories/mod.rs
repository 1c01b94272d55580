use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use embudo_core::domain::actor::UserId;
use embudo_core::domain::agreement::{AgreementFieldRule, FieldRuleId, NewFieldRule};
use embudo_core::domain::history::HistoryEntry;
use embudo_core::domain::mutation::{ConditionalUpdate, OpportunityMutation};
use embudo_core::domain::opportunity::{Opportunity, OpportunityId};
use embudo_core::domain::stage::{NewStage, Stage, StageId};
use embudo_core::domain::transition::{NewTransition, Transition, TransitionId};

pub mod field_rule;
pub mod memory;
pub mod opportunity;
pub mod stage;
pub mod transition;

pub use memory::InMemoryFunnelStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    /// A uniqueness or integrity rule of the store rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// Row values for a new opportunity; the store assigns the id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpportunityDraft {
    pub owner: Option<UserId>,
    pub stage: StageId,
    pub entered_stage_at: DateTime<Utc>,
    pub agreement_type: String,
    pub fields: BTreeMap<String, String>,
}

/// Position in the escalation candidate order; paging resumes strictly after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CandidateCursor {
    pub entered_stage_at: DateTime<Utc>,
    pub id: OpportunityId,
}

impl CandidateCursor {
    pub fn after(opportunity: &Opportunity) -> Self {
        Self { entered_stage_at: opportunity.entered_stage_at, id: opportunity.id }
    }

    fn key(&self) -> (DateTime<Utc>, OpportunityId) {
        (self.entered_stage_at, self.id)
    }

    /// True when `opportunity` sorts after this cursor.
    pub fn precedes(&self, opportunity: &Opportunity) -> bool {
        (opportunity.entered_stage_at, opportunity.id) > self.key()
    }
}

#[async_trait]
pub trait StageRepository: Send + Sync {
    /// Stages ordered by `order`, then id.
    async fn list_stages(&self, include_inactive: bool) -> Result<Vec<Stage>, RepositoryError>;
    async fn find_stage(&self, id: StageId) -> Result<Option<Stage>, RepositoryError>;
    async fn insert_stage(&self, stage: NewStage) -> Result<Stage, RepositoryError>;
    async fn update_stage(&self, stage: Stage) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait TransitionRepository: Send + Sync {
    /// Transitions ordered by id, optionally restricted to one origin stage.
    async fn list_transitions(
        &self,
        origin: Option<StageId>,
        include_inactive: bool,
    ) -> Result<Vec<Transition>, RepositoryError>;
    async fn find_transition(&self, id: TransitionId)
        -> Result<Option<Transition>, RepositoryError>;
    async fn insert_transition(
        &self,
        transition: NewTransition,
    ) -> Result<Transition, RepositoryError>;
    async fn update_transition(&self, transition: Transition) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait FieldRuleRepository: Send + Sync {
    /// Rules ordered by agreement type, then field name.
    async fn list_field_rules(
        &self,
        agreement_type: Option<&str>,
    ) -> Result<Vec<AgreementFieldRule>, RepositoryError>;
    /// Inserts the rule or updates `required` on the existing (agreement_type, field_name).
    async fn upsert_field_rule(
        &self,
        rule: NewFieldRule,
    ) -> Result<AgreementFieldRule, RepositoryError>;
    async fn delete_field_rule(&self, id: FieldRuleId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait OpportunityRepository: Send + Sync {
    async fn find_opportunity(
        &self,
        id: OpportunityId,
    ) -> Result<Option<Opportunity>, RepositoryError>;

    async fn insert_opportunity(
        &self,
        draft: OpportunityDraft,
    ) -> Result<Opportunity, RepositoryError>;

    /// Applies the mutation and appends its history entry in one commit, but only if
    /// the guard still matches the stored row.
    async fn conditional_update(
        &self,
        mutation: OpportunityMutation,
    ) -> Result<ConditionalUpdate<Opportunity>, RepositoryError>;

    async fn history_for(&self, id: OpportunityId) -> Result<Vec<HistoryEntry>, RepositoryError>;

    /// Active opportunities in timed stages whose idle timeout has passed at `now`,
    /// ordered by `(entered_stage_at, id)` and starting strictly after `after`.
    async fn escalation_candidates(
        &self,
        now: DateTime<Utc>,
        after: Option<CandidateCursor>,
        limit: u32,
    ) -> Result<Vec<Opportunity>, RepositoryError>;

    /// Active, unowned opportunities ordered by id.
    async fn list_pool(&self, limit: u32) -> Result<Vec<Opportunity>, RepositoryError>;
}

/// Everything the engine needs from persistence behind one object.
pub trait FunnelStore:
    StageRepository + TransitionRepository + FieldRuleRepository + OpportunityRepository
{
}

impl<T> FunnelStore for T where
    T: StageRepository + TransitionRepository + FieldRuleRepository + OpportunityRepository
{
}

/// SQL-backed store over one sqlx pool.
#[derive(Clone)]
pub struct SqlFunnelStore {
    pool: crate::DbPool,
}

impl SqlFunnelStore {
    pub fn new(pool: crate::DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &crate::DbPool {
        &self.pool
    }
}

pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}

pub(crate) fn decode_error(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

/// Turns unique/check violations into `Constraint` so callers can report them as
/// configuration problems rather than outages.
pub(crate) fn classify_write_error(error: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(database) = &error {
        if database.is_unique_violation()
            || database.is_check_violation()
            || database.is_foreign_key_violation()
        {
            return RepositoryError::Constraint(database.message().to_owned());
        }
    }
    RepositoryError::Database(error)
}
