use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite};

use embudo_core::domain::actor::UserId;
use embudo_core::domain::history::{HistoryEntry, HistoryKind};
use embudo_core::domain::mutation::{
    ConditionalUpdate, OpportunityMutation, OwnerExpectation,
};
use embudo_core::domain::opportunity::{Opportunity, OpportunityId};
use embudo_core::domain::stage::StageId;
use embudo_core::patch::Patch;

use super::{
    classify_write_error, decode_error, format_timestamp, parse_timestamp, CandidateCursor,
    OpportunityDraft, OpportunityRepository, RepositoryError, SqlFunnelStore,
};

const OPPORTUNITY_COLUMNS: &str = "id, owner_id, current_stage_id, entered_stage_at,
     agreement_type, fields_json, active, created_at";

fn row_to_opportunity(row: &sqlx::sqlite::SqliteRow) -> Result<Opportunity, RepositoryError> {
    let owner: Option<i64> = row.try_get("owner_id").map_err(decode_error)?;
    let entered: String = row.try_get("entered_stage_at").map_err(decode_error)?;
    let created: String = row.try_get("created_at").map_err(decode_error)?;
    let fields_json: String = row.try_get("fields_json").map_err(decode_error)?;
    let fields: BTreeMap<String, String> = serde_json::from_str(&fields_json)
        .map_err(|error| RepositoryError::Decode(format!("fields_json: {error}")))?;

    Ok(Opportunity {
        id: OpportunityId(row.try_get("id").map_err(decode_error)?),
        owner: owner.map(UserId),
        current_stage: StageId(row.try_get("current_stage_id").map_err(decode_error)?),
        entered_stage_at: parse_timestamp("entered_stage_at", &entered)?,
        agreement_type: row.try_get("agreement_type").map_err(decode_error)?,
        fields,
        active: row.try_get("active").map_err(decode_error)?,
        created_at: parse_timestamp("created_at", &created)?,
    })
}

fn row_to_history(row: &sqlx::sqlite::SqliteRow) -> Result<HistoryEntry, RepositoryError> {
    let kind: String = row.try_get("kind").map_err(decode_error)?;
    let kind = HistoryKind::parse(&kind)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown history kind `{kind}`")))?;
    let occurred: String = row.try_get("occurred_at").map_err(decode_error)?;
    let actor: Option<i64> = row.try_get("actor_id").map_err(decode_error)?;
    let from_stage: Option<i64> = row.try_get("from_stage_id").map_err(decode_error)?;
    let to_stage: Option<i64> = row.try_get("to_stage_id").map_err(decode_error)?;

    Ok(HistoryEntry {
        id: row.try_get("id").map_err(decode_error)?,
        opportunity_id: OpportunityId(row.try_get("opportunity_id").map_err(decode_error)?),
        actor: actor.map(UserId),
        kind,
        from_stage: from_stage.map(StageId),
        to_stage: to_stage.map(StageId),
        note: row.try_get("note").map_err(decode_error)?,
        occurred_at: parse_timestamp("occurred_at", &occurred)?,
    })
}

/// Builds the guarded UPDATE. The WHERE clause carries every guard column, so the row
/// is either fully updated or untouched.
fn guarded_update(mutation: &OpportunityMutation) -> QueryBuilder<'static, Sqlite> {
    let change = &mutation.change;
    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE opportunity SET ");
    let mut assignments = builder.separated(", ");
    assignments.push("id = id");
    match change.owner {
        Patch::Absent => {}
        Patch::Null => {
            assignments.push("owner_id = NULL");
        }
        Patch::Value(owner) => {
            assignments.push("owner_id = ").push_bind_unseparated(owner.0);
        }
    }
    if let Some(stage_move) = change.stage {
        assignments.push("current_stage_id = ").push_bind_unseparated(stage_move.stage.0);
        assignments
            .push("entered_stage_at = ")
            .push_bind_unseparated(format_timestamp(stage_move.entered_at));
    }
    if let Some(active) = change.active {
        assignments.push("active = ").push_bind_unseparated(active);
    }

    builder.push(" WHERE id = ").push_bind(mutation.opportunity_id.0).push(" AND active = 1");
    match mutation.guard.owner {
        OwnerExpectation::Any => {}
        OwnerExpectation::Unowned => {
            builder.push(" AND owner_id IS NULL");
        }
        OwnerExpectation::OwnedBy(owner) => {
            builder.push(" AND owner_id = ").push_bind(owner.0);
        }
    }
    if let Some(snapshot) = mutation.guard.stage {
        builder
            .push(" AND current_stage_id = ")
            .push_bind(snapshot.stage.0)
            .push(" AND entered_stage_at = ")
            .push_bind(format_timestamp(snapshot.entered_at));
    }
    builder
}

#[async_trait::async_trait]
impl OpportunityRepository for SqlFunnelStore {
    async fn find_opportunity(
        &self,
        id: OpportunityId,
    ) -> Result<Option<Opportunity>, RepositoryError> {
        let sql = format!("SELECT {OPPORTUNITY_COLUMNS} FROM opportunity WHERE id = ?");
        let row = sqlx::query(&sql).bind(id.0).fetch_optional(self.pool()).await?;
        row.as_ref().map(row_to_opportunity).transpose()
    }

    async fn insert_opportunity(
        &self,
        draft: OpportunityDraft,
    ) -> Result<Opportunity, RepositoryError> {
        let fields_json = serde_json::to_string(&draft.fields)
            .map_err(|error| RepositoryError::Decode(format!("fields_json: {error}")))?;
        let created_at = draft.entered_stage_at;
        let result = sqlx::query(
            "INSERT INTO opportunity (owner_id, current_stage_id, entered_stage_at,
                 agreement_type, fields_json, active, created_at)
             VALUES (?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(draft.owner.map(|owner| owner.0))
        .bind(draft.stage.0)
        .bind(format_timestamp(draft.entered_stage_at))
        .bind(&draft.agreement_type)
        .bind(&fields_json)
        .bind(format_timestamp(created_at))
        .execute(self.pool())
        .await
        .map_err(classify_write_error)?;

        let id = OpportunityId(result.last_insert_rowid());
        self.find_opportunity(id)
            .await?
            .ok_or_else(|| RepositoryError::Decode(format!("opportunity `{id}` vanished after insert")))
    }

    async fn conditional_update(
        &self,
        mutation: OpportunityMutation,
    ) -> Result<ConditionalUpdate<Opportunity>, RepositoryError> {
        let mut tx = self.pool().begin().await?;

        let updated = guarded_update(&mutation)
            .build()
            .execute(&mut *tx)
            .await
            .map_err(classify_write_error)?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ConditionalUpdate::Stale);
        }

        let history = &mutation.history;
        sqlx::query(
            "INSERT INTO opportunity_history (id, opportunity_id, actor_id, kind,
                 from_stage_id, to_stage_id, note, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&history.id)
        .bind(history.opportunity_id.0)
        .bind(history.actor.map(|actor| actor.0))
        .bind(history.kind.as_str())
        .bind(history.from_stage.map(|stage| stage.0))
        .bind(history.to_stage.map(|stage| stage.0))
        .bind(&history.note)
        .bind(format_timestamp(history.occurred_at))
        .execute(&mut *tx)
        .await
        .map_err(classify_write_error)?;

        let sql = format!("SELECT {OPPORTUNITY_COLUMNS} FROM opportunity WHERE id = ?");
        let row = sqlx::query(&sql).bind(mutation.opportunity_id.0).fetch_one(&mut *tx).await?;
        let opportunity = row_to_opportunity(&row)?;
        tx.commit().await?;

        Ok(ConditionalUpdate::Applied(opportunity))
    }

    async fn history_for(&self, id: OpportunityId) -> Result<Vec<HistoryEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, opportunity_id, actor_id, kind, from_stage_id, to_stage_id, note, occurred_at
             FROM opportunity_history
             WHERE opportunity_id = ?
             ORDER BY occurred_at ASC, rowid ASC",
        )
        .bind(id.0)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_history).collect()
    }

    async fn escalation_candidates(
        &self,
        now: DateTime<Utc>,
        after: Option<CandidateCursor>,
        limit: u32,
    ) -> Result<Vec<Opportunity>, RepositoryError> {
        // julianday() is a coarse prefilter; callers re-check the exact idle time.
        // Timestamps share one fixed-width format, so text order is time order.
        let cursor_at = after.map(|cursor| format_timestamp(cursor.entered_stage_at));
        let cursor_id = after.map(|cursor| cursor.id.0);
        let rows = sqlx::query(
            "SELECT o.id, o.owner_id, o.current_stage_id, o.entered_stage_at,
                    o.agreement_type, o.fields_json, o.active, o.created_at
             FROM opportunity o
             JOIN funnel_stage s ON s.id = o.current_stage_id
             WHERE o.active = 1
               AND s.idle_timeout_hours IS NOT NULL
               AND julianday(o.entered_stage_at) + s.idle_timeout_hours / 24.0
                   <= julianday(?) + 0.00001
               AND (? IS NULL
                    OR o.entered_stage_at > ?
                    OR (o.entered_stage_at = ? AND o.id > ?))
             ORDER BY o.entered_stage_at ASC, o.id ASC
             LIMIT ?",
        )
        .bind(format_timestamp(now))
        .bind(cursor_at.clone())
        .bind(cursor_at.clone())
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_opportunity).collect()
    }

    async fn list_pool(&self, limit: u32) -> Result<Vec<Opportunity>, RepositoryError> {
        let sql = format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunity
             WHERE active = 1 AND owner_id IS NULL
             ORDER BY id ASC
             LIMIT ?"
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(self.pool()).await?;
        rows.iter().map(row_to_opportunity).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone, Utc};

    use embudo_core::domain::actor::UserId;
    use embudo_core::domain::history::{HistoryEntry, HistoryKind};
    use embudo_core::domain::mutation::{
        ConditionalUpdate, OpportunityChange, OpportunityGuard, OpportunityMutation, StageMove,
    };
    use embudo_core::domain::stage::{NewStage, StageId, StageType};
    use embudo_core::patch::Patch;

    use crate::repositories::{
        CandidateCursor, OpportunityDraft, OpportunityRepository, SqlFunnelStore,
        StageRepository,
    };
    use crate::{connect_with_settings, migrations};

    async fn store() -> (SqlFunnelStore, StageId, StageId) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let store = SqlFunnelStore::new(pool);
        let timed = store
            .insert_stage(NewStage {
                name: "Initial Contact".to_string(),
                order: 1,
                stage_type: StageType::Advance,
                idle_timeout_hours: Some(24),
                color: "#1565c0".to_string(),
            })
            .await
            .expect("stage");
        let exit = store
            .insert_stage(NewStage {
                name: "No Response".to_string(),
                order: 2,
                stage_type: StageType::Exit,
                idle_timeout_hours: None,
                color: "#ef9a9a".to_string(),
            })
            .await
            .expect("stage");
        (store, timed.id, exit.id)
    }

    fn draft(stage: StageId, owner: Option<UserId>, hours_ago: i64) -> OpportunityDraft {
        let base = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).single().expect("valid timestamp");
        OpportunityDraft {
            owner,
            stage,
            entered_stage_at: base - Duration::hours(hours_ago),
            agreement_type: "IMSS".to_string(),
            fields: BTreeMap::from([("phone".to_string(), "5512345678".to_string())]),
        }
    }

    #[tokio::test]
    async fn insert_round_trips_fields_and_timestamps() {
        let (store, stage, _) = store().await;
        let inserted = store.insert_opportunity(draft(stage, None, 0)).await.expect("insert");
        let found = store.find_opportunity(inserted.id).await.expect("find").expect("present");
        assert_eq!(found, inserted);
        assert_eq!(found.field("phone"), Some("5512345678"));
        assert!(found.in_pool());
    }

    #[tokio::test]
    async fn second_claim_on_same_row_is_stale() {
        let (store, stage, _) = store().await;
        let opp = store.insert_opportunity(draft(stage, None, 0)).await.expect("insert");
        let claim = |user: i64| OpportunityMutation {
            opportunity_id: opp.id,
            guard: OpportunityGuard::unowned(),
            change: OpportunityChange { owner: Patch::Value(UserId(user)), ..Default::default() },
            history: HistoryEntry::new(opp.id, Some(UserId(user)), HistoryKind::Claim, Utc::now()),
        };

        let first = store.conditional_update(claim(1)).await.expect("first claim");
        let second = store.conditional_update(claim(2)).await.expect("second claim");

        assert_eq!(first.applied().and_then(|o| o.owner), Some(UserId(1)));
        assert_eq!(second, ConditionalUpdate::Stale);
        let history = store.history_for(opp.id).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].actor, Some(UserId(1)));
    }

    #[tokio::test]
    async fn stage_move_is_guarded_on_snapshot() {
        let (store, stage, exit) = store().await;
        let opp = store.insert_opportunity(draft(stage, Some(UserId(5)), 25)).await.expect("insert");
        let entered_at = opp.entered_stage_at + Duration::hours(25);
        let mutation = OpportunityMutation {
            opportunity_id: opp.id,
            guard: OpportunityGuard::snapshot(opp.snapshot()),
            change: OpportunityChange {
                owner: Patch::Null,
                stage: Some(StageMove { stage: exit, entered_at }),
                active: None,
            },
            history: HistoryEntry::new(opp.id, None, HistoryKind::TimerEscalation, entered_at)
                .with_stages(stage, exit),
        };

        let applied = store
            .conditional_update(mutation.clone())
            .await
            .expect("update")
            .applied()
            .expect("applied");
        assert_eq!(applied.current_stage, exit);
        assert_eq!(applied.entered_stage_at, entered_at);
        assert_eq!(applied.owner, None);

        let replay = store.conditional_update(mutation).await.expect("replay");
        assert_eq!(replay, ConditionalUpdate::Stale);
    }

    #[tokio::test]
    async fn candidates_include_only_elapsed_timed_stages() {
        let (store, stage, exit) = store().await;
        let stale = store.insert_opportunity(draft(stage, Some(UserId(1)), 25)).await.expect("insert");
        store.insert_opportunity(draft(stage, Some(UserId(1)), 23)).await.expect("insert");
        store.insert_opportunity(draft(exit, None, 500)).await.expect("insert");

        let now = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).single().expect("valid timestamp");
        let candidates = store.escalation_candidates(now, None, 10).await.expect("candidates");
        assert_eq!(candidates.iter().map(|o| o.id).collect::<Vec<_>>(), vec![stale.id]);

        let pooled = store.list_pool(10).await.expect("pool");
        assert_eq!(pooled.len(), 1);
    }

    #[tokio::test]
    async fn candidate_pages_resume_after_the_cursor() {
        let (store, stage, _) = store().await;
        let oldest = store.insert_opportunity(draft(stage, Some(UserId(1)), 40)).await.expect("insert");
        let tied_a = store.insert_opportunity(draft(stage, Some(UserId(1)), 30)).await.expect("insert");
        let tied_b = store.insert_opportunity(draft(stage, Some(UserId(2)), 30)).await.expect("insert");

        let now = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).single().expect("valid timestamp");
        let first = store.escalation_candidates(now, None, 2).await.expect("first page");
        assert_eq!(first.iter().map(|o| o.id).collect::<Vec<_>>(), vec![oldest.id, tied_a.id]);

        let cursor = CandidateCursor::after(&first[1]);
        let second = store.escalation_candidates(now, Some(cursor), 2).await.expect("second page");
        assert_eq!(second.iter().map(|o| o.id).collect::<Vec<_>>(), vec![tied_b.id]);

        let done = CandidateCursor::after(&second[0]);
        assert!(store.escalation_candidates(now, Some(done), 2).await.expect("last").is_empty());
    }
}
