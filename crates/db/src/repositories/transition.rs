use sqlx::Row;

use embudo_core::domain::stage::StageId;
use embudo_core::domain::transition::{NewTransition, Transition, TransitionId};

use super::{
    classify_write_error, decode_error, RepositoryError, SqlFunnelStore, TransitionRepository,
};

const TRANSITION_COLUMNS: &str = "id, origin_stage_id, destination_stage_id, action_name,
     requires_note, requires_supervisor, returns_to_pool, is_default, active";

fn row_to_transition(row: &sqlx::sqlite::SqliteRow) -> Result<Transition, RepositoryError> {
    Ok(Transition {
        id: TransitionId(row.try_get("id").map_err(decode_error)?),
        origin_stage: StageId(row.try_get("origin_stage_id").map_err(decode_error)?),
        destination_stage: StageId(row.try_get("destination_stage_id").map_err(decode_error)?),
        action_name: row.try_get("action_name").map_err(decode_error)?,
        requires_note: row.try_get("requires_note").map_err(decode_error)?,
        requires_supervisor: row.try_get("requires_supervisor").map_err(decode_error)?,
        returns_to_pool: row.try_get("returns_to_pool").map_err(decode_error)?,
        is_default: row.try_get("is_default").map_err(decode_error)?,
        active: row.try_get("active").map_err(decode_error)?,
    })
}

#[async_trait::async_trait]
impl TransitionRepository for SqlFunnelStore {
    async fn list_transitions(
        &self,
        origin: Option<StageId>,
        include_inactive: bool,
    ) -> Result<Vec<Transition>, RepositoryError> {
        let sql = format!(
            "SELECT {TRANSITION_COLUMNS} FROM funnel_transition
             WHERE (? IS NULL OR origin_stage_id = ?) AND (active = 1 OR ?)
             ORDER BY id ASC"
        );
        let origin = origin.map(|stage| stage.0);
        let rows = sqlx::query(&sql)
            .bind(origin)
            .bind(origin)
            .bind(include_inactive)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_transition).collect()
    }

    async fn find_transition(
        &self,
        id: TransitionId,
    ) -> Result<Option<Transition>, RepositoryError> {
        let sql = format!("SELECT {TRANSITION_COLUMNS} FROM funnel_transition WHERE id = ?");
        let row = sqlx::query(&sql).bind(id.0).fetch_optional(self.pool()).await?;
        row.as_ref().map(row_to_transition).transpose()
    }

    async fn insert_transition(
        &self,
        transition: NewTransition,
    ) -> Result<Transition, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO funnel_transition (origin_stage_id, destination_stage_id, action_name,
                 requires_note, requires_supervisor, returns_to_pool, is_default, active)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(transition.origin_stage.0)
        .bind(transition.destination_stage.0)
        .bind(&transition.action_name)
        .bind(transition.requires_note)
        .bind(transition.requires_supervisor)
        .bind(transition.returns_to_pool)
        .bind(transition.is_default)
        .execute(self.pool())
        .await
        .map_err(classify_write_error)?;

        Ok(Transition {
            id: TransitionId(result.last_insert_rowid()),
            origin_stage: transition.origin_stage,
            destination_stage: transition.destination_stage,
            action_name: transition.action_name,
            requires_note: transition.requires_note,
            requires_supervisor: transition.requires_supervisor,
            returns_to_pool: transition.returns_to_pool,
            is_default: transition.is_default,
            active: true,
        })
    }

    async fn update_transition(&self, transition: Transition) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE funnel_transition
             SET destination_stage_id = ?, action_name = ?, requires_note = ?,
                 requires_supervisor = ?, returns_to_pool = ?, is_default = ?, active = ?
             WHERE id = ?",
        )
        .bind(transition.destination_stage.0)
        .bind(&transition.action_name)
        .bind(transition.requires_note)
        .bind(transition.requires_supervisor)
        .bind(transition.returns_to_pool)
        .bind(transition.is_default)
        .bind(transition.active)
        .bind(transition.id.0)
        .execute(self.pool())
        .await
        .map_err(classify_write_error)?;
        Ok(())
    }
}
