use sqlx::Row;

use embudo_core::domain::stage::{NewStage, Stage, StageId, StageType};

use super::{classify_write_error, decode_error, RepositoryError, SqlFunnelStore, StageRepository};

const STAGE_COLUMNS: &str =
    "id, name, sort_order, stage_type, idle_timeout_hours, color, active";

fn row_to_stage(row: &sqlx::sqlite::SqliteRow) -> Result<Stage, RepositoryError> {
    let stage_type: String = row.try_get("stage_type").map_err(decode_error)?;
    let stage_type = StageType::parse(&stage_type)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown stage type `{stage_type}`")))?;

    Ok(Stage {
        id: StageId(row.try_get("id").map_err(decode_error)?),
        name: row.try_get("name").map_err(decode_error)?,
        order: row.try_get("sort_order").map_err(decode_error)?,
        stage_type,
        idle_timeout_hours: row.try_get("idle_timeout_hours").map_err(decode_error)?,
        color: row.try_get("color").map_err(decode_error)?,
        active: row.try_get("active").map_err(decode_error)?,
    })
}

#[async_trait::async_trait]
impl StageRepository for SqlFunnelStore {
    async fn list_stages(&self, include_inactive: bool) -> Result<Vec<Stage>, RepositoryError> {
        let sql = format!(
            "SELECT {STAGE_COLUMNS} FROM funnel_stage
             WHERE active = 1 OR ?
             ORDER BY sort_order ASC, id ASC"
        );
        let rows = sqlx::query(&sql).bind(include_inactive).fetch_all(self.pool()).await?;
        rows.iter().map(row_to_stage).collect()
    }

    async fn find_stage(&self, id: StageId) -> Result<Option<Stage>, RepositoryError> {
        let sql = format!("SELECT {STAGE_COLUMNS} FROM funnel_stage WHERE id = ?");
        let row = sqlx::query(&sql).bind(id.0).fetch_optional(self.pool()).await?;
        row.as_ref().map(row_to_stage).transpose()
    }

    async fn insert_stage(&self, stage: NewStage) -> Result<Stage, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO funnel_stage (name, sort_order, stage_type, idle_timeout_hours, color, active)
             VALUES (?, ?, ?, ?, ?, 1)",
        )
        .bind(&stage.name)
        .bind(stage.order)
        .bind(stage.stage_type.as_str())
        .bind(stage.idle_timeout_hours)
        .bind(&stage.color)
        .execute(self.pool())
        .await
        .map_err(classify_write_error)?;

        Ok(Stage {
            id: StageId(result.last_insert_rowid()),
            name: stage.name,
            order: stage.order,
            stage_type: stage.stage_type,
            idle_timeout_hours: stage.idle_timeout_hours,
            color: stage.color,
            active: true,
        })
    }

    async fn update_stage(&self, stage: Stage) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE funnel_stage
             SET name = ?, sort_order = ?, stage_type = ?, idle_timeout_hours = ?, color = ?, active = ?
             WHERE id = ?",
        )
        .bind(&stage.name)
        .bind(stage.order)
        .bind(stage.stage_type.as_str())
        .bind(stage.idle_timeout_hours)
        .bind(&stage.color)
        .bind(stage.active)
        .bind(stage.id.0)
        .execute(self.pool())
        .await
        .map_err(classify_write_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use embudo_core::domain::stage::{NewStage, StageType};

    use crate::repositories::{RepositoryError, SqlFunnelStore, StageRepository};
    use crate::{connect_with_settings, migrations};

    async fn store() -> SqlFunnelStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlFunnelStore::new(pool)
    }

    fn new_stage(name: &str, order: i32, stage_type: StageType) -> NewStage {
        NewStage {
            name: name.to_string(),
            order,
            stage_type,
            idle_timeout_hours: Some(24),
            color: "#1565c0".to_string(),
        }
    }

    #[tokio::test]
    async fn stages_list_in_order_and_hide_inactive() {
        let store = store().await;
        let later = store.insert_stage(new_stage("Contacted", 2, StageType::Advance)).await.expect("insert");
        let first = store.insert_stage(new_stage("Assigned", 1, StageType::Advance)).await.expect("insert");

        let listed = store.list_stages(false).await.expect("list");
        assert_eq!(listed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![first.id, later.id]);

        let mut retired = later.clone();
        retired.active = false;
        store.update_stage(retired.clone()).await.expect("deactivate");

        assert_eq!(store.list_stages(false).await.expect("list").len(), 1);
        let all = store.list_stages(true).await.expect("list all");
        assert_eq!(all.len(), 2);
        assert_eq!(store.find_stage(later.id).await.expect("find"), Some(retired));
    }

    #[tokio::test]
    async fn duplicate_active_order_is_a_constraint_error() {
        let store = store().await;
        store.insert_stage(new_stage("Assigned", 1, StageType::Advance)).await.expect("insert");
        let error = store
            .insert_stage(new_stage("Duplicate", 1, StageType::Exit))
            .await
            .expect_err("order collision");
        assert!(matches!(error, RepositoryError::Constraint(_)));
    }
}
