use sqlx::Row;

use embudo_core::domain::agreement::{AgreementFieldRule, FieldRuleId, NewFieldRule};

use super::{
    classify_write_error, decode_error, FieldRuleRepository, RepositoryError, SqlFunnelStore,
};

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<AgreementFieldRule, RepositoryError> {
    Ok(AgreementFieldRule {
        id: FieldRuleId(row.try_get("id").map_err(decode_error)?),
        agreement_type: row.try_get("agreement_type").map_err(decode_error)?,
        field_name: row.try_get("field_name").map_err(decode_error)?,
        required: row.try_get("required").map_err(decode_error)?,
    })
}

#[async_trait::async_trait]
impl FieldRuleRepository for SqlFunnelStore {
    async fn list_field_rules(
        &self,
        agreement_type: Option<&str>,
    ) -> Result<Vec<AgreementFieldRule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, agreement_type, field_name, required FROM agreement_field_rule
             WHERE ? IS NULL OR agreement_type = ?
             ORDER BY agreement_type ASC, field_name ASC",
        )
        .bind(agreement_type)
        .bind(agreement_type)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_rule).collect()
    }

    async fn upsert_field_rule(
        &self,
        rule: NewFieldRule,
    ) -> Result<AgreementFieldRule, RepositoryError> {
        let row = sqlx::query(
            "INSERT INTO agreement_field_rule (agreement_type, field_name, required)
             VALUES (?, ?, ?)
             ON CONFLICT(agreement_type, field_name) DO UPDATE SET required = excluded.required
             RETURNING id, agreement_type, field_name, required",
        )
        .bind(&rule.agreement_type)
        .bind(&rule.field_name)
        .bind(rule.required)
        .fetch_one(self.pool())
        .await
        .map_err(classify_write_error)?;
        row_to_rule(&row)
    }

    async fn delete_field_rule(&self, id: FieldRuleId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM agreement_field_rule WHERE id = ?")
            .bind(id.0)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use embudo_core::domain::agreement::NewFieldRule;

    use crate::repositories::{FieldRuleRepository, SqlFunnelStore};
    use crate::{connect_with_settings, migrations};

    fn rule(agreement_type: &str, field_name: &str, required: bool) -> NewFieldRule {
        NewFieldRule {
            agreement_type: agreement_type.to_string(),
            field_name: field_name.to_string(),
            required,
        }
    }

    #[tokio::test]
    async fn upsert_updates_required_on_existing_pair() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let store = SqlFunnelStore::new(pool);

        let created = store.upsert_field_rule(rule("IMSS", "phone", true)).await.expect("insert");
        let updated = store.upsert_field_rule(rule("IMSS", "phone", false)).await.expect("update");
        store.upsert_field_rule(rule("ISSSTE", "rfc", true)).await.expect("insert other");

        assert_eq!(created.id, updated.id);
        assert!(!updated.required);

        let imss = store.list_field_rules(Some("IMSS")).await.expect("list");
        assert_eq!(imss, vec![updated.clone()]);
        assert_eq!(store.list_field_rules(None).await.expect("list all").len(), 2);

        assert!(store.delete_field_rule(updated.id).await.expect("delete"));
        assert!(!store.delete_field_rule(updated.id).await.expect("delete again"));
    }
}
