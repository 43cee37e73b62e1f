use super::PgStore;
use super::rows::{SyncErrorRow, convert_all};
use crate::error::RegistrySyncResult;
use crate::models::{EntityType, OrgNumber, SyncErrorCount, SyncErrorRecord};
use crate::store::SyncErrorStore;
use async_trait::async_trait;

const RETURNING: &str =
    "id, orgnr, entity_type, message, status, attempt_count, created_at, last_retry_at, resolved_at";

#[async_trait]
impl SyncErrorStore for PgStore {
    async fn report_sync_error(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType,
        message: &str
    ) -> RegistrySyncResult<SyncErrorRecord> {
        // The partial unique index turns concurrent reports for the same key
        // into one row instead of a race between lookup and insert.
        let row = sqlx::query_as::<_, SyncErrorRow>(&format!(
            r#"
            INSERT INTO sync_errors (orgnr, entity_type, message, status, attempt_count, created_at)
            VALUES ($1, $2, $3, 'pending', 1, NOW())
            ON CONFLICT (orgnr, entity_type) WHERE status <> 'resolved'
            DO UPDATE SET
                message = EXCLUDED.message,
                attempt_count = sync_errors.attempt_count + 1,
                last_retry_at = NOW(),
                status = CASE WHEN sync_errors.status = 'permanent_failure'
                    THEN sync_errors.status ELSE 'retrying' END
            RETURNING {RETURNING}
            "#
        ))
        .bind(orgnr.as_str())
        .bind(entity_type.as_str())
        .bind(message)
        .fetch_one(&self.pool)
        .await?;

        SyncErrorRecord::try_from(row)
    }

    async fn resolve_sync_error(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType
    ) -> RegistrySyncResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_errors SET status = 'resolved', resolved_at = NOW()
            WHERE orgnr = $1 AND entity_type = $2 AND status <> 'resolved'
            "#
        )
        .bind(orgnr.as_str())
        .bind(entity_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn open_sync_error(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType
    ) -> RegistrySyncResult<Option<SyncErrorRecord>> {
        let row = sqlx::query_as::<_, SyncErrorRow>(&format!(
            "SELECT {RETURNING} FROM sync_errors
             WHERE orgnr = $1 AND entity_type = $2 AND status <> 'resolved'"
        ))
        .bind(orgnr.as_str())
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncErrorRecord::try_from).transpose()
    }

    async fn retryable_sync_errors(
        &self,
        max_attempts: u32,
        limit: usize
    ) -> RegistrySyncResult<Vec<SyncErrorRecord>> {
        let rows = sqlx::query_as::<_, SyncErrorRow>(&format!(
            "SELECT {RETURNING} FROM sync_errors
             WHERE status IN ('pending', 'retrying') AND attempt_count < $1
             ORDER BY COALESCE(last_retry_at, created_at), id
             LIMIT $2"
        ))
        .bind(max_attempts as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn mark_permanent_failures(&self, max_attempts: u32) -> RegistrySyncResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_errors SET status = 'permanent_failure'
            WHERE status IN ('pending', 'retrying') AND attempt_count >= $1
            "#
        )
        .bind(max_attempts as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn sync_error_summary(&self) -> RegistrySyncResult<Vec<SyncErrorCount>> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            r#"
            SELECT entity_type, status, COUNT(*)
            FROM sync_errors
            GROUP BY entity_type, status
            ORDER BY entity_type, status
            "#
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(entity_type, status, count)| {
                Ok(SyncErrorCount {
                    entity_type: entity_type.parse()?,
                    status: status.parse()?,
                    count
                })
            })
            .collect()
    }
}
