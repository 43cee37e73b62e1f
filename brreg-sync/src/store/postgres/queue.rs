use super::PgStore;
use super::rows::{QueueRow, convert_all};
use crate::error::{RegistrySyncError, RegistrySyncResult};
use crate::models::{
    ImportQueueEntry, ImportResult, ImportStatusCount, OrgNumber, PopulateReport
};
use crate::store::ImportQueueStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

const QUEUE_COLUMNS: &str = "orgnr, status, priority, attempt_count, last_error, company_fetched, \
     financials_count, created_at, started_at, finished_at";

#[async_trait]
impl ImportQueueStore for PgStore {
    async fn enqueue(
        &self,
        orgnrs: &[OrgNumber],
        priority: i32
    ) -> RegistrySyncResult<PopulateReport> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = orgnrs
            .iter()
            .filter(|o| seen.insert(*o))
            .map(|o| o.as_str().to_string())
            .collect();
        if unique.is_empty() {
            return Ok(PopulateReport::default());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO bulk_import_queue (orgnr, status, priority, created_at)
            SELECT orgnr, 'pending', $2, NOW() FROM UNNEST($1::text[]) AS orgnr
            ON CONFLICT (orgnr) DO NOTHING
            "#
        )
        .bind(&unique)
        .bind(priority)
        .execute(&self.pool)
        .await?;

        let added = result.rows_affected();
        Ok(PopulateReport {
            added,
            skipped: unique.len() as u64 - added
        })
    }

    async fn claim_pending(&self, limit: usize) -> RegistrySyncResult<Vec<ImportQueueEntry>> {
        // SKIP LOCKED lets several workers claim disjoint batches.
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            UPDATE bulk_import_queue q
            SET status = 'in_progress',
                attempt_count = q.attempt_count + 1,
                started_at = NOW(),
                finished_at = NULL
            WHERE q.orgnr IN (
                SELECT orgnr FROM bulk_import_queue
                WHERE status = 'pending'
                ORDER BY priority DESC, created_at, orgnr
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<ImportQueueEntry> = convert_all(rows)?;
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.orgnr.cmp(&b.orgnr))
        });
        Ok(entries)
    }

    async fn finish_import(&self, result: &ImportResult) -> RegistrySyncResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE bulk_import_queue
            SET status = $2, company_fetched = $3, financials_count = $4, last_error = $5,
                finished_at = NOW()
            WHERE orgnr = $1
            "#
        )
        .bind(result.orgnr.as_str())
        .bind(result.status().as_str())
        .bind(result.company_fetched)
        .bind(result.financials_count as i32)
        .bind(&result.error)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(RegistrySyncError::ValidationError(format!(
                "{} is not queued",
                result.orgnr
            )));
        }
        Ok(())
    }

    async fn reset_failed(
        &self,
        max_attempts: Option<i32>,
        failed_before: Option<DateTime<Utc>>
    ) -> RegistrySyncResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_import_queue
            SET status = 'pending', started_at = NULL, finished_at = NULL
            WHERE status = 'failed'
              AND ($1::INTEGER IS NULL OR attempt_count < $1)
              AND ($2::TIMESTAMPTZ IS NULL OR finished_at < $2)
            "#
        )
        .bind(max_attempts)
        .bind(failed_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn requeue_stale(&self, started_before: DateTime<Utc>) -> RegistrySyncResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_import_queue
            SET status = 'pending', started_at = NULL,
                last_error = 'requeued after worker timeout'
            WHERE status = 'in_progress'
              AND (started_at IS NULL OR started_at < $1)
            "#
        )
        .bind(started_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn queue_entry(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Option<ImportQueueEntry>> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {QUEUE_COLUMNS} FROM bulk_import_queue WHERE orgnr = $1"
        ))
        .bind(orgnr.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ImportQueueEntry::try_from).transpose()
    }

    async fn queue_summary(&self) -> RegistrySyncResult<Vec<ImportStatusCount>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*) FROM bulk_import_queue GROUP BY status ORDER BY status
            "#
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(status, count)| {
                Ok(ImportStatusCount {
                    status: status.parse()?,
                    count
                })
            })
            .collect()
    }
}
