use super::rows::AddressColumns;
use super::{INSERT_CHUNK, PgStore};
use crate::error::{RegistrySyncError, RegistrySyncResult};
use crate::models::{
    Coordinates, CountyStat, GeocodeCandidate, IndustryStat, OrgNumber, PopulationRecord
};
use crate::store::{MaintenanceStore, SystemStateStore, is_safe_identifier};
use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use tracing::debug;

#[async_trait]
impl SystemStateStore for PgStore {
    async fn get_state(&self, key: &str) -> RegistrySyncResult<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT value FROM system_state WHERE key = $1
            "#
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn set_state(&self, key: &str, value: &str) -> RegistrySyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO system_state (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct GeocodeRow {
    orgnr: String,
    #[sqlx(flatten)]
    address: AddressColumns,
    geocode_attempts: i32
}

#[async_trait]
impl MaintenanceStore for PgStore {
    async fn refresh_materialized_views(&self, views: &[String]) -> RegistrySyncResult<()> {
        for view in views {
            if !is_safe_identifier(view) {
                return Err(RegistrySyncError::ValidationError(format!(
                    "invalid materialized view name: {view}"
                )));
            }
            sqlx::query(&format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {view}"))
                .execute(&self.pool)
                .await?;
            debug!(view = %view, "Materialized view refreshed");
        }
        Ok(())
    }

    async fn pending_geocodes(
        &self,
        limit: usize,
        max_attempts: i32
    ) -> RegistrySyncResult<Vec<GeocodeCandidate>> {
        let rows = sqlx::query_as::<_, GeocodeRow>(
            r#"
            SELECT orgnr, street, postal_code, city, municipality_number, municipality,
                   country_code, geocode_attempts
            FROM companies
            WHERE latitude IS NULL
              AND geocode_attempts < $2
              AND street IS NOT NULL AND btrim(street) <> ''
            ORDER BY geocode_attempts, orgnr
            LIMIT $1
            "#
        )
        .bind(limit as i64)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let orgnr = OrgNumber::parse(&row.orgnr).map_err(|_| {
                RegistrySyncError::InvalidPayload(format!("stored orgnr {:?} is invalid", row.orgnr))
            })?;
            if let Some(address) = row.address.into_address() {
                candidates.push(GeocodeCandidate {
                    orgnr,
                    address,
                    attempts: row.geocode_attempts
                });
            }
        }
        Ok(candidates)
    }

    async fn save_geocode(
        &self,
        orgnr: &OrgNumber,
        coordinates: Option<Coordinates>
    ) -> RegistrySyncResult<()> {
        sqlx::query(
            r#"
            UPDATE companies
            SET geocode_attempts = geocode_attempts + 1,
                latitude = COALESCE($2, latitude),
                longitude = COALESCE($3, longitude)
            WHERE orgnr = $1
            "#
        )
        .bind(orgnr.as_str())
        .bind(coordinates.map(|c| c.lat))
        .bind(coordinates.map(|c| c.lon))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_population(&self, records: &[PopulationRecord]) -> RegistrySyncResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO population (municipality_number, year, population) ");
            builder.push_values(chunk, |mut b, record| {
                b.push_bind(&record.municipality_number)
                    .push_bind(record.year)
                    .push_bind(record.population);
            });
            builder.push(
                " ON CONFLICT (municipality_number, year) DO UPDATE SET population = EXCLUDED.population"
            );
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn industry_stats(&self, limit: usize) -> RegistrySyncResult<Vec<IndustryStat>> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            r#"
            SELECT industry_code, company_count, employee_count
            FROM mv_industry_stats
            ORDER BY company_count DESC, industry_code
            LIMIT $1
            "#
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(industry_code, company_count, employee_count)| IndustryStat {
                industry_code,
                company_count,
                employee_count
            })
            .collect())
    }

    async fn county_stats(&self) -> RegistrySyncResult<Vec<CountyStat>> {
        let rows = sqlx::query_as::<_, (String, i64, i64, Option<i64>)>(
            r#"
            WITH latest AS (
                SELECT DISTINCT ON (municipality_number) municipality_number, population
                FROM population
                ORDER BY municipality_number, year DESC
            ), county_population AS (
                SELECT LEFT(municipality_number, 2) AS county_number,
                       SUM(population)::BIGINT AS population
                FROM latest
                GROUP BY LEFT(municipality_number, 2)
            )
            SELECT s.county_number, s.company_count, s.employee_count, p.population
            FROM mv_county_stats s
            LEFT JOIN county_population p ON p.county_number = s.county_number
            ORDER BY s.county_number
            "#
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(county_number, company_count, employee_count, population)| CountyStat {
                    county_number,
                    company_count,
                    employee_count,
                    population
                }
            )
            .collect())
    }
}
