//! PostgreSQL implementation of the storage traits.
//!
//! `PgStore` owns the pool; each submodule implements one trait against it.

mod entities;
mod ledger;
mod maintenance;
mod queue;
mod rows;

use crate::config::DatabaseConfig;
use crate::error::RegistrySyncResult;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;

/// Rows per multi-value INSERT. Keeps bind parameters well under the
/// protocol limit for the widest table.
pub(crate) const INSERT_CHUNK: usize = 1000;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> RegistrySyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn initialize_schema(&self) -> RegistrySyncResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(statements = SCHEMA.len(), "Schema initialized");
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS companies (
        orgnr TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        org_form TEXT,
        industry_codes TEXT[] NOT NULL DEFAULT '{}',
        street TEXT,
        postal_code TEXT,
        city TEXT,
        municipality_number TEXT,
        municipality TEXT,
        country_code TEXT,
        employees INTEGER,
        founded DATE,
        registered DATE,
        bankrupt BOOLEAN NOT NULL DEFAULT FALSE,
        bankruptcy_date DATE,
        purpose TEXT,
        roles_polled_at TIMESTAMPTZ,
        financials_polled_at TIMESTAMPTZ,
        latitude DOUBLE PRECISION,
        longitude DOUBLE PRECISION,
        geocode_attempts INTEGER NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_companies_roles_polled ON companies(roles_polled_at NULLS FIRST)",
    "CREATE TABLE IF NOT EXISTS subunits (
        orgnr TEXT PRIMARY KEY,
        parent_orgnr TEXT,
        name TEXT NOT NULL,
        org_form TEXT,
        industry_codes TEXT[] NOT NULL DEFAULT '{}',
        street TEXT,
        postal_code TEXT,
        city TEXT,
        municipality_number TEXT,
        municipality TEXT,
        country_code TEXT,
        employees INTEGER,
        started DATE,
        parent_gone_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_subunits_parent ON subunits(parent_orgnr)",
    "CREATE TABLE IF NOT EXISTS roles (
        id BIGSERIAL PRIMARY KEY,
        orgnr TEXT NOT NULL,
        role_type TEXT NOT NULL,
        description TEXT NOT NULL,
        person_name TEXT,
        birth_date DATE,
        resigned BOOLEAN NOT NULL DEFAULT FALSE,
        sequence INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_roles_orgnr ON roles(orgnr)",
    "CREATE TABLE IF NOT EXISTS financial_statements (
        orgnr TEXT NOT NULL,
        year INTEGER NOT NULL,
        revenue BIGINT,
        operating_result BIGINT,
        net_result BIGINT,
        equity BIGINT,
        total_assets BIGINT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (orgnr, year)
    )",
    "CREATE TABLE IF NOT EXISTS sync_errors (
        id BIGSERIAL PRIMARY KEY,
        orgnr TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        message TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempt_count INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_retry_at TIMESTAMPTZ,
        resolved_at TIMESTAMPTZ
    )",
    // At most one unresolved row per (orgnr, entity_type).
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_sync_errors_open
        ON sync_errors(orgnr, entity_type) WHERE status <> 'resolved'",
    "CREATE INDEX IF NOT EXISTS idx_sync_errors_status ON sync_errors(status, attempt_count)",
    "CREATE TABLE IF NOT EXISTS bulk_import_queue (
        orgnr TEXT PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'pending',
        priority INTEGER NOT NULL DEFAULT 0,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        company_fetched BOOLEAN NOT NULL DEFAULT FALSE,
        financials_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_bulk_import_queue_claim
        ON bulk_import_queue(status, priority DESC, created_at)",
    "CREATE TABLE IF NOT EXISTS system_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS population (
        municipality_number TEXT NOT NULL,
        year INTEGER NOT NULL,
        population BIGINT NOT NULL,
        PRIMARY KEY (municipality_number, year)
    )",
    "CREATE MATERIALIZED VIEW IF NOT EXISTS mv_industry_stats AS
        SELECT industry_codes[1] AS industry_code,
               COUNT(*)::BIGINT AS company_count,
               COALESCE(SUM(employees), 0)::BIGINT AS employee_count
        FROM companies
        WHERE cardinality(industry_codes) > 0
        GROUP BY industry_codes[1]",
    // Unique indexes allow REFRESH ... CONCURRENTLY.
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_mv_industry_stats ON mv_industry_stats(industry_code)",
    "CREATE MATERIALIZED VIEW IF NOT EXISTS mv_county_stats AS
        SELECT LEFT(municipality_number, 2) AS county_number,
               COUNT(*)::BIGINT AS company_count,
               COALESCE(SUM(employees), 0)::BIGINT AS employee_count
        FROM companies
        WHERE municipality_number IS NOT NULL
        GROUP BY LEFT(municipality_number, 2)",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_mv_county_stats ON mv_county_stats(county_number)"
];
