use super::rows::{AddressColumns, CompanyRow, RoleRow, SubUnitRow, convert_all, parse_orgnrs};
use super::{INSERT_CHUNK, PgStore};
use crate::error::RegistrySyncResult;
use crate::models::{Company, FinancialStatement, OrgNumber, Role, SubUnit};
use crate::store::{EntityStore, RoleStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashSet;

const COMPANY_COLUMNS: &str = "orgnr, name, org_form, industry_codes, street, postal_code, city, \
     municipality_number, municipality, country_code, employees, founded, registered, bankrupt, \
     bankruptcy_date, purpose";

const SUBUNIT_COLUMNS: &str = "orgnr, parent_orgnr, name, org_form, industry_codes, street, \
     postal_code, city, municipality_number, municipality, country_code, employees, started";

#[async_trait]
impl EntityStore for PgStore {
    async fn get_company(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Option<Company>> {
        let row = sqlx::query_as::<_, CompanyRow>(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies WHERE orgnr = $1"
        ))
        .bind(orgnr.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Company::try_from).transpose()
    }

    async fn get_subunit(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Option<SubUnit>> {
        let row = sqlx::query_as::<_, SubUnitRow>(&format!(
            "SELECT {SUBUNIT_COLUMNS} FROM subunits WHERE orgnr = $1"
        ))
        .bind(orgnr.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubUnit::try_from).transpose()
    }

    async fn upsert_companies(&self, companies: &[Company]) -> RegistrySyncResult<u64> {
        if companies.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;

        for chunk in companies.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO companies ({COMPANY_COLUMNS}) "));
            builder.push_values(chunk, |mut b, company| {
                let address = AddressColumns::from_address(company.address.as_ref());
                b.push_bind(company.orgnr.as_str())
                    .push_bind(&company.name)
                    .push_bind(&company.org_form)
                    .push_bind(&company.industry_codes)
                    .push_bind(address.street)
                    .push_bind(address.postal_code)
                    .push_bind(address.city)
                    .push_bind(address.municipality_number)
                    .push_bind(address.municipality)
                    .push_bind(address.country_code)
                    .push_bind(company.employees)
                    .push_bind(company.founded)
                    .push_bind(company.registered)
                    .push_bind(company.bankrupt)
                    .push_bind(company.bankruptcy_date)
                    .push_bind(&company.purpose);
            });
            builder.push(
                " ON CONFLICT (orgnr) DO UPDATE SET
                    name = EXCLUDED.name,
                    org_form = EXCLUDED.org_form,
                    industry_codes = EXCLUDED.industry_codes,
                    street = EXCLUDED.street,
                    postal_code = EXCLUDED.postal_code,
                    city = EXCLUDED.city,
                    municipality_number = EXCLUDED.municipality_number,
                    municipality = EXCLUDED.municipality,
                    country_code = EXCLUDED.country_code,
                    employees = EXCLUDED.employees,
                    founded = EXCLUDED.founded,
                    registered = EXCLUDED.registered,
                    bankrupt = EXCLUDED.bankrupt,
                    bankruptcy_date = EXCLUDED.bankruptcy_date,
                    purpose = EXCLUDED.purpose,
                    latitude = CASE WHEN companies.street IS DISTINCT FROM EXCLUDED.street
                        THEN NULL ELSE companies.latitude END,
                    longitude = CASE WHEN companies.street IS DISTINCT FROM EXCLUDED.street
                        THEN NULL ELSE companies.longitude END,
                    geocode_attempts = CASE WHEN companies.street IS DISTINCT FROM EXCLUDED.street
                        THEN 0 ELSE companies.geocode_attempts END,
                    updated_at = NOW()"
            );
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn upsert_subunits(&self, subunits: &[SubUnit]) -> RegistrySyncResult<u64> {
        if subunits.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;

        for chunk in subunits.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO subunits ({SUBUNIT_COLUMNS}) "));
            builder.push_values(chunk, |mut b, subunit| {
                let address = AddressColumns::from_address(subunit.address.as_ref());
                b.push_bind(subunit.orgnr.as_str())
                    .push_bind(subunit.parent_orgnr.as_ref().map(OrgNumber::as_str))
                    .push_bind(&subunit.name)
                    .push_bind(&subunit.org_form)
                    .push_bind(&subunit.industry_codes)
                    .push_bind(address.street)
                    .push_bind(address.postal_code)
                    .push_bind(address.city)
                    .push_bind(address.municipality_number)
                    .push_bind(address.municipality)
                    .push_bind(address.country_code)
                    .push_bind(subunit.employees)
                    .push_bind(subunit.started);
            });
            builder.push(
                " ON CONFLICT (orgnr) DO UPDATE SET
                    parent_orgnr = EXCLUDED.parent_orgnr,
                    name = EXCLUDED.name,
                    org_form = EXCLUDED.org_form,
                    industry_codes = EXCLUDED.industry_codes,
                    street = EXCLUDED.street,
                    postal_code = EXCLUDED.postal_code,
                    city = EXCLUDED.city,
                    municipality_number = EXCLUDED.municipality_number,
                    municipality = EXCLUDED.municipality,
                    country_code = EXCLUDED.country_code,
                    employees = EXCLUDED.employees,
                    started = EXCLUDED.started,
                    parent_gone_at = CASE WHEN subunits.parent_orgnr IS DISTINCT FROM EXCLUDED.parent_orgnr
                        THEN NULL ELSE subunits.parent_gone_at END,
                    updated_at = NOW()"
            );
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn upsert_financials(
        &self,
        orgnr: &OrgNumber,
        statements: &[FinancialStatement],
        polled_at: DateTime<Utc>
    ) -> RegistrySyncResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;

        for chunk in statements.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO financial_statements \
                 (orgnr, year, revenue, operating_result, net_result, equity, total_assets) "
            );
            builder.push_values(chunk, |mut b, statement| {
                b.push_bind(statement.orgnr.as_str())
                    .push_bind(statement.year)
                    .push_bind(statement.revenue)
                    .push_bind(statement.operating_result)
                    .push_bind(statement.net_result)
                    .push_bind(statement.equity)
                    .push_bind(statement.total_assets);
            });
            builder.push(
                " ON CONFLICT (orgnr, year) DO UPDATE SET
                    revenue = EXCLUDED.revenue,
                    operating_result = EXCLUDED.operating_result,
                    net_result = EXCLUDED.net_result,
                    equity = EXCLUDED.equity,
                    total_assets = EXCLUDED.total_assets,
                    updated_at = NOW()"
            );
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        sqlx::query(
            r#"
            UPDATE companies
            SET financials_polled_at = GREATEST(COALESCE(financials_polled_at, $2), $2)
            WHERE orgnr = $1
            "#
        )
        .bind(orgnr.as_str())
        .bind(polled_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(affected)
    }

    async fn orphaned_parents(&self, limit: usize) -> RegistrySyncResult<Vec<OrgNumber>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT DISTINCT s.parent_orgnr
            FROM subunits s
            LEFT JOIN companies c ON c.orgnr = s.parent_orgnr
            WHERE s.parent_orgnr IS NOT NULL
              AND s.parent_gone_at IS NULL
              AND c.orgnr IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM sync_errors e
                  WHERE e.orgnr = s.parent_orgnr
                    AND e.entity_type = 'company'
                    AND e.status <> 'resolved'
              )
            ORDER BY s.parent_orgnr
            LIMIT $1
            "#
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        parse_orgnrs(rows)
    }

    async fn mark_parent_gone(&self, parent: &OrgNumber) -> RegistrySyncResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subunits SET parent_gone_at = NOW(), updated_at = NOW()
            WHERE parent_orgnr = $1 AND parent_gone_at IS NULL
            "#
        )
        .bind(parent.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn largest_companies(&self, limit: usize) -> RegistrySyncResult<Vec<OrgNumber>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT orgnr FROM companies
            ORDER BY COALESCE(employees, 0) DESC, orgnr
            LIMIT $1
            "#
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        parse_orgnrs(rows)
    }

    async fn subunits_of(&self, parent: &OrgNumber) -> RegistrySyncResult<HashSet<OrgNumber>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT orgnr FROM subunits WHERE parent_orgnr = $1
            "#
        )
        .bind(parent.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(parse_orgnrs(rows)?.into_iter().collect())
    }

    async fn companies_needing_roles(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize
    ) -> RegistrySyncResult<Vec<OrgNumber>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT c.orgnr FROM companies c
            WHERE (c.roles_polled_at IS NULL OR c.roles_polled_at < $1)
              AND NOT EXISTS (
                  SELECT 1 FROM sync_errors e
                  WHERE e.orgnr = c.orgnr
                    AND e.entity_type = 'role'
                    AND e.status <> 'resolved'
              )
            ORDER BY c.roles_polled_at NULLS FIRST, c.orgnr
            LIMIT $2
            "#
        )
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        parse_orgnrs(rows)
    }
}

#[async_trait]
impl RoleStore for PgStore {
    async fn replace_roles(
        &self,
        batch: &[(OrgNumber, Vec<Role>)],
        polled_at: DateTime<Utc>
    ) -> RegistrySyncResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let owners: Vec<String> = batch.iter().map(|(o, _)| o.as_str().to_string()).collect();
        let roles: Vec<&Role> = batch.iter().flat_map(|(_, roles)| roles).collect();

        // Readers see either the old or the new set, never a mix.
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM roles WHERE orgnr = ANY($1)")
            .bind(&owners)
            .execute(&mut *tx)
            .await?;

        let mut inserted = 0;
        for chunk in roles.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO roles \
                 (orgnr, role_type, description, person_name, birth_date, resigned, sequence) "
            );
            builder.push_values(chunk, |mut b, role| {
                b.push_bind(role.orgnr.as_str())
                    .push_bind(&role.role_type)
                    .push_bind(&role.description)
                    .push_bind(&role.person_name)
                    .push_bind(role.birth_date)
                    .push_bind(role.resigned)
                    .push_bind(role.sequence);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        sqlx::query(
            r#"
            UPDATE companies
            SET roles_polled_at = GREATEST(COALESCE(roles_polled_at, $2), $2)
            WHERE orgnr = ANY($1)
            "#
        )
        .bind(&owners)
        .bind(polled_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_roles(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT orgnr, role_type, description, person_name, birth_date, resigned, sequence
            FROM roles
            WHERE orgnr = $1
            ORDER BY sequence, id
            "#
        )
        .bind(orgnr.as_str())
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }
}
