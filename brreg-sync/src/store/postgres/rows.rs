use crate::error::{RegistrySyncError, RegistrySyncResult};
use crate::models::{
    Address, Company, ImportQueueEntry, OrgNumber, Role, SubUnit, SyncErrorRecord
};
use chrono::{DateTime, NaiveDate, Utc};

fn orgnr(raw: &str) -> RegistrySyncResult<OrgNumber> {
    OrgNumber::parse(raw)
        .map_err(|_| RegistrySyncError::InvalidPayload(format!("stored orgnr {raw:?} is invalid")))
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AddressColumns {
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub municipality_number: Option<String>,
    pub municipality: Option<String>,
    pub country_code: Option<String>
}

impl AddressColumns {
    pub fn from_address(address: Option<&Address>) -> Self {
        let address = address.cloned().unwrap_or_default();
        Self {
            street: address.street,
            postal_code: address.postal_code,
            city: address.city,
            municipality_number: address.municipality_number,
            municipality: address.municipality,
            country_code: address.country_code
        }
    }

    pub fn into_address(self) -> Option<Address> {
        let address = Address {
            street: self.street,
            postal_code: self.postal_code,
            city: self.city,
            municipality_number: self.municipality_number,
            municipality: self.municipality,
            country_code: self.country_code
        };
        (address != Address::default()).then_some(address)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CompanyRow {
    orgnr: String,
    name: String,
    org_form: Option<String>,
    industry_codes: Vec<String>,
    #[sqlx(flatten)]
    address: AddressColumns,
    employees: Option<i32>,
    founded: Option<NaiveDate>,
    registered: Option<NaiveDate>,
    bankrupt: bool,
    bankruptcy_date: Option<NaiveDate>,
    purpose: Option<String>
}

impl TryFrom<CompanyRow> for Company {
    type Error = RegistrySyncError;

    fn try_from(row: CompanyRow) -> Result<Self, Self::Error> {
        Ok(Company {
            orgnr: orgnr(&row.orgnr)?,
            name: row.name,
            org_form: row.org_form,
            industry_codes: row.industry_codes,
            address: row.address.into_address(),
            employees: row.employees,
            founded: row.founded,
            registered: row.registered,
            bankrupt: row.bankrupt,
            bankruptcy_date: row.bankruptcy_date,
            purpose: row.purpose
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubUnitRow {
    orgnr: String,
    parent_orgnr: Option<String>,
    name: String,
    org_form: Option<String>,
    industry_codes: Vec<String>,
    #[sqlx(flatten)]
    address: AddressColumns,
    employees: Option<i32>,
    started: Option<NaiveDate>
}

impl TryFrom<SubUnitRow> for SubUnit {
    type Error = RegistrySyncError;

    fn try_from(row: SubUnitRow) -> Result<Self, Self::Error> {
        Ok(SubUnit {
            orgnr: orgnr(&row.orgnr)?,
            parent_orgnr: row.parent_orgnr.as_deref().map(orgnr).transpose()?,
            name: row.name,
            org_form: row.org_form,
            industry_codes: row.industry_codes,
            address: row.address.into_address(),
            employees: row.employees,
            started: row.started
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RoleRow {
    orgnr: String,
    role_type: String,
    description: String,
    person_name: Option<String>,
    birth_date: Option<NaiveDate>,
    resigned: bool,
    sequence: i32
}

impl TryFrom<RoleRow> for Role {
    type Error = RegistrySyncError;

    fn try_from(row: RoleRow) -> Result<Self, Self::Error> {
        Ok(Role {
            orgnr: orgnr(&row.orgnr)?,
            role_type: row.role_type,
            description: row.description,
            person_name: row.person_name,
            birth_date: row.birth_date,
            resigned: row.resigned,
            sequence: row.sequence
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SyncErrorRow {
    id: i64,
    orgnr: String,
    entity_type: String,
    message: String,
    status: String,
    attempt_count: i32,
    created_at: DateTime<Utc>,
    last_retry_at: Option<DateTime<Utc>>,
    resolved_at: Option<DateTime<Utc>>
}

impl TryFrom<SyncErrorRow> for SyncErrorRecord {
    type Error = RegistrySyncError;

    fn try_from(row: SyncErrorRow) -> Result<Self, Self::Error> {
        Ok(SyncErrorRecord {
            id: row.id,
            orgnr: orgnr(&row.orgnr)?,
            entity_type: row.entity_type.parse()?,
            message: row.message,
            status: row.status.parse()?,
            attempt_count: row.attempt_count,
            created_at: row.created_at,
            last_retry_at: row.last_retry_at,
            resolved_at: row.resolved_at
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct QueueRow {
    orgnr: String,
    status: String,
    priority: i32,
    attempt_count: i32,
    last_error: Option<String>,
    company_fetched: bool,
    financials_count: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>
}

impl TryFrom<QueueRow> for ImportQueueEntry {
    type Error = RegistrySyncError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(ImportQueueEntry {
            orgnr: orgnr(&row.orgnr)?,
            status: row.status.parse()?,
            priority: row.priority,
            attempt_count: row.attempt_count,
            last_error: row.last_error,
            company_fetched: row.company_fetched,
            financials_count: row.financials_count,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at
        })
    }
}

pub(crate) fn convert_all<R, T>(rows: Vec<R>) -> RegistrySyncResult<Vec<T>>
where
    T: TryFrom<R, Error = RegistrySyncError>
{
    rows.into_iter().map(T::try_from).collect()
}

pub(crate) fn parse_orgnrs(raw: Vec<(String,)>) -> RegistrySyncResult<Vec<OrgNumber>> {
    raw.into_iter().map(|(value,)| orgnr(&value)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_address_columns_become_none() {
        let columns = AddressColumns::from_address(None);
        assert!(columns.into_address().is_none());

        let address = Address {
            city: Some("OSLO".to_string()),
            ..Default::default()
        };
        let columns = AddressColumns::from_address(Some(&address));
        assert_eq!(columns.into_address(), Some(address));
    }

    #[test]
    fn test_corrupt_orgnr_is_reported_as_payload_error() {
        let err = parse_orgnrs(vec![("12".to_string(),)]).unwrap_err();
        assert!(matches!(err, RegistrySyncError::InvalidPayload(_)));
    }
}
