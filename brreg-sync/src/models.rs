use crate::error::RegistrySyncError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Nine-digit organization number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrgNumber(String);

impl OrgNumber {
    pub fn parse(raw: &str) -> Result<Self, RegistrySyncError> {
        let digits: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        if digits.len() != 9 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(RegistrySyncError::ValidationError(format!(
                "invalid organization number: {raw:?}"
            )));
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for OrgNumber {
    type Err = RegistrySyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OrgNumber {
    type Error = RegistrySyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrgNumber> for String {
    fn from(value: OrgNumber) -> Self {
        value.0
    }
}

impl fmt::Display for OrgNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Company,
    Subunit,
    Role,
    Financials
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::Subunit => "subunit",
            Self::Role => "role",
            Self::Financials => "financials"
        }
    }
}

impl FromStr for EntityType {
    type Err = RegistrySyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "company" => Ok(Self::Company),
            "subunit" => Ok(Self::Subunit),
            "role" => Ok(Self::Role),
            "financials" => Ok(Self::Financials),
            other => Err(RegistrySyncError::ValidationError(format!(
                "unknown entity type: {other}"
            )))
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub municipality_number: Option<String>,
    pub municipality: Option<String>,
    pub country_code: Option<String>
}

impl Address {
    /// Free-text form used for geocoding lookups.
    pub fn search_text(&self) -> Option<String> {
        let street = self.street.as_deref()?.trim();
        if street.is_empty() {
            return None;
        }
        Some(street.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub orgnr: OrgNumber,
    pub name: String,
    pub org_form: Option<String>,
    pub industry_codes: Vec<String>,
    pub address: Option<Address>,
    pub employees: Option<i32>,
    pub founded: Option<NaiveDate>,
    pub registered: Option<NaiveDate>,
    pub bankrupt: bool,
    pub bankruptcy_date: Option<NaiveDate>,
    pub purpose: Option<String>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubUnit {
    pub orgnr: OrgNumber,
    pub parent_orgnr: Option<OrgNumber>,
    pub name: String,
    pub org_form: Option<String>,
    pub industry_codes: Vec<String>,
    pub address: Option<Address>,
    pub employees: Option<i32>,
    pub started: Option<NaiveDate>
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub orgnr: OrgNumber,
    pub role_type: String,
    pub description: String,
    pub person_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub resigned: bool,
    pub sequence: i32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialStatement {
    pub orgnr: OrgNumber,
    pub year: i32,
    pub revenue: Option<i64>,
    pub operating_result: Option<i64>,
    pub net_result: Option<i64>,
    pub equity: Option<i64>,
    pub total_assets: Option<i64>
}

/// Outcome of a registry lookup that did not fail.
///
/// `Gone` is the registry's HTTP 410: the identifier was deleted upstream.
/// It is terminal and never recorded as a sync error.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Found(T),
    Gone
}

impl<T> Fetched<T> {
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone)
    }

    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::Gone => None
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        match self {
            Self::Found(value) => Fetched::Found(f(value)),
            Self::Gone => Fetched::Gone
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorStatus {
    Pending,
    Retrying,
    Resolved,
    PermanentFailure
}

impl SyncErrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Resolved => "resolved",
            Self::PermanentFailure => "permanent_failure"
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Resolved)
    }
}

impl FromStr for SyncErrorStatus {
    type Err = RegistrySyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "resolved" => Ok(Self::Resolved),
            "permanent_failure" => Ok(Self::PermanentFailure),
            other => Err(RegistrySyncError::ValidationError(format!(
                "unknown sync error status: {other}"
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    pub id: i64,
    pub orgnr: OrgNumber,
    pub entity_type: EntityType,
    pub message: String,
    pub status: SyncErrorStatus,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorCount {
    pub entity_type: EntityType,
    pub status: SyncErrorStatus,
    pub count: i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped"
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl FromStr for ImportStatus {
    type Err = RegistrySyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(RegistrySyncError::ValidationError(format!(
                "unknown import status: {other}"
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportQueueEntry {
    pub orgnr: OrgNumber,
    pub status: ImportStatus,
    pub priority: i32,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub company_fetched: bool,
    pub financials_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>
}

/// Outcome of importing one organization number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub orgnr: OrgNumber,
    pub company_fetched: bool,
    pub financials_count: usize,
    pub gone: bool,
    pub error: Option<String>
}

impl ImportResult {
    pub fn new(orgnr: OrgNumber) -> Self {
        Self {
            orgnr,
            company_fetched: false,
            financials_count: 0,
            gone: false,
            error: None
        }
    }

    pub fn status(&self) -> ImportStatus {
        if self.error.is_some() {
            ImportStatus::Failed
        } else if self.gone {
            ImportStatus::Skipped
        } else {
            ImportStatus::Completed
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulateReport {
    pub added: u64,
    pub skipped: u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStatusCount {
    pub status: ImportStatus,
    pub count: i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStream {
    Companies,
    Subunits,
    Roles
}

impl UpdateStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Companies => "companies",
            Self::Subunits => "subunits",
            Self::Roles => "roles"
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Companies => EntityType::Company,
            Self::Subunits => EntityType::Subunit,
            Self::Roles => EntityType::Role
        }
    }

    pub fn cursor_key(&self) -> String {
        format!("updates.{}.latest_oppdateringsid", self.as_str())
    }

    pub fn sync_date_key(&self) -> String {
        format!("updates.{}.last_sync_date", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub update_id: i64,
    pub orgnr: OrgNumber,
    pub change_type: Option<String>,
    pub changed_at: Option<DateTime<Utc>>
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatePage {
    pub events: Vec<UpdateEvent>,
    pub next: Option<String>
}

/// Where an update-stream read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateSince {
    /// Resume after this update id (exclusive).
    After(i64),
    /// Everything changed on or after this date.
    Date(NaiveDate)
}

impl UpdateSince {
    pub fn parse_date(raw: &str) -> Result<Self, RegistrySyncError> {
        NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map(Self::Date)
            .map_err(|e| RegistrySyncError::ValidationError(format!("invalid date {raw:?}: {e}")))
    }
}

/// Page request issued to the update stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    Start(UpdateSince),
    Next(String)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeCandidate {
    pub orgnr: OrgNumber,
    pub address: Address,
    pub attempts: i32
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationRecord {
    pub municipality_number: String,
    pub year: i32,
    pub population: i64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndustryStat {
    pub industry_code: String,
    pub company_count: i64,
    pub employee_count: i64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountyStat {
    pub county_number: String,
    pub company_count: i64,
    pub employee_count: i64,
    pub population: Option<i64>
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orgnr_accepts_spaced_digits() {
        let orgnr = OrgNumber::parse("923 609 016").unwrap();
        assert_eq!(orgnr.as_str(), "923609016");
        assert_eq!(orgnr.to_string(), "923609016");
    }

    #[test]
    fn test_orgnr_rejects_wrong_length_and_letters() {
        assert!(OrgNumber::parse("12345678").is_err());
        assert!(OrgNumber::parse("1234567890").is_err());
        assert!(OrgNumber::parse("12345678x").is_err());
        assert!(OrgNumber::parse("").is_err());
    }

    #[test]
    fn test_orgnr_deserialization_validates() {
        let ok: OrgNumber = serde_json::from_str("\"923609016\"").unwrap();
        assert_eq!(ok.as_str(), "923609016");
        assert!(serde_json::from_str::<OrgNumber>("\"abc\"").is_err());
    }

    #[test]
    fn test_status_strings_match_storage_values() {
        assert_eq!(SyncErrorStatus::PermanentFailure.as_str(), "permanent_failure");
        assert_eq!(
            "retrying".parse::<SyncErrorStatus>().unwrap(),
            SyncErrorStatus::Retrying
        );
        assert_eq!(ImportStatus::InProgress.as_str(), "in_progress");
        assert!(ImportStatus::Skipped.is_terminal());
        assert!(!ImportStatus::Pending.is_terminal());
        assert!(SyncErrorStatus::PermanentFailure.is_open());
        assert!(!SyncErrorStatus::Resolved.is_open());
    }

    #[test]
    fn test_update_since_rejects_malformed_dates() {
        assert_eq!(
            UpdateSince::parse_date("2024-03-01").unwrap(),
            UpdateSince::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert!(matches!(
            UpdateSince::parse_date("01.03.2024"),
            Err(RegistrySyncError::ValidationError(_))
        ));
    }

    #[test]
    fn test_stream_state_keys() {
        assert_eq!(
            UpdateStream::Roles.cursor_key(),
            "updates.roles.latest_oppdateringsid"
        );
        assert_eq!(
            UpdateStream::Subunits.sync_date_key(),
            "updates.subunits.last_sync_date"
        );
        assert_eq!(UpdateStream::Companies.entity_type(), EntityType::Company);
    }

    #[test]
    fn test_fetched_helpers() {
        let found = Fetched::Found(3);
        assert!(!found.is_gone());
        assert_eq!(found.clone().map(|v| v * 2), Fetched::Found(6));
        assert_eq!(found.found(), Some(3));
        assert_eq!(Fetched::<i32>::Gone.found(), None);
    }
}
