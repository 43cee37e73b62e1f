#![allow(dead_code)]

use async_trait::async_trait;
use brreg_sync::error::{RegistrySyncError, RegistrySyncResult};
use brreg_sync::models::{
    Address, Company, FinancialStatement, PageCursor, Role, SubUnit, UpdateEvent, UpdatePage
};
use brreg_sync::{Fetched, OrgNumber, RegistryClient, UpdateStream};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Canned registry answer for one id.
#[derive(Debug, Clone)]
pub enum Reply<T> {
    Found(T),
    Gone,
    Fail(u16)
}

impl<T: Clone> Reply<T> {
    fn resolve(&self, resource: &str, orgnr: &OrgNumber) -> RegistrySyncResult<Fetched<T>> {
        match self {
            Self::Found(value) => Ok(Fetched::Found(value.clone())),
            Self::Gone => Ok(Fetched::Gone),
            Self::Fail(status) => Err(RegistrySyncError::external(
                resource,
                orgnr.as_str(),
                Some(*status),
                "scripted failure"
            ))
        }
    }
}

/// In-process registry: ids not scripted answer 410.
#[derive(Default)]
pub struct ScriptedRegistry {
    companies: Mutex<HashMap<OrgNumber, Reply<Company>>>,
    subunits: Mutex<HashMap<OrgNumber, Reply<SubUnit>>>,
    roles: Mutex<HashMap<OrgNumber, Reply<Vec<Role>>>>,
    financials: Mutex<HashMap<OrgNumber, Reply<Vec<FinancialStatement>>>>,
    pages: Mutex<HashMap<UpdateStream, Vec<Vec<UpdateEvent>>>>,
    upstream_subunits: Mutex<HashMap<OrgNumber, Vec<SubUnit>>>,
    entity_calls: AtomicUsize,
    page_requests: Mutex<Vec<PageCursor>>
}

impl ScriptedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn company(&self, orgnr: &str, reply: Reply<Company>) {
        self.companies.lock().unwrap().insert(org(orgnr), reply);
    }

    pub fn subunit(&self, orgnr: &str, reply: Reply<SubUnit>) {
        self.subunits.lock().unwrap().insert(org(orgnr), reply);
    }

    pub fn roles(&self, orgnr: &str, reply: Reply<Vec<Role>>) {
        self.roles.lock().unwrap().insert(org(orgnr), reply);
    }

    pub fn financials(&self, orgnr: &str, reply: Reply<Vec<FinancialStatement>>) {
        self.financials.lock().unwrap().insert(org(orgnr), reply);
    }

    /// Subunits the registry lists under `parent`.
    pub fn upstream_subunits(&self, parent: &str, subunits: Vec<SubUnit>) {
        self.upstream_subunits
            .lock()
            .unwrap()
            .insert(org(parent), subunits);
    }

    /// Update-stream pages served in order; each page links to the next.
    pub fn pages(&self, stream: UpdateStream, pages: Vec<Vec<UpdateEvent>>) {
        self.pages.lock().unwrap().insert(stream, pages);
    }

    pub fn entity_calls(&self) -> usize {
        self.entity_calls.load(Ordering::SeqCst)
    }

    pub fn page_requests(&self) -> Vec<PageCursor> {
        self.page_requests.lock().unwrap().clone()
    }

    fn lookup<T: Clone>(
        &self,
        table: &Mutex<HashMap<OrgNumber, Reply<T>>>,
        resource: &str,
        orgnr: &OrgNumber
    ) -> RegistrySyncResult<Fetched<T>> {
        self.entity_calls.fetch_add(1, Ordering::SeqCst);
        table
            .lock()
            .unwrap()
            .get(orgnr)
            .cloned()
            .unwrap_or(Reply::Gone)
            .resolve(resource, orgnr)
    }
}

#[async_trait]
impl RegistryClient for ScriptedRegistry {
    async fn fetch_entity(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Fetched<Company>> {
        self.lookup(&self.companies, "company", orgnr)
    }

    async fn fetch_subunit(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Fetched<SubUnit>> {
        self.lookup(&self.subunits, "subunit", orgnr)
    }

    async fn fetch_roles(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Fetched<Vec<Role>>> {
        self.lookup(&self.roles, "roles", orgnr)
    }

    async fn fetch_financials(
        &self,
        orgnr: &OrgNumber
    ) -> RegistrySyncResult<Fetched<Vec<FinancialStatement>>> {
        self.entity_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.financials.lock().unwrap().get(orgnr).cloned();
        match reply {
            Some(reply) => reply.resolve("financials", orgnr),
            None => Ok(Fetched::Found(Vec::new()))
        }
    }

    async fn fetch_update_page(
        &self,
        stream: UpdateStream,
        cursor: &PageCursor
    ) -> RegistrySyncResult<UpdatePage> {
        self.page_requests.lock().unwrap().push(cursor.clone());
        let index = match cursor {
            PageCursor::Start(_) => 0,
            PageCursor::Next(href) => href
                .trim_start_matches("page-")
                .parse::<usize>()
                .map_err(|_| RegistrySyncError::InvalidPayload(href.clone()))?
        };
        let pages = self.pages.lock().unwrap();
        let Some(pages) = pages.get(&stream) else {
            return Ok(UpdatePage::default());
        };
        let events = pages.get(index).cloned().unwrap_or_default();
        let next = (index + 1 < pages.len()).then(|| format!("page-{}", index + 1));
        Ok(UpdatePage { events, next })
    }

    async fn count_subunits(&self, parent: &OrgNumber) -> RegistrySyncResult<u64> {
        Ok(self
            .upstream_subunits
            .lock()
            .unwrap()
            .get(parent)
            .map_or(0, |s| s.len() as u64))
    }

    async fn list_subunits(&self, parent: &OrgNumber, limit: usize) -> RegistrySyncResult<Vec<SubUnit>> {
        Ok(self
            .upstream_subunits
            .lock()
            .unwrap()
            .get(parent)
            .map(|s| s.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

pub fn org(raw: &str) -> OrgNumber {
    OrgNumber::parse(raw).unwrap()
}

pub fn company(orgnr: &str, name: &str) -> Company {
    Company {
        orgnr: org(orgnr),
        name: name.to_string(),
        org_form: Some("AS".to_string()),
        industry_codes: vec!["62.010".to_string()],
        address: Some(Address {
            street: Some("Havnegata 48".to_string()),
            postal_code: Some("8900".to_string()),
            city: Some("BRØNNØYSUND".to_string()),
            municipality_number: Some("1813".to_string()),
            municipality: Some("BRØNNØY".to_string()),
            country_code: Some("NO".to_string())
        }),
        employees: Some(12),
        founded: None,
        registered: None,
        bankrupt: false,
        bankruptcy_date: None,
        purpose: None
    }
}

pub fn subunit(orgnr: &str, parent: &str) -> SubUnit {
    SubUnit {
        orgnr: org(orgnr),
        parent_orgnr: Some(org(parent)),
        name: format!("Avdeling {orgnr}"),
        org_form: Some("BEDR".to_string()),
        industry_codes: Vec::new(),
        address: None,
        employees: Some(3),
        started: None
    }
}

pub fn role(orgnr: &str, role_type: &str, person: &str, sequence: i32) -> Role {
    Role {
        orgnr: org(orgnr),
        role_type: role_type.to_string(),
        description: role_type.to_string(),
        person_name: Some(person.to_string()),
        birth_date: None,
        resigned: false,
        sequence
    }
}

pub fn statement(orgnr: &str, year: i32) -> FinancialStatement {
    FinancialStatement {
        orgnr: org(orgnr),
        year,
        revenue: Some(1_000_000),
        operating_result: Some(100_000),
        net_result: Some(80_000),
        equity: Some(500_000),
        total_assets: Some(900_000)
    }
}

pub fn event(update_id: i64, orgnr: &str) -> UpdateEvent {
    UpdateEvent {
        update_id,
        orgnr: org(orgnr),
        change_type: Some("Endring".to_string()),
        changed_at: None
    }
}
