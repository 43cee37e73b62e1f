//! Wire types for the Enhetsregisteret and Regnskapsregisteret JSON APIs and
//! their conversion into the engine's models.

use crate::models::{
    Address, Company, FinancialStatement, OrgNumber, Role, SubUnit, UpdateEvent, UpdatePage
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CodeDescription {
    pub kode: String,
    #[serde(default)]
    pub beskrivelse: Option<String>
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AddressPayload {
    #[serde(default)]
    pub adresse: Vec<String>,
    pub postnummer: Option<String>,
    pub poststed: Option<String>,
    pub kommunenummer: Option<String>,
    pub kommune: Option<String>,
    pub landkode: Option<String>
}

impl From<AddressPayload> for Address {
    fn from(payload: AddressPayload) -> Self {
        let street = payload
            .adresse
            .into_iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        Address {
            street: if street.is_empty() { None } else { Some(street) },
            postal_code: payload.postnummer,
            city: payload.poststed,
            municipality_number: payload.kommunenummer,
            municipality: payload.kommune,
            country_code: payload.landkode
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EnhetPayload {
    pub organisasjonsnummer: String,
    pub navn: String,
    pub organisasjonsform: Option<CodeDescription>,
    pub naeringskode1: Option<CodeDescription>,
    pub naeringskode2: Option<CodeDescription>,
    pub naeringskode3: Option<CodeDescription>,
    pub antall_ansatte: Option<i32>,
    pub forretningsadresse: Option<AddressPayload>,
    pub postadresse: Option<AddressPayload>,
    pub stiftelsesdato: Option<NaiveDate>,
    pub registreringsdato_enhetsregisteret: Option<NaiveDate>,
    #[serde(default)]
    pub konkurs: bool,
    pub konkursdato: Option<NaiveDate>,
    #[serde(default)]
    pub vedtektsfestet_formaal: Vec<String>,
    #[serde(default)]
    pub aktivitet: Vec<String>
}

impl EnhetPayload {
    pub fn into_company(self) -> Result<Company, crate::error::RegistrySyncError> {
        let industry_codes = industry_codes([self.naeringskode1, self.naeringskode2, self.naeringskode3]);
        let purpose_lines = if self.vedtektsfestet_formaal.is_empty() {
            self.aktivitet
        } else {
            self.vedtektsfestet_formaal
        };
        let purpose = purpose_lines.join(" ").trim().to_string();

        Ok(Company {
            orgnr: OrgNumber::parse(&self.organisasjonsnummer)?,
            name: self.navn,
            org_form: self.organisasjonsform.map(|f| f.kode),
            industry_codes,
            address: self
                .forretningsadresse
                .or(self.postadresse)
                .map(Address::from),
            employees: self.antall_ansatte,
            founded: self.stiftelsesdato,
            registered: self.registreringsdato_enhetsregisteret,
            bankrupt: self.konkurs,
            bankruptcy_date: self.konkursdato,
            purpose: if purpose.is_empty() { None } else { Some(purpose) }
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UnderenhetPayload {
    pub organisasjonsnummer: String,
    pub navn: String,
    pub overordnet_enhet: Option<String>,
    pub organisasjonsform: Option<CodeDescription>,
    pub naeringskode1: Option<CodeDescription>,
    pub naeringskode2: Option<CodeDescription>,
    pub naeringskode3: Option<CodeDescription>,
    pub antall_ansatte: Option<i32>,
    pub beliggenhetsadresse: Option<AddressPayload>,
    pub postadresse: Option<AddressPayload>,
    pub oppstartsdato: Option<NaiveDate>
}

impl UnderenhetPayload {
    pub fn into_subunit(self) -> Result<SubUnit, crate::error::RegistrySyncError> {
        let parent_orgnr = match self.overordnet_enhet.as_deref() {
            Some(raw) => Some(OrgNumber::parse(raw)?),
            None => None
        };

        Ok(SubUnit {
            orgnr: OrgNumber::parse(&self.organisasjonsnummer)?,
            parent_orgnr,
            name: self.navn,
            org_form: self.organisasjonsform.map(|f| f.kode),
            industry_codes: industry_codes([self.naeringskode1, self.naeringskode2, self.naeringskode3]),
            address: self
                .beliggenhetsadresse
                .or(self.postadresse)
                .map(Address::from),
            employees: self.antall_ansatte,
            started: self.oppstartsdato
        })
    }
}

fn industry_codes(codes: [Option<CodeDescription>; 3]) -> Vec<String> {
    codes.into_iter().flatten().map(|c| c.kode).collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RollerPayload {
    #[serde(default)]
    pub rollegrupper: Vec<RolleGruppe>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RolleGruppe {
    #[serde(default)]
    pub roller: Vec<RollePayload>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RollePayload {
    #[serde(rename = "type")]
    pub rolle_type: CodeDescription,
    pub person: Option<PersonPayload>,
    pub enhet: Option<RolleEnhetPayload>,
    #[serde(default)]
    pub fratraadt: bool,
    pub rekkefolge: Option<i32>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PersonPayload {
    pub fodselsdato: Option<NaiveDate>,
    pub navn: Option<PersonNavn>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PersonNavn {
    pub fornavn: Option<String>,
    pub mellomnavn: Option<String>,
    pub etternavn: Option<String>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RolleEnhetPayload {
    #[serde(default)]
    pub navn: Vec<String>
}

impl RollerPayload {
    pub fn into_roles(self, orgnr: &OrgNumber) -> Vec<Role> {
        let mut roles = Vec::new();
        for (index, rolle) in self
            .rollegrupper
            .into_iter()
            .flat_map(|g| g.roller)
            .enumerate()
        {
            let person_name = match (&rolle.person, &rolle.enhet) {
                (Some(person), _) => person.navn.as_ref().map(|n| {
                    [&n.fornavn, &n.mellomnavn, &n.etternavn]
                        .into_iter()
                        .flatten()
                        .map(|part| part.trim())
                        .filter(|part| !part.is_empty())
                        .collect::<Vec<_>>()
                        .join(" ")
                }),
                (None, Some(enhet)) if !enhet.navn.is_empty() => Some(enhet.navn.join(" ")),
                _ => None
            };

            roles.push(Role {
                orgnr: orgnr.clone(),
                description: rolle
                    .rolle_type
                    .beskrivelse
                    .clone()
                    .unwrap_or_else(|| rolle.rolle_type.kode.clone()),
                role_type: rolle.rolle_type.kode,
                person_name,
                birth_date: rolle.person.and_then(|p| p.fodselsdato),
                resigned: rolle.fratraadt,
                sequence: rolle.rekkefolge.unwrap_or(index as i32)
            });
        }
        roles
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegnskapPayload {
    pub regnskapsperiode: Option<Regnskapsperiode>,
    pub resultatregnskap_resultat: Option<ResultatPayload>,
    pub eiendeler: Option<EiendelerPayload>,
    pub egenkapital_gjeld: Option<EgenkapitalGjeldPayload>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Regnskapsperiode {
    pub til_dato: NaiveDate
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResultatPayload {
    pub aarsresultat: Option<f64>,
    pub driftsresultat: Option<DriftsresultatPayload>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DriftsresultatPayload {
    pub driftsresultat: Option<f64>,
    pub driftsinntekter: Option<DriftsinntekterPayload>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DriftsinntekterPayload {
    pub sum_driftsinntekter: Option<f64>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EiendelerPayload {
    pub sum_eiendeler: Option<f64>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EgenkapitalGjeldPayload {
    pub egenkapital: Option<EgenkapitalPayload>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EgenkapitalPayload {
    pub sum_egenkapital: Option<f64>
}

impl RegnskapPayload {
    pub fn into_statement(self, orgnr: &OrgNumber) -> Option<FinancialStatement> {
        use chrono::Datelike;

        let year = self.regnskapsperiode?.til_dato.year();
        let driftsresultat = self
            .resultatregnskap_resultat
            .as_ref()
            .and_then(|r| r.driftsresultat.as_ref());

        Some(FinancialStatement {
            orgnr: orgnr.clone(),
            year,
            revenue: driftsresultat
                .and_then(|d| d.driftsinntekter.as_ref())
                .and_then(|i| i.sum_driftsinntekter)
                .map(round),
            operating_result: driftsresultat.and_then(|d| d.driftsresultat).map(round),
            net_result: self
                .resultatregnskap_resultat
                .as_ref()
                .and_then(|r| r.aarsresultat)
                .map(round),
            equity: self
                .egenkapital_gjeld
                .and_then(|e| e.egenkapital)
                .and_then(|e| e.sum_egenkapital)
                .map(round),
            total_assets: self.eiendeler.and_then(|e| e.sum_eiendeler).map(round)
        })
    }
}

fn round(value: f64) -> i64 {
    value.round() as i64
}

/// Parses one HAL page of an update stream.
///
/// The embedded array name differs per stream (`oppdaterteEnheter`,
/// `oppdaterteUnderenheter`, ...), so the first array under `_embedded` is
/// taken. Items with malformed organization numbers are dropped.
pub(crate) fn parse_update_page(body: &Value) -> UpdatePage {
    let items = body
        .get("_embedded")
        .and_then(Value::as_object)
        .and_then(|embedded| embedded.values().find_map(Value::as_array))
        .cloned()
        .unwrap_or_default();

    let mut events = Vec::with_capacity(items.len());
    for item in &items {
        let Some(update_id) = item.get("oppdateringsid").and_then(Value::as_i64) else {
            warn!(item = %item, "Update event without oppdateringsid");
            continue;
        };
        events.extend(update_event(
            update_id,
            item.get("organisasjonsnummer"),
            item.get("endringstype"),
            item.get("dato")
        ));
    }

    let next = body
        .pointer("/_links/next/href")
        .and_then(Value::as_str)
        .map(str::to_string);

    UpdatePage { events, next }
}

/// One page of the role change feed.
pub(crate) struct RoleFeedPage {
    pub events: Vec<UpdateEvent>,
    /// Items on the page, including ones dropped as malformed.
    pub item_count: usize,
    pub last_id: Option<i64>
}

/// Parses the role change feed, a bare JSON array of CloudEvents of the form
/// `{"id": 5, "type": "...", "time": "...", "data": {"organisasjonsnummer": "..."}}`.
pub(crate) fn parse_role_update_page(body: &Value) -> RoleFeedPage {
    let items = body.as_array().map(Vec::as_slice).unwrap_or_default();

    let mut events = Vec::with_capacity(items.len());
    let mut last_id = None;
    for item in items {
        let Some(update_id) = item.get("id").and_then(Value::as_i64) else {
            warn!(item = %item, "Role event without id");
            continue;
        };
        last_id = last_id.max(Some(update_id));
        events.extend(update_event(
            update_id,
            item.pointer("/data/organisasjonsnummer"),
            item.get("type"),
            item.get("time")
        ));
    }

    RoleFeedPage {
        events,
        item_count: items.len(),
        last_id
    }
}

fn update_event(
    update_id: i64,
    orgnr: Option<&Value>,
    change_type: Option<&Value>,
    changed_at: Option<&Value>
) -> Option<UpdateEvent> {
    let raw_orgnr = orgnr.and_then(Value::as_str).unwrap_or_default();
    let orgnr = match OrgNumber::parse(raw_orgnr) {
        Ok(orgnr) => orgnr,
        Err(e) => {
            warn!(update_id, error = %e, "Skipping update event with invalid orgnr");
            return None;
        }
    };

    Some(UpdateEvent {
        update_id,
        orgnr,
        change_type: change_type.and_then(Value::as_str).map(str::to_string),
        changed_at: changed_at
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orgnr() -> OrgNumber {
        OrgNumber::parse("923609016").unwrap()
    }

    #[test]
    fn test_enhet_to_company() {
        let payload: EnhetPayload = serde_json::from_value(json!({
            "organisasjonsnummer": "923609016",
            "navn": "EQUINOR ASA",
            "organisasjonsform": {"kode": "ASA", "beskrivelse": "Allmennaksjeselskap"},
            "naeringskode1": {"kode": "06.100", "beskrivelse": "Utvinning av råolje"},
            "antallAnsatte": 21000,
            "forretningsadresse": {
                "adresse": ["Forusbeen 50"],
                "postnummer": "4035",
                "poststed": "STAVANGER",
                "kommunenummer": "1103",
                "kommune": "STAVANGER",
                "landkode": "NO"
            },
            "stiftelsesdato": "1972-09-18",
            "konkurs": false,
            "vedtektsfestetFormaal": ["Utvinning av petroleum."]
        }))
        .unwrap();

        let company = payload.into_company().unwrap();
        assert_eq!(company.orgnr, orgnr());
        assert_eq!(company.org_form.as_deref(), Some("ASA"));
        assert_eq!(company.industry_codes, vec!["06.100".to_string()]);
        assert_eq!(company.employees, Some(21000));
        assert_eq!(
            company.address.as_ref().and_then(|a| a.street.as_deref()),
            Some("Forusbeen 50")
        );
        assert_eq!(company.purpose.as_deref(), Some("Utvinning av petroleum."));
        assert!(!company.bankrupt);
    }

    #[test]
    fn test_underenhet_keeps_parent() {
        let payload: UnderenhetPayload = serde_json::from_value(json!({
            "organisasjonsnummer": "973152351",
            "navn": "EQUINOR ASA AVD FORUS",
            "overordnetEnhet": "923609016",
            "beliggenhetsadresse": {"adresse": ["Forusbeen 50"], "kommunenummer": "1103"}
        }))
        .unwrap();

        let subunit = payload.into_subunit().unwrap();
        assert_eq!(subunit.parent_orgnr, Some(orgnr()));
        assert_eq!(
            subunit.address.and_then(|a| a.municipality_number),
            Some("1103".to_string())
        );
    }

    #[test]
    fn test_roles_flatten_groups_and_names() {
        let payload: RollerPayload = serde_json::from_value(json!({
            "rollegrupper": [
                {"roller": [{
                    "type": {"kode": "DAGL", "beskrivelse": "Daglig leder"},
                    "person": {
                        "fodselsdato": "1970-01-02",
                        "navn": {"fornavn": "Kari", "mellomnavn": null, "etternavn": "Nordmann"}
                    },
                    "fratraadt": false,
                    "rekkefolge": 0
                }]},
                {"roller": [{
                    "type": {"kode": "REVI", "beskrivelse": "Revisor"},
                    "enhet": {"organisasjonsnummer": "976389387", "navn": ["ERNST & YOUNG AS"]},
                    "fratraadt": true
                }]}
            ]
        }))
        .unwrap();

        let roles = payload.into_roles(&orgnr());
        assert_eq!(roles.len(), 2);
        assert_eq!(roles[0].person_name.as_deref(), Some("Kari Nordmann"));
        assert_eq!(roles[0].description, "Daglig leder");
        assert_eq!(roles[1].person_name.as_deref(), Some("ERNST & YOUNG AS"));
        assert!(roles[1].resigned);
        assert_eq!(roles[1].sequence, 1);
    }

    #[test]
    fn test_regnskap_to_statement() {
        let payload: RegnskapPayload = serde_json::from_value(json!({
            "regnskapsperiode": {"fraDato": "2023-01-01", "tilDato": "2023-12-31"},
            "resultatregnskapResultat": {
                "aarsresultat": 1200.4,
                "driftsresultat": {
                    "driftsresultat": 1500,
                    "driftsinntekter": {"sumDriftsinntekter": 9000}
                }
            },
            "eiendeler": {"sumEiendeler": 20000},
            "egenkapitalGjeld": {"egenkapital": {"sumEgenkapital": 8000}}
        }))
        .unwrap();

        let statement = payload.into_statement(&orgnr()).unwrap();
        assert_eq!(statement.year, 2023);
        assert_eq!(statement.revenue, Some(9000));
        assert_eq!(statement.net_result, Some(1200));
        assert_eq!(statement.equity, Some(8000));
        assert_eq!(statement.total_assets, Some(20000));
    }

    #[test]
    fn test_update_page_parsing_skips_bad_items() {
        let page = parse_update_page(&json!({
            "_embedded": {
                "oppdaterteUnderenheter": [
                    {"oppdateringsid": 10, "organisasjonsnummer": "973152351", "endringstype": "Endring", "dato": "2024-03-01T06:00:00.000Z"},
                    {"oppdateringsid": 11, "organisasjonsnummer": "bogus"},
                    {"organisasjonsnummer": "973152351"}
                ]
            },
            "_links": {"next": {"href": "https://example.test/next"}}
        }));

        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].update_id, 10);
        assert_eq!(page.events[0].change_type.as_deref(), Some("Endring"));
        assert!(page.events[0].changed_at.is_some());
        assert_eq!(page.next.as_deref(), Some("https://example.test/next"));
    }

    #[test]
    fn test_update_page_without_embedded_is_empty() {
        let page = parse_update_page(&json!({"_links": {}}));
        assert!(page.events.is_empty());
        assert!(page.next.is_none());
    }

    #[test]
    fn test_role_feed_reads_cloud_events() {
        let page = parse_role_update_page(&json!([
            {
                "id": 5,
                "source": "https://data.brreg.no/enhetsregisteret/api/roller",
                "type": "no.brreg.enhetsregisteret.rolle.oppdatert",
                "time": "2024-03-01T06:00:00.000Z",
                "data": {"organisasjonsnummer": "923609016"}
            },
            {"id": 7, "data": {"organisasjonsnummer": "bogus"}},
            {"data": {"organisasjonsnummer": "923609016"}}
        ]));

        assert_eq!(page.item_count, 3);
        assert_eq!(page.last_id, Some(7));
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].update_id, 5);
        assert_eq!(page.events[0].orgnr.as_str(), "923609016");
        assert_eq!(
            page.events[0].change_type.as_deref(),
            Some("no.brreg.enhetsregisteret.rolle.oppdatert")
        );
        assert!(page.events[0].changed_at.is_some());
    }

    #[test]
    fn test_role_feed_ignores_hal_shaped_body() {
        let page = parse_role_update_page(&json!({"_embedded": {}}));
        assert!(page.events.is_empty());
        assert_eq!(page.item_count, 0);
        assert!(page.last_id.is_none());
    }
}
