mod payload;

use crate::config::{RegistrySyncConfig, RetryConfig};
use crate::error::{RegistrySyncError, RegistrySyncResult};
use crate::models::{
    Company, FinancialStatement, Fetched, OrgNumber, PageCursor, Role, SubUnit, UpdatePage,
    UpdateSince, UpdateStream
};
use crate::rate_limit::RateLimiter;
use crate::telemetry::Telemetry;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::NaiveDate;
use payload::{EnhetPayload, RegnskapPayload, RollerPayload, UnderenhetPayload};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Read access to the upstream registry.
///
/// Lookups return [`Fetched::Gone`] for identifiers the registry reports as
/// deleted; every `Err` is a genuine failure after retries.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn fetch_entity(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Fetched<Company>>;
    async fn fetch_subunit(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Fetched<SubUnit>>;
    async fn fetch_roles(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Fetched<Vec<Role>>>;
    async fn fetch_financials(
        &self,
        orgnr: &OrgNumber
    ) -> RegistrySyncResult<Fetched<Vec<FinancialStatement>>>;
    async fn fetch_update_page(
        &self,
        stream: UpdateStream,
        cursor: &PageCursor
    ) -> RegistrySyncResult<UpdatePage>;
    async fn count_subunits(&self, parent: &OrgNumber) -> RegistrySyncResult<u64>;
    async fn list_subunits(&self, parent: &OrgNumber, limit: usize)
    -> RegistrySyncResult<Vec<SubUnit>>;
}

pub struct BrregClient {
    client: Client,
    base_url: String,
    financials_base_url: String,
    page_size: u32,
    retry: RetryConfig,
    limiter: Arc<RateLimiter>
}

impl BrregClient {
    pub fn new(config: &RegistrySyncConfig, limiter: Arc<RateLimiter>) -> RegistrySyncResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("brreg-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(RegistrySyncError::HttpError)?;

        Ok(Self {
            client,
            base_url: config.registry.base_url.trim_end_matches('/').to_string(),
            financials_base_url: config
                .registry
                .financials_base_url
                .trim_end_matches('/')
                .to_string(),
            page_size: config.registry.page_size,
            retry: config.retry.clone(),
            limiter
        })
    }

    fn url(&self, base: &str, path: &str, params: &[(&str, String)]) -> RegistrySyncResult<Url> {
        let raw = format!("{base}{path}");
        let parsed = if params.is_empty() {
            Url::parse(&raw)
        } else {
            Url::parse_with_params(&raw, params)
        };
        parsed.map_err(|e| RegistrySyncError::ConfigError(format!("invalid registry url {raw}: {e}")))
    }

    /// Issues a GET with rate limiting and retries.
    ///
    /// 5xx, transport errors and 429 are retried up to `max_retries` times;
    /// 429 waits for the upstream `Retry-After`. Exhaustion is reported as
    /// [`RegistrySyncError::ExternalApiError`].
    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        resource: &str,
        id: &str,
        url: Url
    ) -> RegistrySyncResult<Fetched<T>> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.retry.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.retry.max_backoff_ms))
            .with_max_elapsed_time(None)
            .build();

        let max_attempts = self.retry.max_retries + 1;
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let url = &url;

        let result = backoff::future::retry(policy, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.limiter.acquire().await;

            match self.send_once::<T>(resource, id, url).await {
                Ok(value) => Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    Telemetry::record_retry(resource);
                    warn!(
                        resource,
                        id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "Registry request failed, retrying"
                    );
                    match err.retry_after() {
                        Some(seconds) => Err(backoff::Error::retry_after(
                            err,
                            Duration::from_secs(seconds)
                        )),
                        None => Err(backoff::Error::transient(err))
                    }
                }
                Err(err) => Err(backoff::Error::permanent(err))
            }
        })
        .await;

        result.map_err(|err| match err {
            RegistrySyncError::ExternalApiError { .. } => err,
            other => RegistrySyncError::external(resource, id, other.status(), other)
        })
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        resource: &str,
        id: &str,
        url: &Url
    ) -> RegistrySyncResult<Fetched<T>> {
        debug!(url = %url, "Making registry API request");

        let response = self
            .client
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        Telemetry::record_request(resource, status.as_u16());

        match status {
            s if s.is_success() => Ok(Fetched::Found(response.json::<T>().await?)),
            StatusCode::GONE => {
                Telemetry::record_gone(resource);
                Ok(Fetched::Gone)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .unwrap_or_else(|| (self.retry.rate_limit_backoff_ms / 1000).max(1));
                Err(RegistrySyncError::RateLimited {
                    retry_after_seconds: retry_after
                })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RegistrySyncError::external(
                    resource,
                    id,
                    Some(status.as_u16()),
                    if body.is_empty() {
                        status.to_string()
                    } else {
                        body
                    }
                ))
            }
        }
    }

    fn update_path(stream: UpdateStream) -> &'static str {
        match stream {
            UpdateStream::Companies => "/oppdateringer/enheter",
            UpdateStream::Subunits => "/oppdateringer/underenheter",
            UpdateStream::Roles => "/oppdateringer/roller"
        }
    }

    fn update_start_url(&self, stream: UpdateStream, since: &UpdateSince) -> RegistrySyncResult<Url> {
        let size = ("size", self.page_size.to_string());
        let params = match (stream, since) {
            (UpdateStream::Roles, UpdateSince::After(update_id)) => {
                [("afterId", update_id.to_string()), size]
            }
            (UpdateStream::Roles, UpdateSince::Date(date)) => [("afterTime", midnight(date)), size],
            (_, UpdateSince::After(update_id)) => {
                [("oppdateringsid", (update_id + 1).to_string()), size]
            }
            (_, UpdateSince::Date(date)) => [("dato", midnight(date)), size]
        };
        self.url(&self.base_url, Self::update_path(stream), &params)
    }

    async fn subunit_page(
        &self,
        parent: &OrgNumber,
        page: u32,
        size: u32
    ) -> RegistrySyncResult<Value> {
        let url = self.url(
            &self.base_url,
            "/underenheter",
            &[
                ("overordnetEnhet", parent.to_string()),
                ("page", page.to_string()),
                ("size", size.to_string())
            ]
        )?;
        match self.get_json::<Value>("underenheter", parent.as_str(), url).await? {
            Fetched::Found(body) => Ok(body),
            Fetched::Gone => Ok(Value::Null)
        }
    }
}

fn midnight(date: &NaiveDate) -> String {
    format!("{}T00:00:00.000Z", date.format("%Y-%m-%d"))
}

#[async_trait]
impl RegistryClient for BrregClient {
    async fn fetch_entity(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Fetched<Company>> {
        let url = self.url(&self.base_url, &format!("/enheter/{orgnr}"), &[])?;
        match self.get_json::<EnhetPayload>("enhet", orgnr.as_str(), url).await? {
            Fetched::Found(payload) => Ok(Fetched::Found(payload.into_company()?)),
            Fetched::Gone => Ok(Fetched::Gone)
        }
    }

    async fn fetch_subunit(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Fetched<SubUnit>> {
        let url = self.url(&self.base_url, &format!("/underenheter/{orgnr}"), &[])?;
        match self
            .get_json::<UnderenhetPayload>("underenhet", orgnr.as_str(), url)
            .await?
        {
            Fetched::Found(payload) => Ok(Fetched::Found(payload.into_subunit()?)),
            Fetched::Gone => Ok(Fetched::Gone)
        }
    }

    async fn fetch_roles(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Fetched<Vec<Role>>> {
        let url = self.url(&self.base_url, &format!("/enheter/{orgnr}/roller"), &[])?;
        let fetched = self
            .get_json::<RollerPayload>("roller", orgnr.as_str(), url)
            .await?;
        Ok(fetched.map(|payload| payload.into_roles(orgnr)))
    }

    async fn fetch_financials(
        &self,
        orgnr: &OrgNumber
    ) -> RegistrySyncResult<Fetched<Vec<FinancialStatement>>> {
        let url = self.url(&self.financials_base_url, &format!("/{orgnr}"), &[])?;
        match self
            .get_json::<Vec<RegnskapPayload>>("regnskap", orgnr.as_str(), url)
            .await
        {
            Ok(fetched) => Ok(fetched.map(|statements| {
                statements
                    .into_iter()
                    .filter_map(|s| s.into_statement(orgnr))
                    .collect()
            })),
            // Entities without filed accounts are a normal case here.
            Err(err) if err.status() == Some(404) => Ok(Fetched::Found(Vec::new())),
            Err(err) => Err(err)
        }
    }

    async fn fetch_update_page(
        &self,
        stream: UpdateStream,
        cursor: &PageCursor
    ) -> RegistrySyncResult<UpdatePage> {
        let url = match cursor {
            PageCursor::Next(href) => Url::parse(href).map_err(|e| {
                RegistrySyncError::ValidationError(format!("invalid next link {href}: {e}"))
            })?,
            PageCursor::Start(since) => self.update_start_url(stream, since)?
        };

        let body = match self
            .get_json::<Value>("oppdateringer", stream.as_str(), url)
            .await?
        {
            Fetched::Found(body) => body,
            Fetched::Gone => return Ok(UpdatePage::default())
        };
        if stream != UpdateStream::Roles {
            return Ok(payload::parse_update_page(&body));
        }

        // The role feed has no next link; a full page continues after its last id.
        let feed = payload::parse_role_update_page(&body);
        let next = match feed.last_id {
            Some(last) if feed.item_count >= self.page_size as usize => Some(
                self.url(
                    &self.base_url,
                    Self::update_path(stream),
                    &[("afterId", last.to_string()), ("size", self.page_size.to_string())]
                )?
                .to_string()
            ),
            _ => None
        };
        let events = feed.events;
        Ok(UpdatePage { events, next })
    }

    async fn count_subunits(&self, parent: &OrgNumber) -> RegistrySyncResult<u64> {
        let body = self.subunit_page(parent, 0, 1).await?;
        Ok(body
            .pointer("/page/totalElements")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn list_subunits(
        &self,
        parent: &OrgNumber,
        limit: usize
    ) -> RegistrySyncResult<Vec<SubUnit>> {
        let mut subunits = Vec::new();
        let size = self.page_size.min(limit.max(1) as u32).max(1);
        let mut page = 0u32;

        loop {
            let body = self.subunit_page(parent, page, size).await?;
            let items = body
                .pointer("/_embedded/underenheter")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if items.is_empty() {
                break;
            }

            for item in items {
                let payload: UnderenhetPayload = serde_json::from_value(item)?;
                match payload.into_subunit() {
                    Ok(subunit) => subunits.push(subunit),
                    Err(e) => warn!(parent = %parent, error = %e, "Skipping malformed subunit")
                }
                if subunits.len() >= limit {
                    return Ok(subunits);
                }
            }

            let total_pages = body
                .pointer("/page/totalPages")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            page += 1;
            if u64::from(page) >= total_pages {
                break;
            }
        }

        Ok(subunits)
    }
}

pub fn create_brreg_client(
    config: &RegistrySyncConfig,
    limiter: Arc<RateLimiter>
) -> RegistrySyncResult<Arc<dyn RegistryClient>> {
    Ok(Arc::new(BrregClient::new(config, limiter)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> BrregClient {
        let mut config = RegistrySyncConfig::default();
        config.registry.base_url = server.uri();
        config.registry.financials_base_url = format!("{}/regnskap", server.uri());
        config.retry.initial_backoff_ms = 5;
        config.retry.max_backoff_ms = 20;
        let limiter = Arc::new(RateLimiter::new(1000, 1000));
        BrregClient::new(&config, limiter).unwrap()
    }

    fn orgnr() -> OrgNumber {
        OrgNumber::parse("923609016").unwrap()
    }

    #[tokio::test]
    async fn test_fetch_entity_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/enheter/923609016"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "organisasjonsnummer": "923609016",
                "navn": "EQUINOR ASA",
                "antallAnsatte": 21000
            })))
            .mount(&server)
            .await;

        let company = test_client(&server)
            .fetch_entity(&orgnr())
            .await
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(company.name, "EQUINOR ASA");
        assert_eq!(company.employees, Some(21000));
    }

    #[tokio::test]
    async fn test_gone_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/underenheter/923609016"))
            .respond_with(ResponseTemplate::new(410))
            .expect(1)
            .mount(&server)
            .await;

        let fetched = test_client(&server).fetch_subunit(&orgnr()).await.unwrap();
        assert!(fetched.is_gone());
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_succeed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/enheter/923609016/roller"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/enheter/923609016/roller"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rollegrupper": [{"roller": [{"type": {"kode": "DAGL"}, "fratraadt": false}]}]
            })))
            .mount(&server)
            .await;

        let roles = test_client(&server)
            .fetch_roles(&orgnr())
            .await
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].role_type, "DAGL");
    }

    #[tokio::test]
    async fn test_exhausted_retries_raise_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/enheter/923609016"))
            .respond_with(ResponseTemplate::new(502))
            .expect(4)
            .mount(&server)
            .await;

        let err = test_client(&server).fetch_entity(&orgnr()).await.unwrap_err();
        match err {
            RegistrySyncError::ExternalApiError {
                resource,
                id,
                status,
                ..
            } => {
                assert_eq!(resource, "enhet");
                assert_eq!(id, "923609016");
                assert_eq!(status, Some(502));
            }
            other => panic!("unexpected error: {other:?}")
        }
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/enheter/923609016"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad orgnr"))
            .expect(1)
            .mount(&server)
            .await;

        let err = test_client(&server).fetch_entity(&orgnr()).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(err.to_string().contains("bad orgnr"));
    }

    #[tokio::test]
    async fn test_rate_limited_response_waits_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/enheter/923609016"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/enheter/923609016"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "organisasjonsnummer": "923609016",
                "navn": "EQUINOR ASA"
            })))
            .mount(&server)
            .await;

        let start = std::time::Instant::now();
        let fetched = test_client(&server).fetch_entity(&orgnr()).await.unwrap();
        assert!(!fetched.is_gone());
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_missing_financials_are_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/regnskap/923609016"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let statements = test_client(&server)
            .fetch_financials(&orgnr())
            .await
            .unwrap()
            .found()
            .unwrap();
        assert!(statements.is_empty());
    }

    #[tokio::test]
    async fn test_update_page_starts_after_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oppdateringer/underenheter"))
            .and(query_param("oppdateringsid", "101"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_embedded": {"oppdaterteUnderenheter": [
                    {"oppdateringsid": 101, "organisasjonsnummer": "973152351"}
                ]},
                "_links": {}
            })))
            .mount(&server)
            .await;

        let page = test_client(&server)
            .fetch_update_page(
                UpdateStream::Subunits,
                &PageCursor::Start(UpdateSince::After(100))
            )
            .await
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_role_feed_pages_by_after_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oppdateringer/roller"))
            .and(query_param("afterId", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 101, "time": "2024-03-01T06:00:00.000Z", "data": {"organisasjonsnummer": "923609016"}},
                {"id": 104, "time": "2024-03-01T06:01:00.000Z", "data": {"organisasjonsnummer": "973152351"}}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/oppdateringer/roller"))
            .and(query_param("afterId", "104"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let mut config = RegistrySyncConfig::default();
        config.registry.base_url = server.uri();
        config.registry.page_size = 2;
        let client = BrregClient::new(&config, Arc::new(RateLimiter::new(1000, 1000))).unwrap();

        let first = client
            .fetch_update_page(UpdateStream::Roles, &PageCursor::Start(UpdateSince::After(100)))
            .await
            .unwrap();
        let ids: Vec<i64> = first.events.iter().map(|e| e.update_id).collect();
        assert_eq!(ids, vec![101, 104]);
        let next = first.next.unwrap();
        assert!(next.contains("afterId=104"));

        let second = client
            .fetch_update_page(UpdateStream::Roles, &PageCursor::Next(next))
            .await
            .unwrap();
        assert!(second.events.is_empty());
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_role_feed_starts_after_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oppdateringer/roller"))
            .and(query_param("afterTime", "2024-03-01T00:00:00.000Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 9, "data": {"organisasjonsnummer": "923609016"}}
            ])))
            .mount(&server)
            .await;

        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let page = test_client(&server)
            .fetch_update_page(UpdateStream::Roles, &PageCursor::Start(UpdateSince::Date(date)))
            .await
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].orgnr, orgnr());
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_count_subunits_reads_total_elements() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/underenheter"))
            .and(query_param("overordnetEnhet", "923609016"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "page": {"size": 1, "totalElements": 42, "totalPages": 42, "number": 0}
            })))
            .mount(&server)
            .await;

        let count = test_client(&server).count_subunits(&orgnr()).await.unwrap();
        assert_eq!(count, 42);
    }
}
