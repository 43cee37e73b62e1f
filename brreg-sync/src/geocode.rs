use crate::config::{GeocodingConfig, RegistrySyncConfig};
use crate::error::{RegistrySyncError, RegistrySyncResult};
use crate::models::{Address, Coordinates};
use crate::store::Store;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` means the address was searched but not found.
    async fn geocode(&self, address: &Address) -> RegistrySyncResult<Option<Coordinates>>;
}

/// Kartverket address search (`/adresser/v1/sok`).
pub struct KartverketGeocoder {
    client: Client,
    base_url: String
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    adresser: Vec<SearchHit>
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    representasjonspunkt: Option<Point>
}

#[derive(Debug, Deserialize)]
struct Point {
    lat: f64,
    lon: f64
}

impl KartverketGeocoder {
    pub fn new(config: &RegistrySyncConfig) -> RegistrySyncResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(RegistrySyncError::HttpError)?;
        Ok(Self {
            client,
            base_url: config.geocoding.base_url.trim_end_matches('/').to_string()
        })
    }
}

#[async_trait]
impl Geocoder for KartverketGeocoder {
    async fn geocode(&self, address: &Address) -> RegistrySyncResult<Option<Coordinates>> {
        let Some(text) = address.search_text() else {
            return Ok(None);
        };
        let mut params = vec![("sok", text), ("treffPerSide", "1".to_string())];
        if let Some(postal_code) = &address.postal_code {
            params.push(("postnummer", postal_code.clone()));
        }
        let url = Url::parse_with_params(&format!("{}/sok", self.base_url), &params)
            .map_err(|e| RegistrySyncError::ConfigError(format!("invalid geocoding url: {e}")))?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistrySyncError::external(
                "geocode",
                address.postal_code.as_deref().unwrap_or_default(),
                Some(status.as_u16()),
                status.to_string()
            ));
        }

        let body: SearchResponse = response.json().await?;
        Ok(body
            .adresser
            .into_iter()
            .find_map(|hit| hit.representasjonspunkt)
            .map(|p| Coordinates { lat: p.lat, lon: p.lon }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocodeReport {
    pub attempted: u64,
    pub located: u64,
    pub not_found: u64,
    pub failed: u64
}

/// Geocodes one bounded batch of companies without coordinates. Every
/// attempt is counted so hopeless addresses stop being retried.
pub async fn geocode_pending(
    store: &Arc<dyn Store>,
    geocoder: &dyn Geocoder,
    batch_size: usize,
    config: &GeocodingConfig
) -> RegistrySyncResult<GeocodeReport> {
    let mut report = GeocodeReport::default();
    let candidates = store
        .pending_geocodes(batch_size, config.max_attempts)
        .await?;

    for candidate in candidates {
        report.attempted += 1;
        match geocoder.geocode(&candidate.address).await {
            Ok(Some(coordinates)) => {
                store.save_geocode(&candidate.orgnr, Some(coordinates)).await?;
                report.located += 1;
            }
            Ok(None) => {
                debug!(orgnr = %candidate.orgnr, "Address not found");
                store.save_geocode(&candidate.orgnr, None).await?;
                report.not_found += 1;
            }
            Err(e) => {
                warn!(orgnr = %candidate.orgnr, error = %e, "Geocoding failed");
                store.save_geocode(&candidate.orgnr, None).await?;
                report.failed += 1;
            }
        }
    }

    info!(
        attempted = report.attempted,
        located = report.located,
        not_found = report.not_found,
        failed = report.failed,
        "Geocoding batch finished"
    );
    Ok(report)
}
