use crate::config::RegistrySyncConfig;
use crate::error::{RegistrySyncError, RegistrySyncResult};
use crate::models::PopulationRecord;
use crate::store::Store;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait PopulationSource: Send + Sync {
    async fn fetch_population(&self) -> RegistrySyncResult<Vec<PopulationRecord>>;
}

/// Statistics Norway table 07459, latest year, per municipality.
pub struct SsbPopulationClient {
    client: Client,
    table_url: String
}

impl SsbPopulationClient {
    pub fn new(config: &RegistrySyncConfig) -> RegistrySyncResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(RegistrySyncError::HttpError)?;
        Ok(Self {
            client,
            table_url: config.population.table_url.clone()
        })
    }

    fn query() -> Value {
        json!({
            "query": [
                {
                    "code": "Region",
                    "selection": { "filter": "all", "values": ["*"] }
                },
                {
                    "code": "ContentsCode",
                    "selection": { "filter": "item", "values": ["Personer1"] }
                },
                {
                    "code": "Tid",
                    "selection": { "filter": "top", "values": ["1"] }
                }
            ],
            "response": { "format": "json-stat2" }
        })
    }
}

#[async_trait]
impl PopulationSource for SsbPopulationClient {
    async fn fetch_population(&self) -> RegistrySyncResult<Vec<PopulationRecord>> {
        let response = self
            .client
            .post(&self.table_url)
            .json(&Self::query())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistrySyncError::external(
                "population",
                "07459",
                Some(status.as_u16()),
                body
            ));
        }
        let body: Value = response.json().await?;
        parse_json_stat(&body)
    }
}

/// Flattens a json-stat2 dataset with `Region` and `Tid` dimensions into
/// per-municipality records. Non-municipality regions (country, counties)
/// and missing values are skipped.
pub fn parse_json_stat(body: &Value) -> RegistrySyncResult<Vec<PopulationRecord>> {
    let invalid = |what: &str| RegistrySyncError::InvalidPayload(format!("json-stat2: {what}"));

    let ids: Vec<&str> = body
        .get("id")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing id"))?
        .iter()
        .filter_map(Value::as_str)
        .collect();
    let sizes: Vec<usize> = body
        .get("size")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing size"))?
        .iter()
        .filter_map(Value::as_u64)
        .map(|s| s as usize)
        .collect();
    if ids.len() != sizes.len() {
        return Err(invalid("id and size differ in length"));
    }
    let values = body
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing value"))?;

    let labels = |dimension: &str| -> RegistrySyncResult<Vec<String>> {
        let index = body
            .pointer(&format!("/dimension/{dimension}/category/index"))
            .and_then(Value::as_object)
            .ok_or_else(|| invalid(&format!("missing {dimension} index")))?;
        let mut ordered: Vec<(u64, String)> = index
            .iter()
            .filter_map(|(code, pos)| pos.as_u64().map(|p| (p, code.clone())))
            .collect();
        ordered.sort();
        Ok(ordered.into_iter().map(|(_, code)| code).collect())
    };

    let region_axis = ids
        .iter()
        .position(|id| *id == "Region")
        .ok_or_else(|| invalid("no Region dimension"))?;
    let time_axis = ids
        .iter()
        .position(|id| *id == "Tid")
        .ok_or_else(|| invalid("no Tid dimension"))?;
    let regions = labels("Region")?;
    let years = labels("Tid")?;

    // Row-major strides: the last dimension varies fastest.
    let mut strides = vec![1usize; sizes.len()];
    for axis in (0..sizes.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * sizes[axis + 1];
    }

    let mut records = Vec::new();
    for (flat, value) in values.iter().enumerate() {
        let Some(population) = value.as_i64() else {
            continue;
        };
        let region_pos = (flat / strides[region_axis]) % sizes[region_axis];
        let time_pos = (flat / strides[time_axis]) % sizes[time_axis];
        let (Some(region), Some(year)) = (regions.get(region_pos), years.get(time_pos)) else {
            continue;
        };
        if region.len() != 4 || !region.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Ok(year) = year.parse::<i32>() else {
            continue;
        };
        records.push(PopulationRecord {
            municipality_number: region.clone(),
            year,
            population
        });
    }
    Ok(records)
}

pub async fn sync_population(
    store: &Arc<dyn Store>,
    source: &dyn PopulationSource
) -> RegistrySyncResult<u64> {
    let records = source.fetch_population().await?;
    let stored = store.upsert_population(&records).await?;
    info!(municipalities = records.len(), stored, "Population statistics synced");
    Ok(stored)
}
