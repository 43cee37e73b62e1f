use crate::cache::AsyncCache;
use crate::config::CacheConfig;
use crate::error::RegistrySyncResult;
use crate::models::{CountyStat, IndustryStat};
use crate::store::Store;
use std::sync::Arc;
use tracing::debug;

/// Aggregate reads over the materialized views, cached in memory.
pub struct AnalyticsService {
    store: Arc<dyn Store>,
    industries: AsyncCache<Vec<IndustryStat>>,
    counties: AsyncCache<Vec<CountyStat>>
}

impl AnalyticsService {
    pub fn new(store: Arc<dyn Store>, config: &CacheConfig) -> Self {
        Self {
            store,
            industries: AsyncCache::from_config(config),
            counties: AsyncCache::from_config(config)
        }
    }

    pub async fn industry_stats(&self, limit: usize) -> RegistrySyncResult<Vec<IndustryStat>> {
        self.industries
            .get_or_compute("industry_stats", &limit, || self.store.industry_stats(limit))
            .await
    }

    pub async fn county_stats(&self) -> RegistrySyncResult<Vec<CountyStat>> {
        self.counties
            .get_or_compute("county_stats", &(), || self.store.county_stats())
            .await
    }

    /// Drops cached aggregates, e.g. after the views were refreshed.
    pub async fn invalidate(&self) {
        self.industries.clear().await;
        self.counties.clear().await;
        debug!("Analytics cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Address, Company, OrgNumber};
    use crate::store::{EntityStore, MemoryStore};

    fn company(orgnr: &str, industry: &str, employees: i32, municipality: &str) -> Company {
        Company {
            orgnr: OrgNumber::parse(orgnr).unwrap(),
            name: format!("Company {orgnr}"),
            org_form: Some("AS".to_string()),
            industry_codes: vec![industry.to_string()],
            address: Some(Address {
                municipality_number: Some(municipality.to_string()),
                ..Default::default()
            }),
            employees: Some(employees),
            founded: None,
            registered: None,
            bankrupt: false,
            bankruptcy_date: None,
            purpose: None
        }
    }

    #[tokio::test]
    async fn test_stats_are_cached_until_invalidated() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_companies(&[company("923609016", "62.010", 10, "0301")])
            .await
            .unwrap();
        let analytics = AnalyticsService::new(store.clone(), &CacheConfig::default());

        let first = analytics.industry_stats(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].employee_count, 10);

        store
            .upsert_companies(&[company("987654321", "62.010", 5, "0301")])
            .await
            .unwrap();
        assert_eq!(analytics.industry_stats(10).await.unwrap(), first);

        analytics.invalidate().await;
        let refreshed = analytics.industry_stats(10).await.unwrap();
        assert_eq!(refreshed[0].company_count, 2);
        assert_eq!(refreshed[0].employee_count, 15);

        let counties = analytics.county_stats().await.unwrap();
        assert_eq!(counties.len(), 1);
        assert_eq!(counties[0].county_number, "03");
    }
}
