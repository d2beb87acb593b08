//! Dedup cache
//!
//! In-memory set of dedup keys known to be durably stored, seeded from the
//! store at startup so keys written by earlier runs are recognized. Owned by
//! the insert stage and never shared, so it has no locking.

use anyhow::Result;
use sirivm_common::DedupKey;
use std::collections::HashSet;
use tracing::info;

use crate::db::RecordStore;

#[derive(Debug, Default, Clone)]
pub struct DedupCache {
    keys: HashSet<DedupKey>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache with every key already in `store`
    pub async fn load(store: &dyn RecordStore) -> Result<Self> {
        let cache: Self = store.dedup_keys().await?.into_iter().collect();
        info!(keys = cache.len(), "Seeded dedup cache from store");
        Ok(cache)
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.keys.contains(key)
    }

    /// Mark `key` as stored. Call only after the write is confirmed.
    pub fn record(&mut self, key: DedupKey) {
        self.keys.insert(key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<DedupKey> for DedupCache {
    fn from_iter<I: IntoIterator<Item = DedupKey>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::{RecordStore, SqliteStore};
    use chrono::{TimeZone, Utc};
    use sirivm_common::{SourceKey, VehicleLocation};

    fn key(vehicle: &str) -> DedupKey {
        DedupKey::new(Some("FBRI"), vehicle, Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 5).unwrap())
    }

    #[test]
    fn test_contains_after_record() {
        let mut cache = DedupCache::new();
        assert!(cache.is_empty());
        assert!(!cache.contains(&key("36921")));

        cache.record(key("36921"));
        cache.record(key("36921"));

        assert!(cache.contains(&key("36921")));
        assert!(!cache.contains(&key("37004")));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let recorded_at = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 5).unwrap();
        store
            .insert(&VehicleLocation {
                source: SourceKey::new("sirivm/a.zip"),
                dedup_key: key("36921"),
                vehicle_ref: "36921".to_string(),
                recorded_at,
                valid_until: None,
                latitude: 51.45,
                longitude: -2.58,
                bearing: None,
                item_identifier: None,
                line_ref: None,
                published_line_name: None,
                direction_ref: None,
                operator_ref: Some("FBRI".to_string()),
                origin_ref: None,
                origin_name: None,
                destination_ref: None,
                destination_name: None,
                origin_aimed_departure: None,
                block_ref: None,
                journey_ref: None,
            })
            .await
            .unwrap();

        let cache = DedupCache::load(&store).await.unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key("36921")));
    }
}
