use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::admission::{forget, persist, restore_all, seconds};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::storage::StateStore;

pub const NAMESPACE: &str = "response_cache";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub normalized_query: String,
    pub category: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub size_hint: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub utilization_pct: f64,
}

/// Content-addressed answers for repeated questions, bounded by count and age.
pub struct ResponseCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

/// Lowercased, trimmed and truncated to `prefix_chars` characters.
pub fn normalize_query(query: &str, prefix_chars: usize) -> String {
    query.trim().to_lowercase().chars().take(prefix_chars).collect()
}

pub fn cache_key(category: &str, normalized_query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_bytes());
    hasher.update(b":");
    hasher.update(normalized_query.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ResponseCache {
    pub async fn restore(config: CacheConfig, clock: Arc<dyn Clock>, store: Arc<dyn StateStore>) -> Self {
        let entries: HashMap<String, CacheEntry> =
            restore_all::<CacheEntry>(store.as_ref(), NAMESPACE).await.into_iter().collect();
        let cache = Self { config, clock, store, entries: Mutex::new(entries) };
        cache.purge_expired().await;
        cache
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.created_at < seconds(self.config.ttl_secs)
    }

    pub async fn lookup(&self, query: &str, category: &str) -> Option<String> {
        let normalized = normalize_query(query, self.config.key_prefix_chars);
        let key = cache_key(category, &normalized);
        let now = self.clock.now();

        let entries = self.entries.lock().await;
        let entry = entries.get(&key)?;
        if !self.is_fresh(entry, now) {
            debug!(event_name = "admission.cache.expired", category, "cached answer expired");
            return None;
        }
        debug!(event_name = "admission.cache.hit", category, "answer served from cache");
        Some(entry.value.clone())
    }

    pub async fn store(&self, query: &str, category: &str, value: &str) {
        let normalized = normalize_query(query, self.config.key_prefix_chars);
        let key = cache_key(category, &normalized);
        let now = self.clock.now();
        let entry = CacheEntry {
            normalized_query: normalized,
            category: category.to_string(),
            value: value.to_string(),
            created_at: now,
            size_hint: value.len(),
        };

        let mut entries = self.entries.lock().await;
        persist(self.store.as_ref(), NAMESPACE, &key, &entry).await;
        entries.insert(key, entry);

        if entries.len() > self.config.max_entries {
            let expired = self.drop_expired(&mut entries, now).await;
            let mut evicted = 0usize;
            while entries.len() > self.config.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.created_at)
                    .map(|(key, _)| key.clone());
                let Some(oldest) = oldest else { break };
                entries.remove(&oldest);
                forget(self.store.as_ref(), NAMESPACE, &oldest).await;
                evicted += 1;
            }
            debug!(
                event_name = "admission.cache.evicted",
                expired,
                evicted,
                size = entries.len(),
                "cache trimmed back to capacity"
            );
        }
    }

    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        self.drop_expired(&mut entries, now).await
    }

    async fn drop_expired(&self, entries: &mut HashMap<String, CacheEntry>, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !self.is_fresh(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
            forget(self.store.as_ref(), NAMESPACE, key).await;
        }
        expired.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let size = self.entries.lock().await.len();
        let max_size = self.config.max_entries;
        let utilization_pct =
            if max_size == 0 { 0.0 } else { size as f64 / max_size as f64 * 100.0 };
        CacheStats { size, max_size, utilization_pct }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use super::{cache_key, normalize_query, ResponseCache, NAMESPACE};
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::storage::{InMemoryStateStore, StateStore};

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).single().expect("timestamp"))
    }

    #[test]
    fn normalization_is_case_and_whitespace_insensitive_and_truncates() {
        assert_eq!(normalize_query("  Qual o PREÇO?  ", 100), "qual o preço?");
        assert_eq!(normalize_query("abcdef", 3), "abc");
        assert_eq!(
            cache_key("curious", &normalize_query("Preço", 100)),
            cache_key("curious", &normalize_query(" preço ", 100))
        );
        assert_ne!(cache_key("curious", "preço"), cache_key("buyer", "preço"));
        assert_eq!(cache_key("curious", "preço").len(), 64);
    }

    #[tokio::test]
    async fn round_trip_until_ttl_elapses() {
        let clock = clock();
        let config = CacheConfig { ttl_secs: 3_600, ..CacheConfig::default() };
        let cache =
            ResponseCache::restore(config, Arc::new(clock.clone()), Arc::new(InMemoryStateStore::new()))
                .await;

        cache.store("Quanto custa o plano?", "curious", "R$ 99/mês").await;
        assert_eq!(
            cache.lookup("  quanto custa o plano?", "curious").await.as_deref(),
            Some("R$ 99/mês")
        );
        assert_eq!(cache.lookup("quanto custa o plano?", "buyer").await, None);

        clock.advance(Duration::seconds(3_599));
        assert!(cache.lookup("quanto custa o plano?", "curious").await.is_some());

        clock.advance(Duration::seconds(1));
        assert_eq!(cache.lookup("quanto custa o plano?", "curious").await, None);
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn capacity_purges_expired_then_evicts_oldest() {
        let clock = clock();
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let config = CacheConfig { max_entries: 3, ttl_secs: 100, ..CacheConfig::default() };
        let cache = ResponseCache::restore(config, Arc::new(clock.clone()), Arc::clone(&store)).await;

        cache.store("stale", "curious", "a").await;
        clock.advance(Duration::seconds(150));
        cache.store("first", "curious", "b").await;
        clock.advance(Duration::seconds(1));
        cache.store("second", "curious", "c").await;
        clock.advance(Duration::seconds(1));
        cache.store("third", "curious", "d").await;

        let stats = cache.stats().await;
        assert_eq!(stats.size, 3);
        assert!(cache.lookup("first", "curious").await.is_some());

        clock.advance(Duration::seconds(1));
        cache.store("fourth", "curious", "e").await;

        assert_eq!(cache.stats().await.size, 3);
        assert_eq!(cache.lookup("first", "curious").await, None);
        assert!(cache.lookup("fourth", "curious").await.is_some());
        assert_eq!(store.load_all(NAMESPACE).await.expect("load_all").len(), 3);
    }

    #[tokio::test]
    async fn entries_survive_restart_through_the_store() {
        let clock = clock();
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let cache =
            ResponseCache::restore(CacheConfig::default(), Arc::new(clock.clone()), Arc::clone(&store))
                .await;
        cache.store("horário de atendimento", "curious", "9h às 18h").await;

        let restarted =
            ResponseCache::restore(CacheConfig::default(), Arc::new(clock.clone()), Arc::clone(&store))
                .await;
        assert_eq!(
            restarted.lookup("Horário de atendimento", "curious").await.as_deref(),
            Some("9h às 18h")
        );
        assert!((restarted.stats().await.utilization_pct - 0.1).abs() < 1e-9);
    }
}
