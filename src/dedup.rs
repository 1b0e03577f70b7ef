// =============================================================================
// dedup.rs - ONE INSERT PER KEY PER RUN
// =============================================================================
//
// The deduplicator is a pre-filter in front of the sink. Correctness comes from
// the store's upsert; the job here is to avoid wasted writes and to make sure
// no natural key is enqueued twice during one ingest session.
//
// Three layers, cheapest first:
//
// 1. Session reservations. A Bloom filter answers "definitely never reserved"
//    in O(k); only a "maybe" costs a lookup in the exact set behind it. The
//    exact set is what makes the at-most-once guarantee hold: Bloom filters
//    have false positives, and a false positive must never drop a record.
//
// 2. An LRU of keys the store is known to already hold, so that re-crawling
//    overlapping date ranges doesn't ask the store the same question twice.
//
// 3. One batched existence check per page (`rol=in.(...)`), never one round
//    trip per record. If the check fails we let the records through and let
//    the upsert sort it out.
//
// Reservation happens last and atomically, so two workers racing on the same
// key can't both win.
// =============================================================================

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use bloomfilter::Bloom;
use lru::LruCache;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ConfigError;
use crate::metrics::MetricsCollector;
use crate::models::{NaturalKey, SentenceRecord};
use crate::sink::RecordStore;

struct Reservations {
    bloom: Bloom<NaturalKey>,
    exact: HashSet<NaturalKey>,
}

pub struct DedupStats {
    pub checked: AtomicU64,
    pub reserved: AtomicU64,
    pub already_reserved: AtomicU64,
    pub known_remote: AtomicU64,
    pub remote_lookups: AtomicU64,
    pub bloom_maybe_hits: AtomicU64,
}

impl DedupStats {
    fn new() -> Self {
        Self {
            checked: AtomicU64::new(0),
            reserved: AtomicU64::new(0),
            already_reserved: AtomicU64::new(0),
            known_remote: AtomicU64::new(0),
            remote_lookups: AtomicU64::new(0),
            bloom_maybe_hits: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DedupSnapshot {
    pub checked: u64,
    pub reserved: u64,
    pub already_reserved: u64,
    pub known_remote: u64,
    pub remote_lookups: u64,
    pub bloom_maybe_hits: u64,
    pub remote_cache_size: usize,
}

pub struct Deduplicator {
    store: Arc<dyn RecordStore>,
    reservations: Mutex<Reservations>,
    remote_known: Mutex<LruCache<NaturalKey, ()>>,
    stats: DedupStats,
    metrics: Arc<MetricsCollector>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn RecordStore>, config: &Config, metrics: Arc<MetricsCollector>) -> Result<Self, ConfigError> {
        let bloom = Bloom::new_for_fp_rate(config.bloom_expected_items.max(1) as usize, config.bloom_false_positive_rate)
            .map_err(|_| ConfigError::Invalid {
                key: "JURIS_BLOOM_FP_RATE",
                value: config.bloom_false_positive_rate.to_string(),
            })?;
        let cache_size = NonZeroUsize::new(config.dedup_cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            store,
            reservations: Mutex::new(Reservations {
                bloom,
                exact: HashSet::new(),
            }),
            remote_known: Mutex::new(LruCache::new(cache_size)),
            stats: DedupStats::new(),
            metrics,
        })
    }

    /// Keep only records whose key was neither reserved earlier in this run
    /// nor already present in the store, and reserve the survivors.
    pub async fn filter_new(&self, records: Vec<SentenceRecord>) -> Vec<SentenceRecord> {
        let incoming = records.len();
        self.stats.checked.fetch_add(incoming as u64, Ordering::Relaxed);

        // Local pass: duplicates inside the page, earlier reservations,
        // keys the store is already known to have.
        let mut seen_in_page = HashSet::new();
        let mut candidates: Vec<SentenceRecord> = Vec::with_capacity(records.len());
        for record in records {
            if !seen_in_page.insert(record.key.clone()) || self.is_reserved(&record.key) {
                self.stats.already_reserved.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if self.remote_known.lock().get(&record.key).is_some() {
                self.stats.known_remote.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            candidates.push(record);
        }

        // Remote pass, one request per tribunal present in the page.
        let mut existing: HashSet<NaturalKey> = HashSet::new();
        let tribunals: HashSet<_> = candidates.iter().map(|r| r.key.tribunal).collect();
        for tribunal in tribunals {
            let keys: Vec<NaturalKey> = candidates
                .iter()
                .filter(|r| r.key.tribunal == tribunal)
                .map(|r| r.key.clone())
                .collect();
            self.stats.remote_lookups.fetch_add(1, Ordering::Relaxed);
            match self.store.existing_keys(tribunal, &keys).await {
                Ok(found) => existing.extend(found),
                Err(e) => warn!(
                    tribunal = %tribunal,
                    keys = keys.len(),
                    error = %e,
                    "Existence check failed, letting records through to the upsert"
                ),
            }
        }

        if !existing.is_empty() {
            let mut cache = self.remote_known.lock();
            for key in &existing {
                cache.put(key.clone(), ());
            }
            self.stats.known_remote.fetch_add(existing.len() as u64, Ordering::Relaxed);
        }

        let fresh: Vec<SentenceRecord> = candidates
            .into_iter()
            .filter(|r| !existing.contains(&r.key))
            .filter(|r| {
                let won = self.reserve(&r.key);
                if !won {
                    self.stats.already_reserved.fetch_add(1, Ordering::Relaxed);
                }
                won
            })
            .collect();

        let dropped = incoming - fresh.len();
        if dropped > 0 {
            self.metrics.add_duplicates_filtered(dropped);
            debug!(incoming, kept = fresh.len(), dropped, "Duplicates filtered");
        }
        fresh
    }

    fn is_reserved(&self, key: &NaturalKey) -> bool {
        let reservations = self.reservations.lock();
        if !reservations.bloom.check(key) {
            return false;
        }
        self.stats.bloom_maybe_hits.fetch_add(1, Ordering::Relaxed);
        reservations.exact.contains(key)
    }

    /// Atomically claim a key. False if someone already holds it.
    fn reserve(&self, key: &NaturalKey) -> bool {
        let mut reservations = self.reservations.lock();
        if !reservations.exact.insert(key.clone()) {
            return false;
        }
        reservations.bloom.set(key);
        self.stats.reserved.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn snapshot(&self) -> DedupSnapshot {
        DedupSnapshot {
            checked: self.stats.checked.load(Ordering::Relaxed),
            reserved: self.stats.reserved.load(Ordering::Relaxed),
            already_reserved: self.stats.already_reserved.load(Ordering::Relaxed),
            known_remote: self.stats.known_remote.load(Ordering::Relaxed),
            remote_lookups: self.stats.remote_lookups.load(Ordering::Relaxed),
            bloom_maybe_hits: self.stats.bloom_maybe_hits.load(Ordering::Relaxed),
            remote_cache_size: self.remote_known.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tribunal;
    use crate::sink::testing::{record, MemoryStore};

    fn dedup(store: Arc<MemoryStore>) -> (Deduplicator, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        let config = Config {
            bloom_expected_items: 1_000,
            dedup_cache_size: 16,
            ..Config::default()
        };
        (Deduplicator::new(store, &config, metrics.clone()).unwrap(), metrics)
    }

    fn dockets(records: &[SentenceRecord]) -> Vec<&str> {
        records.iter().map(|r| r.docket.as_str()).collect()
    }

    #[tokio::test]
    async fn test_new_records_pass_and_are_reserved() {
        let (dedup, _) = dedup(Arc::new(MemoryStore::default()));
        let page = vec![record(Tribunal::CorteSuprema, "1-2020"), record(Tribunal::CorteSuprema, "2-2020")];

        assert_eq!(dockets(&dedup.filter_new(page.clone()).await), vec!["1-2020", "2-2020"]);
        assert!(dedup.filter_new(page).await.is_empty());
        assert_eq!(dedup.snapshot().reserved, 2);
    }

    #[tokio::test]
    async fn test_duplicates_inside_a_page_are_collapsed() {
        let (dedup, metrics) = dedup(Arc::new(MemoryStore::default()));
        let page = vec![
            record(Tribunal::Familia, "7-2021"),
            record(Tribunal::Familia, "7-2021"),
            record(Tribunal::Familia, "8-2021"),
        ];
        assert_eq!(dockets(&dedup.filter_new(page).await), vec!["7-2021", "8-2021"]);
        assert_eq!(metrics.snapshot().duplicates_filtered, 1);
    }

    #[tokio::test]
    async fn test_existing_remote_keys_use_one_lookup_and_are_cached() {
        let store = Arc::new(MemoryStore::default());
        store.insert_existing(record(Tribunal::Civiles, "1-2019"));
        let (dedup, _) = dedup(store.clone());

        let page = vec![
            record(Tribunal::Civiles, "1-2019"),
            record(Tribunal::Civiles, "2-2019"),
            record(Tribunal::Civiles, "3-2019"),
        ];
        assert_eq!(dockets(&dedup.filter_new(page).await), vec!["2-2019", "3-2019"]);
        assert_eq!(store.lookup_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Second sighting is answered by the cache, no new lookup needed for it.
        let again = dedup.filter_new(vec![record(Tribunal::Civiles, "1-2019")]).await;
        assert!(again.is_empty());
        assert_eq!(store.lookup_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_rol_different_tribunal_is_distinct() {
        let (dedup, _) = dedup(Arc::new(MemoryStore::default()));
        let kept = dedup
            .filter_new(vec![record(Tribunal::Laborales, "5-2020"), record(Tribunal::Cobranza, "5-2020")])
            .await;
        assert_eq!(kept.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_workers_reserve_once() {
        let (dedup, _) = dedup(Arc::new(MemoryStore::default()));
        let dedup = Arc::new(dedup);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let dedup = dedup.clone();
            handles.push(tokio::spawn(async move {
                dedup.filter_new(vec![record(Tribunal::Penales, "99-2023")]).await.len()
            }));
        }
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 1);
    }
}
