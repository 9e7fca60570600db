//! Fingerprint-keyed LRU cache fronting rule evaluation.

use std::num::NonZeroUsize;
use std::sync::RwLock;

use lru::LruCache;
use prometheus::{IntCounter, IntGauge};

use super::{process, CompiledRule};
use crate::registry::Unregisterer;
use crate::series::{is_stale_nan, Labels, Sample};

/// Cache construction errors.
#[derive(Debug, thiserror::Error)]
pub enum RelabelCacheError {
    /// Capacity must be positive.
    #[error("cache capacity must be greater than 0, got {0}")]
    ZeroCapacity(usize),

    /// A cache metric failed to register.
    #[error("failed to register cache metric: {0}")]
    Metrics(#[from] prometheus::Error),
}

struct CacheMetrics {
    hits: IntCounter,
    misses: IntCounter,
    deletes: IntCounter,
    size: IntGauge,
}

impl CacheMetrics {
    fn new(registerer: &Unregisterer) -> Result<Self, prometheus::Error> {
        let hits = IntCounter::new(
            "flow_relabel_cache_hits_total",
            "Total number of relabel cache hits",
        )?;
        let misses = IntCounter::new(
            "flow_relabel_cache_misses_total",
            "Total number of relabel cache misses",
        )?;
        let deletes = IntCounter::new(
            "flow_relabel_cache_deletes_total",
            "Total number of relabel cache deletes",
        )?;
        let size = IntGauge::new(
            "flow_relabel_cache_size",
            "Number of entries in the relabel cache",
        )?;
        for metric in [&hits, &misses, &deletes] {
            registerer.register(metric.clone())?;
        }
        registerer.register(size.clone())?;
        Ok(Self { hits, misses, deletes, size })
    }
}

/// LRU cache from series fingerprint to post-relabel series.
///
/// A cached `None` is the drop sentinel: the rules rejected the series and
/// subsequent samples short-circuit without re-running them. The cache lock
/// is distinct from the rules lock so the forwarding fast-path is never
/// blocked behind a reconfiguration that is rebuilding rules.
pub struct RelabelCache {
    rules: RwLock<Vec<CompiledRule>>,
    cache: RwLock<LruCache<u64, Option<Labels>>>,
    metrics: CacheMetrics,
}

impl RelabelCache {
    /// Create a cache over a compiled rule set.
    ///
    /// # Errors
    ///
    /// Returns [`RelabelCacheError::ZeroCapacity`] for a zero capacity and
    /// propagates metric registration failures.
    pub fn new(
        rules: Vec<CompiledRule>,
        capacity: usize,
        registerer: &Unregisterer,
    ) -> Result<Self, RelabelCacheError> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or(RelabelCacheError::ZeroCapacity(capacity))?;
        Ok(Self {
            rules: RwLock::new(rules),
            cache: RwLock::new(LruCache::new(capacity)),
            metrics: CacheMetrics::new(registerer)?,
        })
    }

    /// Relabel one sample through the cache.
    ///
    /// Returns the post-relabel labels, or `None` when the rules drop the
    /// series. Stale-marker samples evict the entry after use so the next
    /// live sample re-evaluates the rules.
    pub fn relabel(&self, sample: &Sample) -> Option<Labels> {
        let rules = self.rules.read().unwrap();
        let fingerprint = sample.labels.fingerprint();

        let cached = self.cache.write().unwrap().get(&fingerprint).cloned();
        let result = if let Some(entry) = cached {
            self.metrics.hits.inc();
            entry
        } else {
            self.metrics.misses.inc();
            // Relabel a copy so the caller's labels stay untouched.
            let relabeled = process(sample.labels.clone(), &rules);
            self.cache
                .write()
                .unwrap()
                .put(fingerprint, relabeled.clone());
            relabeled
        };

        if is_stale_nan(sample.value) {
            self.delete(fingerprint);
        }
        self.metrics
            .size
            .set(i64::try_from(self.len()).unwrap_or(i64::MAX));
        result
    }

    /// Swap in new rules and reset the cache to a new capacity.
    ///
    /// The cache is cleared, never merged: entries computed under the old
    /// rules are unusable.
    ///
    /// # Errors
    ///
    /// Returns [`RelabelCacheError::ZeroCapacity`] for a zero capacity.
    pub fn update(
        &self,
        rules: Vec<CompiledRule>,
        capacity: usize,
    ) -> Result<(), RelabelCacheError> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or(RelabelCacheError::ZeroCapacity(capacity))?;
        let mut rules_guard = self.rules.write().unwrap();
        *self.cache.write().unwrap() = LruCache::new(capacity);
        *rules_guard = rules;
        Ok(())
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total cache hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.metrics.hits.get()
    }

    /// Total cache misses (rule evaluations).
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.metrics.misses.get()
    }

    fn delete(&self, fingerprint: u64) {
        self.metrics.deletes.inc();
        self.cache.write().unwrap().pop(&fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use prometheus::Registry;

    use super::*;
    use crate::relabel::{compile, Action, Rule};
    use crate::series::stale_nan;

    fn registerer() -> Unregisterer {
        Unregisterer::wrap(Registry::new())
    }

    fn drop_dev_rules() -> Vec<CompiledRule> {
        compile(&[Rule {
            source_labels: vec!["env".into()],
            regex: "dev".into(),
            action: Action::Drop,
            ..Rule::default()
        }])
        .unwrap()
    }

    fn dev_series() -> Labels {
        Labels::from_pairs([("__name__", "up"), ("env", "dev")])
    }

    #[test]
    fn test_drop_is_cached() {
        let cache = RelabelCache::new(drop_dev_rules(), 16, &registerer()).unwrap();

        for i in 0..1000 {
            let sample = Sample::new(dev_series(), f64::from(i), i64::from(i));
            assert_eq!(cache.relabel(&sample), None);
        }
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 999);
    }

    #[test]
    fn test_cache_matches_direct_application() {
        let rules = compile(&[Rule {
            source_labels: vec!["env".into()],
            regex: "(.+)".into(),
            target_label: "environment".into(),
            replacement: "$1".into(),
            ..Rule::default()
        }])
        .unwrap();
        let cache = RelabelCache::new(rules.clone(), 16, &registerer()).unwrap();

        let series = [
            Labels::from_pairs([("__name__", "up"), ("env", "dev")]),
            Labels::from_pairs([("__name__", "up"), ("env", "prod")]),
            Labels::from_pairs([("__name__", "up"), ("env", "dev")]),
        ];
        for (i, labels) in series.iter().enumerate() {
            let sample = Sample::new(labels.clone(), 1.0, i as i64);
            let direct = process(labels.clone(), &rules);
            assert_eq!(cache.relabel(&sample), direct);
        }
        assert_eq!(cache.misses(), 2);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_stale_marker_evicts_entry() {
        let cache = RelabelCache::new(drop_dev_rules(), 16, &registerer()).unwrap();

        cache.relabel(&Sample::new(dev_series(), 1.0, 1));
        assert_eq!(cache.len(), 1);

        cache.relabel(&Sample::new(dev_series(), stale_nan(), 2));
        assert_eq!(cache.len(), 0);

        // Next live sample re-evaluates the rules.
        cache.relabel(&Sample::new(dev_series(), 2.0, 3));
        assert_eq!(cache.misses(), 2);
    }

    #[test]
    fn test_update_clears_cache() {
        let cache = RelabelCache::new(drop_dev_rules(), 16, &registerer()).unwrap();
        cache.relabel(&Sample::new(dev_series(), 1.0, 1));
        assert_eq!(cache.len(), 1);

        // After an update the old verdict no longer applies.
        cache.update(Vec::new(), 16).unwrap();
        assert_eq!(cache.len(), 0);
        let kept = cache.relabel(&Sample::new(dev_series(), 1.0, 2));
        assert_eq!(kept, Some(dev_series()));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            RelabelCache::new(Vec::new(), 0, &registerer()),
            Err(RelabelCacheError::ZeroCapacity(0))
        ));
    }
}
