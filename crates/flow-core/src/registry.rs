//! A metrics registrar that can unregister everything it registered.
//!
//! Components are torn down and reconstructed during config reloads. If a
//! removed component left its collectors behind, re-adding an identical
//! component would fail on duplicate metric descriptors. The controller
//! therefore hands every component an [`Unregisterer`] and calls
//! [`Unregisterer::unregister_all`] when the component's node is removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::Registry;

/// Aggregated failure from [`Unregisterer::unregister_all`].
#[derive(Debug, thiserror::Error)]
#[error("failed to unregister {} collector(s): {}", failed.len(), failed.join("; "))]
pub struct UnregisterError {
    /// Descriptions of the collectors that could not be unregistered.
    pub failed: Vec<String>,
}

/// Clonable handle to a registered collector.
///
/// `prometheus::Registry` consumes a `Box<dyn Collector>` on both register
/// and unregister, so the wrapper keeps an `Arc` of each collector to be
/// able to hand the registry an equivalent box later.
#[derive(Clone)]
struct SharedCollector(Arc<dyn Collector + Send + Sync>);

impl Collector for SharedCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.0.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0.collect()
    }
}

/// A registrar wrapping a [`prometheus::Registry`] that remembers every
/// checked collector registered through it.
///
/// Unchecked collectors (those advertising zero descriptors) are passed
/// through to the underlying registry but not remembered; they remain the
/// underlying registry's concern.
#[derive(Clone)]
pub struct Unregisterer {
    wrap: Registry,
    // Keyed by the sorted descriptor id set, which identifies a collector
    // to the underlying registry.
    tracked: Arc<Mutex<HashMap<Vec<u64>, SharedCollector>>>,
}

impl Unregisterer {
    /// Wrap a registry with unregister-all capability.
    #[must_use]
    pub fn wrap(registry: Registry) -> Self {
        Self { wrap: registry, tracked: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Register a collector, remembering it unless it is unchecked.
    ///
    /// # Errors
    ///
    /// Propagates the underlying registry's error (duplicate descriptors,
    /// inconsistent help strings, ...).
    pub fn register<C>(&self, collector: C) -> Result<(), prometheus::Error>
    where
        C: Collector + Send + Sync + 'static,
    {
        let shared = SharedCollector(Arc::new(collector));
        let ids = desc_ids(&shared);
        self.wrap.register(Box::new(shared.clone()))?;
        if ids.is_empty() {
            // Unchecked collector: tracked only by the underlying registry.
            return Ok(());
        }
        self.tracked.lock().unwrap().insert(ids, shared);
        Ok(())
    }

    /// Register collectors, panicking on failure.
    ///
    /// # Panics
    ///
    /// Panics if any registration fails. Use [`Unregisterer::register`] in
    /// code that can propagate errors.
    pub fn must_register<C>(&self, collectors: impl IntoIterator<Item = C>)
    where
        C: Collector + Send + Sync + 'static,
    {
        for collector in collectors {
            if let Err(err) = self.register(collector) {
                panic!("failed to register collector: {err}");
            }
        }
    }

    /// Unregister a collector.
    ///
    /// Returns true iff the underlying registry removed it; on success the
    /// collector is forgotten. The underlying `prometheus` registry is
    /// strict, so a second unregister of the same collector returns false.
    pub fn unregister<C>(&self, collector: &C) -> bool
    where
        C: Collector + Clone + Send + Sync + 'static,
    {
        let ids = desc_ids(collector);
        if self.wrap.unregister(Box::new(collector.clone())).is_ok() {
            self.tracked.lock().unwrap().remove(&ids);
            return true;
        }
        false
    }

    /// Unregister every remembered collector.
    ///
    /// Collectors that fail to unregister stay remembered and are reported
    /// together in the returned error. After a successful call the
    /// remembered set is empty.
    ///
    /// # Errors
    ///
    /// Returns [`UnregisterError`] listing every collector that the
    /// underlying registry refused to remove.
    pub fn unregister_all(&self) -> Result<(), UnregisterError> {
        let snapshot: Vec<(Vec<u64>, SharedCollector)> = self
            .tracked
            .lock()
            .unwrap()
            .iter()
            .map(|(ids, c)| (ids.clone(), c.clone()))
            .collect();

        let mut failed = Vec::new();
        for (ids, collector) in snapshot {
            if self.wrap.unregister(Box::new(collector.clone())).is_ok() {
                self.tracked.lock().unwrap().remove(&ids);
            } else {
                failed.push(describe_collector(&collector));
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(UnregisterError { failed })
        }
    }

    /// Number of remembered collectors.
    #[must_use]
    pub fn tracked_len(&self) -> usize {
        self.tracked.lock().unwrap().len()
    }
}

impl std::fmt::Debug for Unregisterer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unregisterer")
            .field("tracked", &self.tracked_len())
            .finish()
    }
}

fn desc_ids(collector: &dyn Collector) -> Vec<u64> {
    let mut ids: Vec<u64> = collector.desc().iter().map(|d| d.id).collect();
    ids.sort_unstable();
    ids
}

fn describe_collector(collector: &dyn Collector) -> String {
    let names: Vec<&str> = collector
        .desc()
        .iter()
        .map(|d| d.fq_name.as_str())
        .collect();
    names.join(",")
}

#[cfg(test)]
mod tests {
    use prometheus::IntCounter;

    use super::*;

    fn counter(name: &str) -> IntCounter {
        IntCounter::new(name.to_string(), format!("{name} help")).unwrap()
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = Registry::new();
        let wrapper = Unregisterer::wrap(registry.clone());

        let c = counter("test_register_total");
        wrapper.register(c.clone()).unwrap();
        assert_eq!(wrapper.tracked_len(), 1);

        assert!(wrapper.unregister(&c));
        assert_eq!(wrapper.tracked_len(), 0);
    }

    #[test]
    fn test_unregister_twice_is_false_on_strict_registry() {
        let wrapper = Unregisterer::wrap(Registry::new());
        let c = counter("test_twice_total");
        wrapper.register(c.clone()).unwrap();

        assert!(wrapper.unregister(&c));
        assert!(!wrapper.unregister(&c));
    }

    #[test]
    fn test_unregister_all_empties_the_set() {
        let registry = Registry::new();
        let wrapper = Unregisterer::wrap(registry.clone());

        wrapper.register(counter("a_total")).unwrap();
        wrapper.register(counter("b_total")).unwrap();
        assert_eq!(wrapper.tracked_len(), 2);

        wrapper.unregister_all().unwrap();
        assert_eq!(wrapper.tracked_len(), 0);

        // Identical metric names register cleanly again afterwards.
        wrapper.register(counter("a_total")).unwrap();
        wrapper.register(counter("b_total")).unwrap();
        wrapper.unregister_all().unwrap();
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let wrapper = Unregisterer::wrap(Registry::new());
        wrapper.register(counter("dup_total")).unwrap();
        assert!(wrapper.register(counter("dup_total")).is_err());
        assert_eq!(wrapper.tracked_len(), 1);
    }
}
