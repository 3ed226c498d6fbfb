//! A small in-process metric registry.
//!
//! Components register named metrics and obtain per-attribute-set recorders
//! from them. The registry itself only stores and enumerates; exporting is
//! somebody else's problem.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A sorted set of `(name, value)` attribute pairs identifying one recorder
/// within a metric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Attributes(BTreeMap<&'static str, String>);

impl Attributes {
    /// Insert or replace an attribute.
    pub fn insert(&mut self, name: &'static str, value: impl Into<String>) {
        self.0.insert(name, value.into());
    }

    /// Iterate the attribute pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl<const N: usize> From<&[(&'static str, &str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &str); N]) -> Self {
        let mut attributes = Self::default();
        for (name, value) in pairs {
            attributes.insert(name, *value);
        }
        attributes
    }
}

/// Types that can act as a per-attribute-set recorder of a metric.
pub trait MetricObserver: Debug + Default + Clone + Send + Sync + 'static {}

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {}

/// A gauge that can move in both directions.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Set the gauge to `value`.
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    /// Increment the gauge by `delta`.
    pub fn inc(&self, delta: u64) {
        self.state.fetch_add(delta, Ordering::Relaxed);
    }

    /// Decrement the gauge by `delta`, saturating at zero.
    pub fn dec(&self, delta: u64) {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(delta);
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {}

/// A named metric: a family of recorders keyed by [`Attributes`].
#[derive(Debug)]
pub struct Metric<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    shard: Mutex<BTreeMap<Attributes, T>>,
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            shard: Mutex::new(BTreeMap::new()),
        }
    }

    /// The metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The metric help text.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Return the recorder for `attributes`, creating it on first use.
    /// Recorders are cheap clones sharing one underlying value.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        let attributes = attributes.into();
        let mut shard = self.shard.lock();
        shard.entry(attributes).or_default().clone()
    }

    /// Return the recorder for `attributes` if one was ever created.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        let shard = self.shard.lock();
        shard.get(attributes).cloned()
    }
}

/// The process-wide collection of metrics.
///
/// Metrics are identified by name; registering the same name and type twice
/// returns the existing instance. Registering the same name with a different
/// recorder type panics, as that is a programming error.
#[derive(Debug, Default)]
pub struct Registry {
    metrics: Mutex<BTreeMap<&'static str, Arc<dyn std::any::Any + Send + Sync>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or look up) the metric `name`.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Arc<Metric<T>> {
        let mut metrics = self.metrics.lock();
        let entry = metrics
            .entry(name)
            .or_insert_with(|| Arc::new(Metric::<T>::new(name, description)));
        Arc::clone(entry)
            .downcast::<Metric<T>>()
            .unwrap_or_else(|_| panic!("metric {} registered with conflicting type", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_shared_between_recorders() {
        let registry = Registry::new();
        let metric = registry.register_metric::<U64Counter>("requests", "total requests");

        let a = metric.recorder(&[("worker", "w1")]);
        let b = metric.recorder(&[("worker", "w1")]);
        a.inc(2);
        b.inc(3);
        assert_eq!(a.fetch(), 5);

        let other = metric.recorder(&[("worker", "w2")]);
        assert_eq!(other.fetch(), 0);
    }

    #[test]
    fn registry_reuses_metric_by_name() {
        let registry = Registry::new();
        let first = registry.register_metric::<U64Counter>("hits", "hits");
        let second = registry.register_metric::<U64Counter>("hits", "hits");

        first.recorder(&[("kind", "x")]).inc(1);
        assert_eq!(
            second
                .get_observer(&Attributes::from(&[("kind", "x")]))
                .unwrap()
                .fetch(),
            1
        );
    }

    #[test]
    fn gauge_saturates_at_zero() {
        let registry = Registry::new();
        let metric = registry.register_metric::<U64Gauge>("in_progress", "jobs in progress");
        let gauge = metric.recorder(&[("kind", "replicate")]);

        gauge.inc(2);
        gauge.dec(5);
        assert_eq!(gauge.fetch(), 0);
    }
}
