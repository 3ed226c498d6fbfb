//! Bucketed tracking of a value over time.
//!
//! Two flavors: [`Histogram`] counts every entry ever added;
//! [`RollingHistogram`] additionally keeps the entries themselves in a FIFO
//! bounded by a maximum count and a maximum age, so its counters describe a
//! recent window rather than the whole process lifetime.
//!
//! The JSON snapshot has this shape:
//!
//! ```json
//! {"HistogramId":"RunningTaskTimes",
//!  "avg":0.0021,
//!  "totalCount":2,
//!  "total":0.0043,
//!  "buckets":[{"count":2,"maxVal":0.1},
//!             {"count":0,"maxVal":1.0},
//!             {"count":0,"maxVal":"infinity"}]}
//! ```

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use clock::{Time, TimeProvider};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

/// Bucket counters shared by both histogram flavors.
#[derive(Debug)]
struct Counts {
    /// Ascending, deduplicated upper bounds.
    bucket_max_vals: Vec<f64>,
    /// One count per entry of `bucket_max_vals`.
    bucket_counts: Vec<i64>,
    /// Entries larger than the last bucket bound.
    over_max_count: i64,
    /// Sum of all counted values.
    total: f64,
    /// Number of counted values.
    total_count: i64,
}

impl Counts {
    fn new(bucket_max_vals: &[f64]) -> Self {
        let mut bounds: Vec<f64> = bucket_max_vals.to_vec();
        bounds.sort_by(|a, b| a.partial_cmp(b).expect("NaN bucket bound"));
        bounds.dedup();
        let n = bounds.len();
        Self {
            bucket_max_vals: bounds,
            bucket_counts: vec![0; n],
            over_max_count: 0,
            total: 0.0,
            total_count: 0,
        }
    }

    /// Change the count of the bucket holding `val` by `incr` (+1 or -1).
    fn change_counts_by(&mut self, val: f64, incr: i64) {
        for (bound, count) in self
            .bucket_max_vals
            .iter()
            .zip(self.bucket_counts.iter_mut())
        {
            if val <= *bound {
                *count += incr;
                return;
            }
        }
        self.over_max_count += incr;
    }

    fn add(&mut self, val: f64) {
        self.change_counts_by(val, 1);
        self.total += val;
        self.total_count += 1;
    }

    fn remove(&mut self, val: f64) {
        self.change_counts_by(val, -1);
        self.total -= val;
        self.total_count -= 1;
    }

    fn reset(&mut self) {
        self.bucket_counts.iter_mut().for_each(|c| *c = 0);
        self.over_max_count = 0;
        self.total = 0.0;
        self.total_count = 0;
    }

    fn avg(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.total / self.total_count as f64
        }
    }

    /// The count of bucket `index`; `index == buckets` addresses the
    /// overflow bucket, anything beyond that reads as zero.
    fn bucket_count(&self, index: usize) -> i64 {
        match index.cmp(&self.bucket_counts.len()) {
            std::cmp::Ordering::Less => self.bucket_counts[index],
            std::cmp::Ordering::Equal => self.over_max_count,
            std::cmp::Ordering::Greater => 0,
        }
    }

    /// The upper bound of bucket `index`; infinity for the overflow bucket
    /// and beyond.
    fn bucket_max_val(&self, index: usize) -> f64 {
        self.bucket_max_vals
            .get(index)
            .copied()
            .unwrap_or(f64::INFINITY)
    }

    fn to_json(&self, label: &str) -> Value {
        let mut buckets: Vec<Value> = self
            .bucket_max_vals
            .iter()
            .zip(self.bucket_counts.iter())
            .map(|(max_val, count)| json!({"maxVal": max_val, "count": count}))
            .collect();
        buckets.push(json!({"maxVal": "infinity", "count": self.over_max_count}));
        json!({
            "HistogramId": label,
            "avg": self.avg(),
            "totalCount": self.total_count,
            "total": self.total,
            "buckets": buckets,
        })
    }

    fn to_log_string(&self, label: &str, note: &str) -> String {
        let mut out = format!(
            "{} {} size={} total={} avg={} ",
            label,
            note,
            self.total_count,
            self.total,
            self.avg()
        );
        let mut max_bound = f64::NEG_INFINITY;
        for (bound, count) in self.bucket_max_vals.iter().zip(self.bucket_counts.iter()) {
            write!(out, " <{}={}", bound, count).expect("writing to string");
            max_bound = *bound;
        }
        write!(out, " >{}={}", max_bound, self.over_max_count).expect("writing to string");
        out
    }
}

/// A histogram counting every entry since construction.
#[derive(Debug)]
pub struct Histogram {
    label: String,
    counts: Mutex<Counts>,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds. The bounds are
    /// sorted and deduplicated.
    pub fn new(label: impl Into<String>, bucket_max_vals: &[f64]) -> Self {
        Self {
            label: label.into(),
            counts: Mutex::new(Counts::new(bucket_max_vals)),
        }
    }

    /// The histogram label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Count `val` into its bucket.
    pub fn add_entry(&self, val: f64) {
        self.counts.lock().add(val);
    }

    /// The count of bucket `index` (the bucket past the last bound is the
    /// overflow bucket).
    pub fn bucket_count(&self, index: usize) -> i64 {
        self.counts.lock().bucket_count(index)
    }

    /// The upper bound of bucket `index`.
    pub fn bucket_max_val(&self, index: usize) -> f64 {
        self.counts.lock().bucket_max_val(index)
    }

    /// Average of all counted values.
    pub fn avg(&self) -> f64 {
        self.counts.lock().avg()
    }

    /// Sum of all counted values.
    pub fn total(&self) -> f64 {
        self.counts.lock().total
    }

    /// Number of counted values.
    pub fn total_count(&self) -> i64 {
        self.counts.lock().total_count
    }

    /// A JSON snapshot of the histogram.
    pub fn to_json(&self) -> Value {
        self.counts.lock().to_json(&self.label)
    }

    /// A log-worthy one-line rendition.
    pub fn to_log_string(&self, note: &str) -> String {
        self.counts.lock().to_log_string(&self.label, note)
    }
}

#[derive(Debug)]
struct RollingState {
    counts: Counts,
    entries: VecDeque<(Time, f64)>,
    max_size: usize,
    max_age: Duration,
}

impl RollingState {
    /// Evict entries beyond `max_size` or older than `max_age` relative to
    /// `now`, keeping the counters in step. An emptied window resets the
    /// counters outright, so float drift cannot accumulate.
    fn check_entries(&mut self, now: Time) {
        while self.entries.len() > self.max_size {
            let (_, val) = self.entries.pop_front().expect("non-empty window");
            self.counts.remove(val);
        }
        while let Some((stamp, val)) = self.entries.front().copied() {
            let age = now.checked_duration_since(stamp).unwrap_or_default();
            if age <= self.max_age {
                break;
            }
            self.entries.pop_front();
            self.counts.remove(val);
        }
        if self.entries.is_empty() {
            self.counts.reset();
        }
    }
}

/// A histogram over a rolling window of entries.
///
/// Entries are kept in arrival order; whenever the window exceeds
/// `max_size` entries or the oldest entry exceeds `max_age`, old entries
/// are dropped and their bucket counts reconciled. At all times
/// `sum(buckets) + overflow == total_count == size()`.
#[derive(Debug)]
pub struct RollingHistogram {
    label: String,
    time_provider: Arc<dyn TimeProvider>,
    state: Mutex<RollingState>,
}

impl RollingHistogram {
    /// Create a rolling histogram using the system clock.
    pub fn new(
        label: impl Into<String>,
        bucket_max_vals: &[f64],
        max_age: Duration,
        max_size: usize,
    ) -> Self {
        Self::new_with_time_provider(
            label,
            bucket_max_vals,
            max_age,
            max_size,
            Arc::new(clock::SystemProvider::new()),
        )
    }

    /// Create a rolling histogram reading time from `time_provider`.
    pub fn new_with_time_provider(
        label: impl Into<String>,
        bucket_max_vals: &[f64],
        max_age: Duration,
        max_size: usize,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            label: label.into(),
            time_provider,
            state: Mutex::new(RollingState {
                counts: Counts::new(bucket_max_vals),
                entries: VecDeque::new(),
                max_size,
                max_age,
            }),
        }
    }

    /// The histogram label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Add `val` stamped with the current time.
    pub fn add_entry(&self, val: f64) {
        self.add_entry_at(self.time_provider.now(), val);
    }

    /// Add `val` with an explicit time stamp.
    pub fn add_entry_at(&self, stamp: Time, val: f64) {
        let now = self.time_provider.now();
        let mut state = self.state.lock();
        state.counts.add(val);
        state.entries.push_back((stamp, val));
        state.check_entries(now);
    }

    /// Re-evaluate the window against the current time.
    pub fn check_entries(&self) {
        let now = self.time_provider.now();
        self.state.lock().check_entries(now);
    }

    /// Change the maximum number of entries kept.
    pub fn set_max_size(&self, max_size: usize) {
        let now = self.time_provider.now();
        let mut state = self.state.lock();
        state.max_size = max_size;
        state.check_entries(now);
    }

    /// Change the maximum entry age.
    pub fn set_max_age(&self, max_age: Duration) {
        let now = self.time_provider.now();
        let mut state = self.state.lock();
        state.max_age = max_age;
        state.check_entries(now);
    }

    /// Number of entries currently in the window.
    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// The count of bucket `index` (the bucket past the last bound is the
    /// overflow bucket).
    pub fn bucket_count(&self, index: usize) -> i64 {
        self.state.lock().counts.bucket_count(index)
    }

    /// The upper bound of bucket `index`.
    pub fn bucket_max_val(&self, index: usize) -> f64 {
        self.state.lock().counts.bucket_max_val(index)
    }

    /// Average over the current window.
    pub fn avg(&self) -> f64 {
        self.state.lock().counts.avg()
    }

    /// Sum over the current window.
    pub fn total(&self) -> f64 {
        self.state.lock().counts.total
    }

    /// Number of entries counted in the current window.
    pub fn total_count(&self) -> i64 {
        self.state.lock().counts.total_count
    }

    /// A JSON snapshot of the window.
    pub fn to_json(&self) -> Value {
        self.state.lock().counts.to_json(&self.label)
    }

    /// A log-worthy one-line rendition.
    pub fn to_log_string(&self, note: &str) -> String {
        self.state.lock().counts.to_log_string(&self.label, note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::MockProvider;

    fn assert_consistent(hist: &RollingHistogram) {
        let state = hist.state.lock();
        let bucket_sum: i64 = state.counts.bucket_counts.iter().sum();
        assert_eq!(
            bucket_sum + state.counts.over_max_count,
            state.counts.total_count
        );
        assert_eq!(state.counts.total_count as usize, state.entries.len());
    }

    #[test]
    fn eviction_by_max_size() {
        let max_size = 10;
        let hist = RollingHistogram::new(
            "Test1",
            &[0.01, 0.1, 1.0],
            Duration::from_secs(3600),
            max_size,
        );

        let mut size = 0;
        for j in 0..4 {
            assert_eq!(hist.bucket_count(j), 0);
        }
        hist.add_entry(1.0);
        size += 1;
        assert_eq!(hist.bucket_count(2), 1);
        hist.add_entry(0.2);
        size += 1;
        assert_eq!(hist.bucket_count(2), 2);
        hist.add_entry(0.0);
        size += 1;
        assert_eq!(hist.bucket_count(0), 1);
        assert_eq!(hist.size(), size);
        hist.add_entry(1.1);
        size += 1;
        assert_eq!(hist.bucket_count(3), 1);
        for _ in 0..6 {
            hist.add_entry(0.05);
            size += 1;
        }
        assert_eq!(hist.bucket_count(1), 6);
        assert_eq!(hist.bucket_count(2), 2);
        assert_eq!(hist.size(), size);
        assert_consistent(&hist);

        let jsn = hist.to_json();
        assert_eq!(jsn["HistogramId"], "Test1");
        assert_eq!(jsn["totalCount"], hist.total_count());
        for j in 0..4 {
            assert_eq!(jsn["buckets"][j]["count"], hist.bucket_count(j));
            if j < 3 {
                assert_eq!(jsn["buckets"][j]["maxVal"], hist.bucket_max_val(j));
            } else {
                assert_eq!(jsn["buckets"][j]["maxVal"], "infinity");
            }
        }

        // The window is full; each further entry evicts the oldest one.
        hist.add_entry(0.05);
        assert_eq!(hist.size(), max_size);
        assert_eq!(hist.bucket_count(0), 1);
        assert_eq!(hist.bucket_count(1), 7);
        assert_eq!(hist.bucket_count(2), 1);
        assert_eq!(hist.bucket_count(3), 1);

        hist.add_entry(0.05);
        assert_eq!(hist.size(), max_size);
        assert_eq!(hist.bucket_count(0), 1);
        assert_eq!(hist.bucket_count(1), 8);
        assert_eq!(hist.bucket_count(2), 0);
        assert_eq!(hist.bucket_count(3), 1);
        assert_consistent(&hist);
    }

    #[test]
    fn eviction_by_max_age_resets_when_emptied() {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let hist = RollingHistogram::new_with_time_provider(
            "TestAge",
            &[1.0, 10.0],
            Duration::from_secs(60),
            100,
            Arc::clone(&time_provider) as _,
        );

        hist.add_entry(0.5);
        hist.add_entry(5.0);
        hist.add_entry(50.0);
        assert_eq!(hist.size(), 3);
        assert_eq!(hist.total_count(), 3);

        // Nothing is old enough yet.
        time_provider.inc(Duration::from_secs(30));
        hist.check_entries();
        assert_eq!(hist.size(), 3);

        // Everything ages out; all counters reset to zero.
        time_provider.inc(Duration::from_secs(31));
        hist.check_entries();
        assert_eq!(hist.size(), 0);
        assert_eq!(hist.total_count(), 0);
        assert_eq!(hist.total(), 0.0);
        assert_eq!(hist.avg(), 0.0);
        for j in 0..3 {
            assert_eq!(hist.bucket_count(j), 0);
        }
        assert_consistent(&hist);
    }

    #[test]
    fn plain_histogram_never_evicts() {
        let hist = Histogram::new("Totals", &[1.0, 10.0, 10.0, 0.5]);
        // Bounds were sorted and deduplicated: [0.5, 1, 10].
        assert_eq!(hist.bucket_max_val(0), 0.5);
        assert_eq!(hist.bucket_max_val(2), 10.0);
        assert_eq!(hist.bucket_max_val(3), f64::INFINITY);

        for val in [0.1, 0.7, 5.0, 20.0] {
            hist.add_entry(val);
        }
        assert_eq!(hist.bucket_count(0), 1);
        assert_eq!(hist.bucket_count(1), 1);
        assert_eq!(hist.bucket_count(2), 1);
        assert_eq!(hist.bucket_count(3), 1);
        assert_eq!(hist.total_count(), 4);
        assert!((hist.avg() - 6.45).abs() < 1e-9);
    }

    #[test]
    fn shrinking_max_size_evicts_immediately() {
        let hist = RollingHistogram::new("Shrink", &[1.0], Duration::from_secs(3600), 10);
        for _ in 0..8 {
            hist.add_entry(0.5);
        }
        hist.set_max_size(3);
        assert_eq!(hist.size(), 3);
        assert_eq!(hist.bucket_count(0), 3);
        assert_consistent(&hist);
    }
}
