//! Bucket Deduplication Ledger
//!
//! Upstream reports usage in fixed-width buckets and the exporter re-fetches
//! overlapping windows every cycle, so the same bucket is observed many times,
//! sometimes while it is still accumulating. The ledger remembers, per
//! [`BucketKey`], how much of that bucket has already been published so a
//! repeated observation yields only the increase, never the whole value again.
//!
//! ## Transitions
//!
//! | Bucket  | Recorded as | Result                                          |
//! |---------|-------------|-------------------------------------------------|
//! | closed  | -           | publish full value, record closed               |
//! | closed  | closed      | nothing                                         |
//! | closed  | open        | publish the remaining delta, record closed      |
//! | open    | -           | skip (closed-only mode) or publish full value   |
//! | open    | open        | publish the delta since the last observation    |
//!
//! A value lower than the recorded one is an upstream revision: the delta is
//! floored to zero and the high-water mark is kept, so published counters
//! never decrease and never exceed the largest value upstream reported.
//!
//! ## Growth
//!
//! Entries are evicted by [`Ledger::prune`] once their bucket is older than the
//! configured retention. Retention is validated to exceed the fetch lookback,
//! so a pruned key cannot come back in a later window.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::models::{BucketSpan, Measure, ResourceType, UsageRecord};

/// Identity of one accounting series within one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub operation: ResourceType,
    pub bucket_start: i64,
    pub project_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub model: String,
    pub batch: String,
    pub measure: Measure,
}

impl BucketKey {
    pub fn new(record: &UsageRecord, measure: Measure) -> Self {
        Self {
            operation: record.operation,
            bucket_start: record.bucket.start,
            project_id: record.project_id.clone(),
            user_id: record.user_id.clone(),
            api_key_id: record.api_key_id.clone(),
            model: record.model.clone(),
            batch: record.batch.clone(),
            measure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LedgerEntry {
    value: f64,
    bucket_end: i64,
    closed: bool,
}

/// What the caller should do with one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Add this amount to the published counter.
    Publish(f64),
    /// Already fully published, nothing to add.
    Unchanged,
    /// Still-open bucket ignored in closed-only mode.
    Deferred,
    /// Upstream reported less than was already published.
    Regressed { previous: f64, observed: f64 },
}

impl Observation {
    pub fn increment(&self) -> f64 {
        match self {
            Observation::Publish(delta) => *delta,
            _ => 0.0,
        }
    }
}

/// Outcome of observing all sub-measures of one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordDelta {
    /// Non-zero increments, in measure order.
    pub increments: Vec<(Measure, f64)>,
    /// Sub-measures whose value went backwards.
    pub regressions: usize,
}

/// Ledger of published bucket values, shared by every collection task.
pub struct Ledger {
    entries: Mutex<HashMap<BucketKey, LedgerEntry>>,
    track_open_buckets: bool,
}

impl Ledger {
    /// `track_open_buckets` selects delta accounting for buckets that have
    /// not closed yet; when false they are ignored until they close.
    pub fn new(track_open_buckets: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            track_open_buckets,
        }
    }

    /// Record an observation of `key` within `bucket` and return the amount
    /// to publish. `now` decides whether the bucket is open.
    pub fn observe(&self, key: &BucketKey, bucket: BucketSpan, value: f64, now: i64) -> Observation {
        let closed = bucket.is_closed(now);
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get_mut(key) else {
            if !closed && !self.track_open_buckets {
                return Observation::Deferred;
            }
            entries.insert(
                key.clone(),
                LedgerEntry {
                    value,
                    bucket_end: bucket.end,
                    closed,
                },
            );
            return Observation::Publish(value);
        };

        if entry.closed {
            return Observation::Unchanged;
        }

        entry.closed = closed;
        if value < entry.value {
            return Observation::Regressed {
                previous: entry.value,
                observed: value,
            };
        }

        let delta = value - entry.value;
        entry.value = value;
        if delta > 0.0 {
            Observation::Publish(delta)
        } else {
            Observation::Unchanged
        }
    }

    /// Observe every sub-measure of a record.
    pub fn observe_record(&self, record: &UsageRecord, now: i64) -> RecordDelta {
        let mut delta = RecordDelta::default();

        for (measure, value) in &record.measures {
            let key = BucketKey::new(record, *measure);
            match self.observe(&key, record.bucket, *value, now) {
                Observation::Publish(amount) if amount > 0.0 => {
                    delta.increments.push((*measure, amount))
                }
                Observation::Regressed { previous, observed } => {
                    delta.regressions += 1;
                    warn!(
                        operation = %record.operation,
                        bucket_start = record.bucket.start,
                        project_id = %record.project_id,
                        model = %record.model,
                        token_type = measure.as_str(),
                        previous,
                        observed,
                        "Upstream value decreased for an already published bucket, ignoring"
                    );
                }
                Observation::Deferred => {
                    debug!(
                        operation = %record.operation,
                        bucket_end = record.bucket.end,
                        "Deferring open bucket until it closes"
                    );
                }
                _ => {}
            }
        }

        delta
    }

    /// Evict entries whose bucket ended at or before `cutoff`. Returns how
    /// many were removed.
    pub fn prune(&self, cutoff: i64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.bucket_end > cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Last recorded value for `key`.
    pub fn recorded(&self, key: &BucketKey) -> Option<f64> {
        self.entries.lock().get(key).map(|e| e.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(start: i64, end: i64, input: f64) -> UsageRecord {
        UsageRecord {
            operation: ResourceType::Completions,
            bucket: BucketSpan { start, end },
            model: "gpt-4".to_string(),
            project_id: "p1".to_string(),
            user_id: "u1".to_string(),
            api_key_id: "k1".to_string(),
            batch: "false".to_string(),
            measures: vec![(Measure::Input, input)],
        }
    }

    fn key(start: i64) -> BucketKey {
        BucketKey::new(&record(start, start + 60, 0.0), Measure::Input)
    }

    fn span(start: i64, end: i64) -> BucketSpan {
        BucketSpan { start, end }
    }

    #[test]
    fn test_closed_bucket_published_once() {
        let ledger = Ledger::new(true);
        let k = key(1000);

        assert_eq!(ledger.observe(&k, span(1000, 1060), 500.0, 2000), Observation::Publish(500.0));
        assert_eq!(ledger.observe(&k, span(1000, 1060), 500.0, 2060), Observation::Unchanged);
        assert_eq!(ledger.observe(&k, span(1000, 1060), 700.0, 2120), Observation::Unchanged);
        assert_eq!(ledger.recorded(&k), Some(500.0));
    }

    #[test]
    fn test_open_bucket_delta_accounting() {
        let ledger = Ledger::new(true);
        let k = key(1000);

        assert_eq!(ledger.observe(&k, span(1000, 1200), 100.0, 1100), Observation::Publish(100.0));
        assert_eq!(ledger.observe(&k, span(1000, 1200), 130.0, 1160), Observation::Publish(30.0));
        assert_eq!(ledger.recorded(&k), Some(130.0));
    }

    #[test]
    fn test_open_bucket_regression_floored() {
        let ledger = Ledger::new(true);
        let k = key(1000);

        ledger.observe(&k, span(1000, 1200), 100.0, 1100);
        let obs = ledger.observe(&k, span(1000, 1200), 80.0, 1150);
        assert_eq!(
            obs,
            Observation::Regressed {
                previous: 100.0,
                observed: 80.0
            }
        );
        assert_eq!(obs.increment(), 0.0);

        // High-water mark is kept, so recovering to 110 only adds 10.
        assert_eq!(ledger.observe(&k, span(1000, 1200), 110.0, 1160), Observation::Publish(10.0));
    }

    #[test]
    fn test_open_then_closed_publishes_remainder_once() {
        let ledger = Ledger::new(true);
        let k = key(1000);

        ledger.observe(&k, span(1000, 1060), 40.0, 1030);
        assert_eq!(ledger.observe(&k, span(1000, 1060), 55.0, 1100), Observation::Publish(15.0));
        assert_eq!(ledger.observe(&k, span(1000, 1060), 55.0, 1160), Observation::Unchanged);
    }

    #[test]
    fn test_closed_only_mode_defers_open_buckets() {
        let ledger = Ledger::new(false);
        let k = key(1000);

        assert_eq!(ledger.observe(&k, span(1000, 1060), 40.0, 1030), Observation::Deferred);
        assert!(ledger.is_empty());
        assert_eq!(ledger.observe(&k, span(1000, 1060), 55.0, 1060), Observation::Publish(55.0));
    }

    #[test]
    fn test_measures_are_independent_series() {
        let ledger = Ledger::new(true);
        let mut r = record(1000, 1060, 500.0);
        r.measures.push((Measure::Output, 20.0));

        let first = ledger.observe_record(&r, 2000);
        assert_eq!(
            first.increments,
            vec![(Measure::Input, 500.0), (Measure::Output, 20.0)]
        );
        assert!(ledger.observe_record(&r, 2000).increments.is_empty());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_unknown_dimensions_are_distinct_keys() {
        let ledger = Ledger::new(true);
        let a = record(1000, 1060, 10.0);
        let mut b = a.clone();
        b.user_id = "unknown".to_string();

        assert_eq!(ledger.observe_record(&a, 2000).increments.len(), 1);
        assert_eq!(ledger.observe_record(&b, 2000).increments.len(), 1);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_record_regressions_counted() {
        let ledger = Ledger::new(true);
        ledger.observe_record(&record(1000, 1200, 100.0), 1100);

        let delta = ledger.observe_record(&record(1000, 1200, 90.0), 1150);
        assert!(delta.increments.is_empty());
        assert_eq!(delta.regressions, 1);
    }

    #[test]
    fn test_prune_drops_old_buckets() {
        let ledger = Ledger::new(true);
        ledger.observe(&key(1000), span(1000, 1060), 1.0, 5000);
        ledger.observe(&key(4000), span(4000, 4060), 1.0, 5000);

        assert_eq!(ledger.prune(3000), 1);
        assert_eq!(ledger.recorded(&key(1000)), None);
        assert_eq!(ledger.recorded(&key(4000)), Some(1.0));
    }
}
