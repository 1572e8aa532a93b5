//! Worker-partitioned metric aggregation.
//!
//! Each serving worker thread owns one partition. Writes lock only that
//! partition's mutex, which nothing else touches except a snapshot copying it
//! out. The partition map itself is only read-locked while partition handles
//! are cloned.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use predictor_core::{MetricError, MetricRecord, MetricType};

use super::histogram::Histogram;

/// Identity of the worker that owns a partition.
pub type WorkerId = u64;

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);
static GAUGE_SEQ: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static WORKER_ID: WorkerId = NEXT_WORKER.fetch_add(1, Ordering::Relaxed);
}

/// The calling thread's worker identity.
#[must_use]
pub fn current_worker() -> WorkerId {
    WORKER_ID.with(|id| *id)
}

pub const FEEDBACK_COUNT: &str = "feedback_count";
pub const FEEDBACK_REWARD_SUM: &str = "feedback_reward_sum";

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// `(type, key, sorted tags)`. `BTreeMap` keeps the tags sorted, which makes
/// the map itself the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EntryKey {
    metric_type: MetricType,
    key: String,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
enum EntryValue {
    Counter(f64),
    /// Sequence number orders writes across partitions so merge keeps the
    /// latest.
    Gauge { value: f64, seq: u64 },
    Timer(Histogram),
}

#[derive(Debug, Default)]
struct Partition {
    entries: HashMap<EntryKey, EntryValue>,
}

impl Partition {
    fn apply(&mut self, record: &MetricRecord, method: &str) {
        let mut tags = record.tags.clone();
        tags.insert("method".to_string(), method.to_string());
        let key = EntryKey {
            metric_type: record.metric_type,
            key: record.key.clone(),
            tags,
        };
        match record.metric_type {
            MetricType::COUNTER => {
                let entry = self.entries.entry(key).or_insert(EntryValue::Counter(0.0));
                if let EntryValue::Counter(total) = entry {
                    *total += record.value;
                }
            }
            MetricType::GAUGE => {
                let seq = GAUGE_SEQ.fetch_add(1, Ordering::Relaxed);
                self.entries.insert(
                    key,
                    EntryValue::Gauge {
                        value: record.value,
                        seq,
                    },
                );
            }
            MetricType::TIMER => {
                let entry = self
                    .entries
                    .entry(key)
                    .or_insert_with(|| EntryValue::Timer(Histogram::default()));
                if let EntryValue::Timer(h) = entry {
                    h.observe(record.value / 1000.0);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Merged value of one metric entry.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Timer(Histogram),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub metric_type: MetricType,
    pub key: String,
    pub tags: BTreeMap<String, String>,
    pub value: MetricValue,
}

/// Read-only merged view across all partitions, sorted by type, key and tags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl MetricsSnapshot {
    /// Looks up one entry by its full identity.
    #[must_use]
    pub fn get(
        &self,
        metric_type: MetricType,
        key: &str,
        tags: &[(&str, &str)],
    ) -> Option<&MetricValue> {
        let tags: BTreeMap<String, String> = tags
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.entries
            .iter()
            .find(|e| e.metric_type == metric_type && e.key == key && e.tags == tags)
            .map(|e| &e.value)
    }

    /// All entries with the given type and key, whatever their tags.
    pub fn find<'a>(
        &'a self,
        metric_type: MetricType,
        key: &'a str,
    ) -> impl Iterator<Item = &'a SnapshotEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.metric_type == metric_type && e.key == key)
    }
}

// ---------------------------------------------------------------------------
// MetricsAggregator
// ---------------------------------------------------------------------------

/// Process-wide metric store shared by the dispatcher and the exposition
/// endpoint.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    partitions: DashMap<WorkerId, Arc<Mutex<Partition>>>,
}

impl MetricsAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a batch into the calling worker's partition.
    ///
    /// # Errors
    ///
    /// Returns the first invalid record's error. Nothing is recorded in that
    /// case.
    pub fn record(&self, records: &[MetricRecord], method: &str) -> Result<(), MetricError> {
        self.record_as(current_worker(), records, method)
    }

    /// Records a batch into an explicit worker's partition.
    ///
    /// # Errors
    ///
    /// Returns the first invalid record's error. Nothing is recorded in that
    /// case.
    pub fn record_as(
        &self,
        worker: WorkerId,
        records: &[MetricRecord],
        method: &str,
    ) -> Result<(), MetricError> {
        for (index, record) in records.iter().enumerate() {
            record.validate(index)?;
        }
        if records.is_empty() {
            return Ok(());
        }
        let partition = self.partition(worker);
        let mut partition = partition.lock();
        for record in records {
            partition.apply(record, method);
        }
        Ok(())
    }

    /// Bumps `feedback_count` and `feedback_reward_sum` for a non-zero reward.
    pub fn record_feedback(&self, reward: f64, method: &str) {
        if reward == 0.0 || !reward.is_finite() {
            return;
        }
        let records = [
            MetricRecord::counter(FEEDBACK_COUNT, 1.0),
            MetricRecord::counter(FEEDBACK_REWARD_SUM, reward),
        ];
        if let Err(err) = self.record(&records, method) {
            tracing::warn!(error = %err, "failed to record feedback counters");
        }
    }

    fn partition(&self, worker: WorkerId) -> Arc<Mutex<Partition>> {
        if let Some(p) = self.partitions.get(&worker) {
            return Arc::clone(p.value());
        }
        Arc::clone(self.partitions.entry(worker).or_default().value())
    }

    /// Merges every partition into one view.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let handles: Vec<Arc<Mutex<Partition>>> = self
            .partitions
            .iter()
            .map(|p| Arc::clone(p.value()))
            .collect();

        let mut merged: BTreeMap<EntryKey, EntryValue> = BTreeMap::new();
        for handle in handles {
            let partition = handle.lock().entries.clone();
            for (key, value) in partition {
                match merged.get_mut(&key) {
                    None => {
                        merged.insert(key, value);
                    }
                    Some(existing) => merge_value(existing, &value),
                }
            }
        }

        let entries = merged
            .into_iter()
            .map(|(key, value)| SnapshotEntry {
                metric_type: key.metric_type,
                key: key.key,
                tags: key.tags,
                value: match value {
                    EntryValue::Counter(v) => MetricValue::Counter(v),
                    EntryValue::Gauge { value, .. } => MetricValue::Gauge(value),
                    EntryValue::Timer(h) => MetricValue::Timer(h),
                },
            })
            .collect();
        MetricsSnapshot { entries }
    }

    /// Clears one worker's partition.
    pub fn reset(&self, worker: WorkerId) {
        if let Some(p) = self.partitions.get(&worker) {
            p.lock().entries.clear();
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.partitions.len()
    }
}

fn merge_value(existing: &mut EntryValue, incoming: &EntryValue) {
    match (existing, incoming) {
        (EntryValue::Counter(a), EntryValue::Counter(b)) => *a += b,
        (
            EntryValue::Gauge { value, seq },
            EntryValue::Gauge {
                value: new_value,
                seq: new_seq,
            },
        ) => {
            if new_seq > seq {
                *value = *new_value;
                *seq = *new_seq;
            }
        }
        (EntryValue::Timer(a), EntryValue::Timer(b)) => a.merge(b),
        // The entry key includes the type, so kinds never mix.
        _ => {}
    }
}
