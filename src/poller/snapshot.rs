//! Last-known download snapshot and the diff engine
//!
//! The snapshot keeps, per `(source, hash)`, the latest observed record, the
//! version last handed to the broadcaster, and how many consecutive ticks the
//! record has been missing. Changes are always measured against the broadcast
//! version, so slow drifts below the threshold still surface once they add up.

use crate::types::{DownloadRecord, DownloadStatus, RecordKey, TimeLeft};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone)]
struct Entry {
    current: DownloadRecord,
    last_sent: DownloadRecord,
    missing_ticks: u32,
}

/// Merged view of every instance's downloads
#[derive(Debug, Clone)]
pub struct Snapshot {
    entries: BTreeMap<RecordKey, Entry>,
    progress_threshold: f64,
    grace_ticks: u32,
}

impl Snapshot {
    /// Empty snapshot
    ///
    /// `progress_threshold` is in percentage points; `grace_ticks` is how many
    /// consecutive absent ticks a record survives before it is removed.
    pub fn new(progress_threshold: f64, grace_ticks: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            progress_threshold,
            grace_ticks,
        }
    }

    /// Number of records held, including ones inside their grace period
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Latest observed records, ordered by key
    pub fn records(&self) -> Vec<DownloadRecord> {
        self.entries.values().map(|e| e.current.clone()).collect()
    }

    /// Fold one tick's results into the snapshot and return the records to emit
    ///
    /// `fresh` holds every record fetched this tick. Records whose source is in
    /// `carried_sources` (instances that failed or were not polled) are kept
    /// as-is and do not advance their missing counter.
    pub fn apply(
        &mut self,
        fresh: Vec<DownloadRecord>,
        carried_sources: &HashSet<String>,
    ) -> Vec<DownloadRecord> {
        let threshold = self.progress_threshold;
        let mut seen = HashSet::with_capacity(fresh.len());
        let mut emitted: BTreeMap<RecordKey, DownloadRecord> = BTreeMap::new();

        for record in fresh {
            let key = record.key();
            seen.insert(key.clone());

            match self.entries.get_mut(&key) {
                Some(entry) => {
                    entry.missing_ticks = 0;
                    entry.current = record;
                    if is_significant(&entry.last_sent, &entry.current, threshold) {
                        entry.last_sent = entry.current.clone();
                        emitted.insert(key, entry.current.clone());
                    }
                }
                None => {
                    emitted.insert(key.clone(), record.clone());
                    self.entries.insert(
                        key,
                        Entry {
                            current: record.clone(),
                            last_sent: record,
                            missing_ticks: 0,
                        },
                    );
                }
            }
        }

        let mut expired = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if seen.contains(key) || carried_sources.contains(&key.source) {
                continue;
            }
            entry.missing_ticks += 1;
            if entry.missing_ticks > self.grace_ticks {
                expired.push(key.clone());
            }
        }

        for key in expired {
            let Some(entry) = self.entries.remove(&key) else {
                continue;
            };
            if entry.current.status == DownloadStatus::Downloading {
                tracing::debug!(id = %key, "Download vanished while active, reporting completion");
                emitted.insert(key, finished(entry.current));
            } else {
                tracing::debug!(id = %key, status = %entry.current.status, "Download vanished");
            }
        }

        emitted.into_values().collect()
    }
}

fn is_significant(previous: &DownloadRecord, next: &DownloadRecord, threshold: f64) -> bool {
    if previous.status != next.status {
        return true;
    }
    // Both sides are already rounded to two decimals; round the delta too
    // so 41.2 - 40.2 does not land a hair under 1.0.
    let delta = ((next.progress - previous.progress).abs() * 100.0).round() / 100.0;
    delta >= threshold
}

fn finished(mut record: DownloadRecord) -> DownloadRecord {
    record.status = DownloadStatus::Completed;
    record.progress = 100.0;
    record.time_left = TimeLeft::from_secs(0);
    record.last_updated = Utc::now();
    record
}
