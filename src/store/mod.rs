pub mod record;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use self::record::{Payload, PayloadError, Record, ID_FIELD};

/// Point-in-time copy of the store: producer id -> latest payload.
///
/// This is also the exact shape of the persisted snapshot file.
pub type Snapshot = BTreeMap<String, Payload>;

/// Result of an upsert, driving the 201/200 distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

impl UpsertOutcome {
    pub fn is_new(self) -> bool {
        matches!(self, Self::Created)
    }
}

#[derive(Debug)]
struct Entry {
    record: Record,
    last_seen: Instant,
}

/// Live producer records guarded by a single store-wide lock.
///
/// Every operation is one critical section; nothing hands out a reference
/// into the map, so callers only ever see copies.
#[derive(Debug, Default)]
pub struct RecordStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from a persisted snapshot. Restored producers count as
    /// seen at `now`, so they get a full liveness window to check back in.
    pub fn from_snapshot(snapshot: Snapshot, now: Instant) -> Self {
        let entries = snapshot
            .into_iter()
            .filter_map(|(key, payload)| match Record::from_payload(payload) {
                Ok(record) if record.id() == key => Some((
                    key,
                    Entry {
                        record,
                        last_seen: now,
                    },
                )),
                Ok(record) => {
                    tracing::warn!(
                        key = %key,
                        id = record.id(),
                        "skipping snapshot entry with mismatched id"
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping invalid snapshot entry");
                    None
                }
            })
            .collect();

        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Insert or fully replace the record for its producer.
    pub fn upsert(&self, record: Record) -> UpsertOutcome {
        self.upsert_at(record, Instant::now())
    }

    /// Like [`upsert`](Self::upsert) with an explicit last-seen time.
    pub fn upsert_at(&self, record: Record, seen_at: Instant) -> UpsertOutcome {
        let id = record.id().to_owned();
        let previous = self.entries.lock().insert(
            id,
            Entry {
                record,
                last_seen: seen_at,
            },
        );

        match previous {
            None => UpsertOutcome::Created,
            Some(_) => UpsertOutcome::Updated,
        }
    }

    /// Copy out every live record.
    pub fn snapshot_all(&self) -> Snapshot {
        self.entries
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.record.payload().clone()))
            .collect()
    }

    /// Remove every record silent for longer than `stale_after` as of `now`.
    ///
    /// Returns the removed ids, sorted.
    pub fn evict_stale_since(&self, now: Instant, stale_after: Duration) -> Vec<String> {
        let mut removed = Vec::new();

        self.entries.lock().retain(|id, entry| {
            let live = now.saturating_duration_since(entry.last_seen) <= stale_after;
            if !live {
                removed.push(id.clone());
            }
            live
        });

        removed.sort_unstable();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
