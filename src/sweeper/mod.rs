use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::durability::Durability;
use crate::export::HealthMetrics;
use crate::store::RecordStore;

/// Background task evicting producers that outlived the liveness window.
pub struct ExpirySweeper {
    store: Arc<RecordStore>,
    durability: Arc<Durability>,
    health: Arc<HealthMetrics>,
    ttl: Duration,
    interval: Duration,
    /// Set while the on-disk snapshot lags an eviction.
    flush_pending: Arc<AtomicBool>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for ExpirySweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirySweeper")
            .field("ttl", &self.ttl)
            .field("interval", &self.interval)
            .finish()
    }
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<RecordStore>,
        durability: Arc<Durability>,
        health: Arc<HealthMetrics>,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            durability,
            health,
            ttl,
            interval,
            flush_pending: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Run one eviction pass as of `now`, flushing if anything was removed
    /// or an earlier flush failed.
    ///
    /// Returns the evicted producer ids.
    pub async fn sweep_once(&self, now: Instant) -> Vec<String> {
        sweep(
            &self.store,
            &self.durability,
            &self.health,
            &self.flush_pending,
            self.ttl,
            now,
        )
        .await
    }

    /// Start the background sweep loop. Idempotent while running; may be
    /// called again after [`stop`](Self::stop).
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // Already running.
        }

        let store = Arc::clone(&self.store);
        let durability = Arc::clone(&self.durability);
        let health = Arc::clone(&self.health);
        let flush_pending = Arc::clone(&self.flush_pending);
        let ttl = self.ttl;
        let interval = self.interval;
        let cancel = {
            let mut slot = self.cancel.lock();
            if slot.is_cancelled() {
                *slot = CancellationToken::new();
            }
            slot.clone()
        };

        info!(?ttl, ?interval, "expiry sweeper started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; nothing can be stale yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("expiry sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        sweep(
                            &store,
                            &durability,
                            &health,
                            &flush_pending,
                            ttl,
                            Instant::now(),
                        )
                        .await;
                    }
                }
            }
        });
    }

    /// Stop the background loop.
    pub fn stop(&self) {
        self.cancel.lock().cancel();
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn sweep(
    store: &Arc<RecordStore>,
    durability: &Arc<Durability>,
    health: &HealthMetrics,
    flush_pending: &AtomicBool,
    ttl: Duration,
    now: Instant,
) -> Vec<String> {
    let removed = store.evict_stale_since(now, ttl);

    if !removed.is_empty() {
        info!(ids = ?removed, "evicted stale producers");
        health.records_evicted.inc_by(removed.len() as f64);
        health.live_records.set(store.len() as f64);
    } else if !flush_pending.load(Ordering::SeqCst) {
        return removed;
    }

    match durability.flush_store_blocking(store).await {
        Ok(records) => {
            flush_pending.store(false, Ordering::SeqCst);
            health.record_flush("sweep", true);
            debug!(records, "snapshot flushed after eviction");
        }
        Err(e) => {
            flush_pending.store(true, Ordering::SeqCst);
            health.record_flush("sweep", false);
            error!(error = %e, "flush after eviction failed, retrying next tick");
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::store::Record;

    fn sweeper(dir: &TempDir, ttl: Duration, interval: Duration) -> ExpirySweeper {
        ExpirySweeper::new(
            Arc::new(RecordStore::new()),
            Arc::new(Durability::new(dir.path().join("weather_data.json"), false)),
            Arc::new(HealthMetrics::new(":0").expect("metrics")),
            ttl,
            interval,
        )
    }

    fn record(id: &str) -> Record {
        Record::from_json(format!(r#"{{"id":"{id}"}}"#).as_bytes()).expect("record")
    }

    #[tokio::test]
    async fn test_sweep_once_evicts_and_flushes() {
        let dir = TempDir::new().expect("tempdir");
        let sweeper = sweeper(&dir, Duration::from_secs(30), Duration::from_secs(5));
        let start = Instant::now();

        sweeper.store.upsert_at(record("old"), start);
        sweeper.store.upsert_at(record("new"), start + Duration::from_secs(20));
        sweeper.durability.flush_store(&sweeper.store).expect("initial flush");

        let removed = sweeper.sweep_once(start + Duration::from_secs(35)).await;
        assert_eq!(removed, vec!["old".to_string()]);

        let on_disk = sweeper.durability.restore().snapshot;
        assert!(on_disk.contains_key("new"));
        assert!(!on_disk.contains_key("old"));
    }

    #[tokio::test]
    async fn test_sweep_once_without_evictions_skips_flush() {
        let dir = TempDir::new().expect("tempdir");
        let sweeper = sweeper(&dir, Duration::from_secs(30), Duration::from_secs(5));
        sweeper.store.upsert(record("S1"));

        assert!(sweeper.sweep_once(Instant::now()).await.is_empty());
        assert!(!sweeper.durability.path().exists());
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried_next_tick() {
        let dir = TempDir::new().expect("tempdir");
        let sweeper = sweeper(&dir, Duration::from_secs(30), Duration::from_secs(5));
        let start = Instant::now();

        sweeper.store.upsert_at(record("old"), start);
        sweeper.durability.flush_store(&sweeper.store).expect("initial flush");

        // A directory squatting on the temp path makes the flush fail.
        let tmp = sweeper.durability.tmp_path().to_path_buf();
        std::fs::create_dir(&tmp).expect("block temp path");

        let removed = sweeper.sweep_once(start + Duration::from_secs(35)).await;
        assert_eq!(removed, vec!["old".to_string()]);
        let on_disk: serde_json::Value = serde_json::from_slice(
            &std::fs::read(sweeper.durability.path()).expect("snapshot"),
        )
        .expect("json");
        assert!(on_disk.get("old").is_some());

        std::fs::remove_dir(&tmp).expect("unblock temp path");

        let removed = sweeper.sweep_once(start + Duration::from_secs(40)).await;
        assert!(removed.is_empty());
        assert!(sweeper.durability.restore().snapshot.is_empty());

        let sweep_flushes = |result: &str| {
            sweeper
                .health
                .flushes_total
                .with_label_values(&["sweep", result])
                .get()
        };
        assert_eq!(sweep_flushes("error"), 1.0);
        assert_eq!(sweep_flushes("ok"), 1.0);

        // Nothing pending any more: a quiet tick leaves the file alone.
        std::fs::remove_file(sweeper.durability.path()).expect("remove snapshot");
        assert!(sweeper.sweep_once(start + Duration::from_secs(45)).await.is_empty());
        assert!(!sweeper.durability.path().exists());
    }

    #[tokio::test]
    async fn test_restart_after_stop_resumes_sweeping() {
        let dir = TempDir::new().expect("tempdir");
        let sweeper = sweeper(&dir, Duration::from_millis(50), Duration::from_millis(20));

        sweeper.start();
        sweeper.stop();
        sweeper.start();

        sweeper.store.upsert(record("S1"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sweeper.store.is_empty());

        sweeper.stop();
    }

    #[tokio::test]
    async fn test_background_loop_evicts_and_stops() {
        let dir = TempDir::new().expect("tempdir");
        let sweeper = sweeper(&dir, Duration::from_millis(50), Duration::from_millis(20));
        sweeper.store.upsert(record("S1"));

        sweeper.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sweeper.store.is_empty());
        assert!(sweeper.durability.restore().snapshot.is_empty());

        sweeper.stop();
        sweeper.store.upsert(record("S2"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sweeper.store.len(), 1);
    }
}
