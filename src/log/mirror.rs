//! Remote Mirror (spec.md §4.6.1): best-effort mirroring of the log to an
//! external content-addressed store. Fire-and-forget from the correlator's
//! perspective — it runs on its own task and never blocks local acceptance.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

use crate::model::AlertRecord;

/// The actual transport (content-addressed VCS, object store, or other) is
/// a configuration choice, not a design constraint of the core (spec.md §9).
#[async_trait]
pub trait RemoteMirror: Send + Sync {
    async fn push(&self, record: &AlertRecord) -> Result<(), String>;

    /// Records the mirror has that the local log may not (startup
    /// reconciliation, spec.md §4.6.1). Default: no reconciliation support.
    async fn list_ids(&self) -> Result<Vec<String>, String> {
        Ok(Vec::new())
    }

    async fn fetch(&self, _id: &str) -> Result<Option<AlertRecord>, String> {
        Ok(None)
    }
}

/// Disabled-by-default mirror used when `remote_mirror.enabled = false`.
pub struct NoopMirror;

#[async_trait]
impl RemoteMirror for NoopMirror {
    async fn push(&self, _record: &AlertRecord) -> Result<(), String> {
        Ok(())
    }
}

/// Content-addressed mirror backed by a local directory: one JSON file per
/// record, named by id. Stands in for the external object store spec.md §9
/// leaves as a configuration choice, without fabricating an SDK dependency
/// for a service this crate has no real credentials for.
pub struct FileSystemMirror {
    directory: PathBuf,
}

impl FileSystemMirror {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into() }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.directory.join(format!("{id}.json"))
    }
}

#[async_trait]
impl RemoteMirror for FileSystemMirror {
    async fn push(&self, record: &AlertRecord) -> Result<(), String> {
        std::fs::create_dir_all(&self.directory).map_err(|e| e.to_string())?;
        let json = serde_json::to_vec_pretty(record).map_err(|e| e.to_string())?;
        std::fs::write(self.record_path(&record.id), json).map_err(|e| e.to_string())
    }

    async fn list_ids(&self) -> Result<Vec<String>, String> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.directory).map_err(|e| e.to_string())?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| e.to_string())?;
            if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                ids.push(name.to_string());
            }
        }
        Ok(ids)
    }

    async fn fetch(&self, id: &str) -> Result<Option<AlertRecord>, String> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
        serde_json::from_str(&raw).map(Some).map_err(|e| e.to_string())
    }
}

struct PendingBatch {
    records: Vec<AlertRecord>,
    window_start: DateTime<Utc>,
}

/// Coalesces bursts of appends (≤3 within 2s become one mirror cycle) and
/// retries with backoff. Runs its own task; `enqueue` never blocks the
/// caller beyond a channel send.
pub struct MirrorTask {
    tx: mpsc::Sender<AlertRecord>,
}

impl MirrorTask {
    pub fn spawn(
        mirror: Arc<dyn RemoteMirror>,
        coalesce_window: Duration,
        max_coalesced: usize,
        failure_counter: Arc<std::sync::atomic::AtomicU64>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<AlertRecord>(256);

        tokio::spawn(async move {
            let pending: Arc<Mutex<Option<PendingBatch>>> = Arc::new(Mutex::new(None));

            while let Some(record) = rx.recv().await {
                let mut batch_to_flush = None;
                {
                    let mut guard = pending.lock().await;
                    let now = Utc::now();
                    match guard.as_mut() {
                        Some(batch) if batch.records.len() < max_coalesced => {
                            batch.records.push(record);
                            if batch.records.len() >= max_coalesced {
                                batch_to_flush = guard.take();
                            }
                        }
                        _ => {
                            if let Some(full) = guard.take() {
                                batch_to_flush = Some(full);
                            }
                            *guard = Some(PendingBatch {
                                records: vec![record],
                                window_start: now,
                            });
                        }
                    }
                }

                if let Some(batch) = batch_to_flush {
                    flush(&mirror, batch.records, &failure_counter).await;
                    continue;
                }

                let pending_clone = pending.clone();
                let mirror_clone = mirror.clone();
                let failure_counter_clone = failure_counter.clone();
                tokio::spawn(async move {
                    sleep(coalesce_window).await;
                    let mut guard = pending_clone.lock().await;
                    if let Some(batch) = guard.take() {
                        drop(guard);
                        flush(&mirror_clone, batch.records, &failure_counter_clone).await;
                    }
                });
            }
        });

        Self { tx }
    }

    pub async fn enqueue(&self, record: AlertRecord) {
        if self.tx.send(record).await.is_err() {
            tracing::error!("remote mirror task is gone, dropping record from mirror queue");
        }
    }
}

async fn flush(mirror: &Arc<dyn RemoteMirror>, records: Vec<AlertRecord>, failure_counter: &Arc<std::sync::atomic::AtomicU64>) {
    let mut delay = Duration::from_millis(100);
    for record in &records {
        let mut ok = false;
        for attempt in 0..3 {
            match mirror.push(record).await {
                Ok(()) => {
                    ok = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, id = %record.id, "remote mirror push failed");
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
        if !ok {
            failure_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::error!(id = %record.id, "remote mirror push exhausted retries");
        }
    }
}

/// Startup reconciliation: pulls any record the mirror has that the local
/// log doesn't, merging by id (spec.md §4.6.1).
pub async fn reconcile(mirror: &dyn RemoteMirror, local_ids: &std::collections::HashSet<String>) -> Vec<AlertRecord> {
    let remote_ids = match mirror.list_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(error = %e, "remote mirror reconciliation: list_ids failed");
            return Vec::new();
        }
    };

    let mut recovered = Vec::new();
    for id in remote_ids {
        if local_ids.contains(&id) {
            continue;
        }
        match mirror.fetch(&id).await {
            Ok(Some(record)) => recovered.push(record),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, id, "remote mirror reconciliation: fetch failed"),
        }
    }
    recovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct CountingMirror {
        pushes: AtomicUsize,
    }

    #[async_trait]
    impl RemoteMirror for CountingMirror {
        async fn push(&self, _record: &AlertRecord) -> Result<(), String> {
            self.pushes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn record(id: &str) -> AlertRecord {
        AlertRecord {
            id: id.to_string(),
            token: "FOO".into(),
            tier: 1,
            level: "HIGH".into(),
            timestamp: Utc::now(),
            contract: "AAAA".into(),
            entry_mc_usd: None,
            hotlist: "No".into(),
            description: String::new(),
            matched_signals: vec![],
            tags: vec![],
            liquidity: None,
            callers: None,
            subs: None,
            confirmation_count: 0,
            cohort_time: String::new(),
        }
    }

    #[tokio::test]
    async fn coalesces_bursts_within_window() {
        let mirror = Arc::new(CountingMirror { pushes: AtomicUsize::new(0) });
        let failures = Arc::new(AtomicU64::new(0));
        let task = MirrorTask::spawn(mirror.clone(), Duration::from_millis(50), 3, failures);

        task.enqueue(record("A")).await;
        task.enqueue(record("B")).await;
        task.enqueue(record("C")).await;
        sleep(Duration::from_millis(200)).await;

        assert_eq!(mirror.pushes.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn noop_mirror_never_fails() {
        let mirror = NoopMirror;
        assert!(mirror.push(&record("A")).await.is_ok());
    }

    #[tokio::test]
    async fn filesystem_mirror_round_trips_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileSystemMirror::new(dir.path());
        mirror.push(&record("A")).await.unwrap();
        mirror.push(&record("B")).await.unwrap();

        let mut ids = mirror.list_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);

        let fetched = mirror.fetch("A").await.unwrap().unwrap();
        assert_eq!(fetched.id, "A");
        assert!(mirror.fetch("missing").await.unwrap().is_none());
    }
}
