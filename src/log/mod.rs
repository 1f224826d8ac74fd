//! Durable Event Log (spec.md §4.6): append-only JSON document with atomic
//! writes, rotating backups, and an emergency JSON-lines fallback. The
//! emitter task is the sole writer; readers (the API cache) only ever see
//! the file through the rename boundary, never a half-written one.

pub mod mirror;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::error::{Result, SentryError};
use crate::model::AlertRecord;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogDocument {
    pub alerts: Vec<AlertRecord>,
    pub last_updated: Option<chrono::DateTime<Utc>>,
}

pub struct DurableLog {
    path: PathBuf,
    backup_count: usize,
    emergency_sidecar_path: PathBuf,
    lock_path: PathBuf,
    write_seq: AtomicU64,
    consecutive_failures: AtomicU64,
    /// Bumped once per successful logical write (append or echo-update), so
    /// readers can detect "the document changed" without re-parsing it or
    /// stat-ing the backing file (spec.md §4.7's mtime-check requirement).
    generation: AtomicU64,
    // Guards read-modify-write of the document; the writer owns the only
    // mutable reference to its in-memory copy between appends.
    doc: Mutex<LogDocument>,
    _lock_file: Option<std::fs::File>,
}

impl DurableLog {
    /// Opens (or creates) the log at `path`, runs emergency-sidecar
    /// recovery, and takes the per-process `.lock` file (spec.md §6).
    pub async fn open(
        path: impl AsRef<Path>,
        backup_count: usize,
        emergency_sidecar_path: impl AsRef<Path>,
        lock_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let emergency_sidecar_path = emergency_sidecar_path.as_ref().to_path_buf();
        let lock_path = lock_path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SentryError::Config(format!("cannot create log directory: {e}")))?;
        }

        let lock_file = acquire_lock(&lock_path)?;

        let mut doc = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| SentryError::LogCorrupt(format!("cannot read {}: {e}", path.display())))?;
            serde_json::from_str(&raw)
                .map_err(|e| SentryError::LogCorrupt(format!("cannot parse {}: {e}", path.display())))?
        } else {
            LogDocument::default()
        };

        recover_emergency_sidecar(&emergency_sidecar_path, &mut doc)?;

        let log = Self {
            path,
            backup_count,
            emergency_sidecar_path,
            lock_path,
            write_seq: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            doc: Mutex::new(doc),
            _lock_file: Some(lock_file),
        };
        log.persist_full().await?;
        Ok(log)
    }

    /// Appends one record with a collision-safe `id`, writing it durably
    /// before returning (spec.md §4.5 step 4 / §4.6).
    pub async fn append(&self, mut record: AlertRecord) -> Result<AlertRecord> {
        let mut doc = self.doc.lock().await;
        record.id = unique_id(&doc.alerts, &record.id);
        doc.alerts.push(record.clone());
        doc.last_updated = Some(Utc::now());
        self.write_locked(&doc).await?;
        self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    /// The only permitted mutation of a written record (spec.md §4.6.2):
    /// updates `callers`/`subs` on every record matching `token` (and
    /// `tier`, if given) by uppercase symbol.
    pub async fn update_callers_subs(
        &self,
        token: &str,
        tier: Option<u8>,
        callers: Option<u32>,
        subs: Option<u32>,
    ) -> Result<usize> {
        let mut doc = self.doc.lock().await;
        let token = token.to_uppercase();
        let mut updated = 0;
        for rec in doc.alerts.iter_mut() {
            if rec.token.to_uppercase() != token {
                continue;
            }
            if let Some(t) = tier {
                if rec.tier != t {
                    continue;
                }
            }
            rec.callers = callers;
            rec.subs = subs;
            updated += 1;
        }
        if updated > 0 {
            doc.last_updated = Some(Utc::now());
            self.write_locked(&doc).await?;
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
        Ok(updated)
    }

    pub async fn snapshot(&self) -> LogDocument {
        self.doc.lock().await.clone()
    }

    pub fn consecutive_write_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Monotonic counter bumped on every successful write. The read API's
    /// cache compares this against the value it cached to invalidate on a
    /// completed write rather than waiting out the TTL.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn emergency_sidecar_path(&self) -> &Path {
        &self.emergency_sidecar_path
    }

    async fn persist_full(&self) -> Result<()> {
        let doc = self.doc.lock().await;
        self.write_locked(&doc).await
    }

    /// The write algorithm from spec.md §4.6: backup rotation, temp file +
    /// fsync + atomic rename, retry cascade, emergency sidecar fallback.
    async fn write_locked(&self, doc: &LogDocument) -> Result<()> {
        self.maybe_rotate_backup();

        let body = serde_json::to_vec_pretty(doc)
            .map_err(|e| SentryError::DurableWriteFailed(format!("serialize: {e}")))?;

        let mut delay_ms: u64 = 50;
        for attempt in 0..5 {
            match self.write_atomic(&body).await {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "durable log write attempt failed");
                    if attempt < 4 {
                        sleep(Duration::from_millis(delay_ms)).await;
                        delay_ms = (delay_ms * 2).min(800);
                    }
                }
            }
        }

        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!("durable log write exhausted retries, falling back to emergency sidecar");
        if let Some(last) = doc.alerts.last() {
            self.write_emergency_sidecar(last)?;
            Ok(())
        } else {
            Err(SentryError::DurableWriteFailed(
                "retry cascade exhausted and no record to sidecar".into(),
            ))
        }
    }

    async fn write_atomic(&self, body: &[u8]) -> Result<()> {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        let tmp_path = self.path.with_extension(format!("tmp.{pid}.{seq}"));
        let final_path = self.path.clone();
        let body = body.to_vec();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(&body)?;
            f.sync_all()?;
            drop(f);
            std::fs::rename(&tmp_path, &final_path)?;
            Ok(())
        })
        .await
        .map_err(|e| SentryError::DurableWriteFailed(format!("join error: {e}")))?
        .map_err(|e| SentryError::DurableWriteFailed(e.to_string()))
    }

    /// Backup rotation: every Nth write where N grows with consecutive
    /// failures (healthy disk = every write; degraded disk = back off).
    fn maybe_rotate_backup(&self) {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        let batch = 1u64 << failures.min(6);
        let seq = self.write_seq.load(Ordering::Relaxed);
        if seq % batch != 0 || !self.path.exists() {
            return;
        }
        let backups_dir = match self.path.parent() {
            Some(p) => p.join("backups"),
            None => return,
        };
        if std::fs::create_dir_all(&backups_dir).is_err() {
            return;
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let name = self
            .path
            .file_name()
            .map(|n| format!("{}.{stamp}.bak", n.to_string_lossy()))
            .unwrap_or_else(|| format!("alerts.{stamp}.bak"));
        let _ = std::fs::copy(&self.path, backups_dir.join(name));
        prune_backups(&backups_dir, self.backup_count);
    }

    fn write_emergency_sidecar(&self, record: &AlertRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| SentryError::DurableWriteFailed(format!("serialize emergency record: {e}")))?;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.emergency_sidecar_path)
            .map_err(|e| SentryError::DurableWriteFailed(format!("open emergency sidecar: {e}")))?;
        writeln!(f, "{line}")
            .map_err(|e| SentryError::DurableWriteFailed(format!("append emergency sidecar: {e}")))
    }
}

fn acquire_lock(lock_path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(lock_path)
        .map_err(|e| SentryError::Config(format!("cannot acquire lock file {}: {e}", lock_path.display())))
}

fn prune_backups(dir: &Path, keep: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    let mut names: Vec<_> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    names.sort();
    while names.len() > keep {
        let oldest = names.remove(0);
        let _ = std::fs::remove_file(oldest);
    }
}

/// Merges any sidecar entries into `doc` (startup recovery, spec.md §4.6)
/// and truncates the sidecar once merged.
fn recover_emergency_sidecar(sidecar_path: &Path, doc: &mut LogDocument) -> Result<()> {
    if !sidecar_path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(sidecar_path)
        .map_err(|e| SentryError::LogCorrupt(format!("cannot read emergency sidecar: {e}")))?;
    let known_ids: std::collections::HashSet<&str> = doc.alerts.iter().map(|a| a.id.as_str()).collect();
    let mut recovered = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AlertRecord>(line) {
            Ok(rec) if !known_ids.contains(rec.id.as_str()) => recovered.push(rec),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "skipping corrupt emergency sidecar line"),
        }
    }
    if !recovered.is_empty() {
        tracing::info!(count = recovered.len(), "recovered records from emergency sidecar");
        doc.alerts.extend(recovered);
    }
    let _ = std::fs::remove_file(sidecar_path);
    Ok(())
}

/// Appends `_v2`, `_v3`, … on collision with an existing record id for the
/// same day (spec.md §4.5 step 3).
fn unique_id(existing: &[AlertRecord], candidate: &str) -> String {
    if !existing.iter().any(|a| a.id == candidate) {
        return candidate.to_string();
    }
    let mut n = 2;
    loop {
        let attempt = format!("{candidate}_v{n}");
        if !existing.iter().any(|a| a.id == attempt) {
            return attempt;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record(id: &str) -> AlertRecord {
        AlertRecord {
            id: id.to_string(),
            token: "FOO".into(),
            tier: 1,
            level: "HIGH".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 21, 0, 33).unwrap(),
            contract: "AAAAAAAABBBBBBBBCCCCCCCCDDDDDDDD".into(),
            entry_mc_usd: Some(198_100.0),
            hotlist: "Yes".into(),
            description: "desc".into(),
            matched_signals: vec!["hotlist".into(), "momentum_spike".into()],
            tags: vec!["top5_hotlist".into()],
            liquidity: Some(21_800.0),
            callers: Some(3),
            subs: Some(12_357),
            confirmation_count: 2,
            cohort_time: "3h ago".into(),
        }
    }

    #[tokio::test]
    async fn append_then_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::open(
            dir.path().join("alerts.json"),
            5,
            dir.path().join("alerts.jsonl.emergency"),
            dir.path().join("alerts.json.lock"),
        )
        .await
        .unwrap();

        log.append(sample_record("AAAAAAAA_2026-01-02")).await.unwrap();
        let snap = log.snapshot().await;
        assert_eq!(snap.alerts.len(), 1);
        assert_eq!(snap.alerts[0].id, "AAAAAAAA_2026-01-02");
    }

    #[tokio::test]
    async fn id_collision_gets_version_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::open(
            dir.path().join("alerts.json"),
            5,
            dir.path().join("alerts.jsonl.emergency"),
            dir.path().join("alerts.json.lock"),
        )
        .await
        .unwrap();

        log.append(sample_record("AAAAAAAA_2026-01-02")).await.unwrap();
        let second = log.append(sample_record("AAAAAAAA_2026-01-02")).await.unwrap();
        assert_eq!(second.id, "AAAAAAAA_2026-01-02_v2");
    }

    #[tokio::test]
    async fn update_callers_subs_mutates_matching_records_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::open(
            dir.path().join("alerts.json"),
            5,
            dir.path().join("alerts.jsonl.emergency"),
            dir.path().join("alerts.json.lock"),
        )
        .await
        .unwrap();

        log.append(sample_record("AAAAAAAA_2026-01-02")).await.unwrap();
        let mut other = sample_record("BBBBBBBB_2026-01-02");
        other.token = "BAR".into();
        log.append(other).await.unwrap();

        let updated = log.update_callers_subs("foo", None, Some(9), Some(5000)).await.unwrap();
        assert_eq!(updated, 1);
        let snap = log.snapshot().await;
        let foo = snap.alerts.iter().find(|a| a.token == "FOO").unwrap();
        assert_eq!(foo.callers, Some(9));
        assert_eq!(foo.subs, Some(5000));
        let bar = snap.alerts.iter().find(|a| a.token == "BAR").unwrap();
        assert_eq!(bar.callers, Some(3), "non-matching record must not change");
    }

    #[tokio::test]
    async fn startup_recovers_emergency_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = dir.path().join("alerts.jsonl.emergency");
        std::fs::write(
            &sidecar,
            format!("{}\n", serde_json::to_string(&sample_record("CCCCCCCC_2026-01-02")).unwrap()),
        )
        .unwrap();

        let log = DurableLog::open(dir.path().join("alerts.json"), 5, &sidecar, dir.path().join("alerts.json.lock"))
            .await
            .unwrap();

        let snap = log.snapshot().await;
        assert_eq!(snap.alerts.len(), 1);
        assert!(!sidecar.exists(), "sidecar is cleared after recovery");
    }
}
