//! Write-only record of every verification attempt.
//!
//! [`AnalyticsRecorder::record`] never blocks or fails the caller: events go
//! through a bounded channel to a background task that fans them out to the
//! configured sinks. A full queue drops the event and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::amount::UsdAmount;
use crate::metrics;
use crate::outcome::{Backend, Reason, VerificationOutcome, VerificationStatus};
use crate::payment::PaymentRequirement;
use crate::VerifyError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationEvent {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub resource: Option<String>,
    pub status: VerificationStatus,
    pub reason: Reason,
    pub backend: Backend,
    pub latency_ms: u64,
    pub chain: Option<String>,
    pub amount_usd: Option<UsdAmount>,
    pub payer: Option<String>,
}

impl VerificationEvent {
    pub fn from_outcome(outcome: &VerificationOutcome, requirement: &PaymentRequirement) -> Self {
        let transfer = outcome.normalized_transfer.as_ref();
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            resource: requirement.resource.clone(),
            status: outcome.status,
            reason: outcome.reason,
            backend: outcome.backend_used,
            latency_ms: outcome.latency_ms,
            chain: transfer.map(|t| t.chain.clone()),
            amount_usd: transfer.map(|t| t.amount_usd()),
            payer: transfer.map(|t| t.from_address.clone()),
        }
    }
}

/// Destination for verification events.
pub trait AnalyticsSink: Send + Sync {
    fn record(&self, event: &VerificationEvent) -> Result<(), VerifyError>;
}

/// Handle for emitting events. Cheap to clone.
#[derive(Clone)]
pub struct AnalyticsRecorder {
    tx: Option<mpsc::Sender<VerificationEvent>>,
    dropped: Arc<AtomicU64>,
}

impl AnalyticsRecorder {
    /// Start the background writer over `sinks`.
    ///
    /// The task ends once every clone of the recorder is dropped and the
    /// queue has drained.
    pub fn spawn(
        sinks: Vec<Arc<dyn AnalyticsSink>>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<VerificationEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    if let Err(e) = sink.record(&event) {
                        tracing::warn!(
                            event_id = %event.id,
                            error = %e,
                            "failed to persist verification event"
                        );
                    }
                }
            }
            tracing::debug!("analytics writer stopped");
        });
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Metrics only; nothing is persisted.
    pub fn noop() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record(&self, event: VerificationEvent) {
        metrics::VERIFICATIONS
            .with_label_values(&[
                event.status.as_str(),
                event.reason.as_str(),
                event.backend.as_str(),
            ])
            .inc();
        metrics::VERIFICATION_LATENCY
            .with_label_values(&[event.backend.as_str()])
            .observe(event.latency_ms as f64 / 1000.0);

        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::ANALYTICS_DROPPED.inc();
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            tracing::warn!(reason, "verification event dropped");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Collects events in memory.
#[derive(Default)]
pub struct MemoryAnalyticsSink {
    events: Mutex<Vec<VerificationEvent>>,
}

impl MemoryAnalyticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<VerificationEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AnalyticsSink for MemoryAnalyticsSink {
    fn record(&self, event: &VerificationEvent) -> Result<(), VerifyError> {
        self.events
            .lock()
            .map_err(|_| VerifyError::StorePoisoned)?
            .push(event.clone());
        Ok(())
    }
}

/// Per-backend aggregate over a time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSummary {
    pub backend: String,
    pub attempts: u64,
    pub verified: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub verified_volume_usd: UsdAmount,
    pub unique_payers: u64,
}

/// Append-only `verification_attempts` table.
pub struct SqliteAnalyticsSink {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteAnalyticsSink {
    pub fn open(path: &str) -> Result<Self, VerifyError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS verification_attempts (
                id TEXT PRIMARY KEY,
                recorded_at INTEGER NOT NULL,
                resource TEXT,
                status TEXT NOT NULL,
                reason TEXT NOT NULL,
                backend TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                chain TEXT,
                amount_micros INTEGER,
                payer TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_recorded_at ON verification_attempts(recorded_at);
            PRAGMA journal_mode=WAL;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("analytics store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn backend_summary(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<BackendSummary>, VerifyError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT backend,
                    COUNT(*),
                    SUM(CASE WHEN status = 'verified' THEN 1 ELSE 0 END),
                    AVG(latency_ms),
                    COALESCE(SUM(CASE WHEN status = 'verified' THEN amount_micros ELSE 0 END), 0),
                    COUNT(DISTINCT payer)
             FROM verification_attempts
             WHERE recorded_at >= ?1
             GROUP BY backend
             ORDER BY backend",
        )?;
        let rows = stmt.query_map([since.timestamp()], |row| {
            let attempts: i64 = row.get(1)?;
            let verified: i64 = row.get(2)?;
            let volume: i64 = row.get(4)?;
            let unique_payers: i64 = row.get(5)?;
            Ok(BackendSummary {
                backend: row.get(0)?,
                attempts: attempts.max(0) as u64,
                verified: verified.max(0) as u64,
                success_rate: if attempts > 0 {
                    verified as f64 / attempts as f64
                } else {
                    0.0
                },
                avg_latency_ms: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                verified_volume_usd: UsdAmount::from_micros(volume.max(0) as u128),
                unique_payers: unique_payers.max(0) as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl AnalyticsSink for SqliteAnalyticsSink {
    fn record(&self, event: &VerificationEvent) -> Result<(), VerifyError> {
        let amount_micros = event
            .amount_usd
            .map(|a| i64::try_from(a.micros()).unwrap_or(i64::MAX));
        self.conn().execute(
            "INSERT INTO verification_attempts
                (id, recorded_at, resource, status, reason, backend, latency_ms, chain, amount_micros, payer)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                event.id.to_string(),
                event.recorded_at.timestamp(),
                event.resource,
                event.status.as_str(),
                event.reason.as_str(),
                event.backend.as_str(),
                i64::try_from(event.latency_ms).unwrap_or(i64::MAX),
                event.chain,
                amount_micros,
                event.payer,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(
        status: VerificationStatus,
        backend: Backend,
        micros: Option<u128>,
        payer: Option<&str>,
    ) -> VerificationEvent {
        let reason = match status {
            VerificationStatus::Verified => Reason::Verified,
            VerificationStatus::Rejected => Reason::Underpayment,
            VerificationStatus::BackendUnavailable => Reason::ChainRpcTimeout,
        };
        VerificationEvent {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            resource: Some("/api/data".to_string()),
            status,
            reason,
            backend,
            latency_ms: 100,
            chain: Some("base".to_string()),
            amount_usd: micros.map(UsdAmount::from_micros),
            payer: payer.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_recorder_delivers_to_sinks() {
        let sink = Arc::new(MemoryAnalyticsSink::new());
        let sinks: Vec<Arc<dyn AnalyticsSink>> = vec![sink.clone()];
        let (recorder, handle) = AnalyticsRecorder::spawn(sinks, 16);

        let paid = event(VerificationStatus::Verified, Backend::Chain, Some(10_000), Some("0xa"));
        recorder.record(paid);
        recorder.record(event(VerificationStatus::Rejected, Backend::Facilitator, None, None));
        drop(recorder);
        handle.await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, VerificationStatus::Verified);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let sink = Arc::new(MemoryAnalyticsSink::new());
        let sinks: Vec<Arc<dyn AnalyticsSink>> = vec![sink.clone()];
        let (recorder, handle) = AnalyticsRecorder::spawn(sinks, 1);

        // current_thread runtime: the writer cannot run until we yield.
        for _ in 0..5 {
            recorder.record(event(VerificationStatus::Rejected, Backend::Chain, None, None));
        }
        assert_eq!(recorder.dropped(), 4);

        drop(recorder);
        handle.await.unwrap();
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_noop_recorder_accepts_events() {
        let recorder = AnalyticsRecorder::noop();
        recorder.record(event(VerificationStatus::Rejected, Backend::Cache, None, None));
        assert_eq!(recorder.dropped(), 0);
    }

    #[test]
    fn test_sqlite_backend_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let sink = SqliteAnalyticsSink::open(path.to_str().unwrap()).unwrap();

        let events = [
            event(VerificationStatus::Verified, Backend::Chain, Some(10_000), Some("0xa")),
            event(VerificationStatus::Verified, Backend::Chain, Some(20_000), Some("0xb")),
            event(VerificationStatus::Rejected, Backend::Chain, None, None),
            event(VerificationStatus::Verified, Backend::Facilitator, Some(50_000), Some("0xa")),
        ];
        for event in &events {
            sink.record(event).unwrap();
        }

        let since = Utc::now() - chrono::Duration::hours(1);
        let summary = sink.backend_summary(since).unwrap();
        assert_eq!(summary.len(), 2);

        let chain = &summary[0];
        assert_eq!(chain.backend, "chain");
        assert_eq!(chain.attempts, 3);
        assert_eq!(chain.verified, 2);
        assert!((chain.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((chain.avg_latency_ms - 100.0).abs() < 1e-9);
        assert_eq!(chain.verified_volume_usd, UsdAmount::from_micros(30_000));
        assert_eq!(chain.unique_payers, 2);

        let facilitator = &summary[1];
        assert_eq!(facilitator.backend, "facilitator");
        assert_eq!(facilitator.verified, 1);
    }

    #[test]
    fn test_summary_window_excludes_old_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let sink = SqliteAnalyticsSink::open(path.to_str().unwrap()).unwrap();

        let mut old = event(VerificationStatus::Verified, Backend::Chain, Some(1), Some("0xa"));
        old.recorded_at = Utc::now() - chrono::Duration::days(2);
        sink.record(&old).unwrap();

        let summary = sink.backend_summary(Utc::now() - chrono::Duration::days(1)).unwrap();
        assert!(summary.is_empty());
    }
}
