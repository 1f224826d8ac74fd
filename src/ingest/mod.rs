//! Source Ingest (spec.md §4.1): one long-lived session per configured
//! source, a bounded per-source buffer that drops the oldest message on
//! overflow, and exponential-backoff reconnection. Transport errors retry;
//! authentication errors are fatal and surfaced to `main`.

mod transport;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Duration;

pub use transport::{ChatTransport, RawTransportMessage, TransportError, WebSocketTransport};

use crate::config::SourceConfig;
use crate::metrics::Metrics;
use crate::model::RawMessage;

/// Bounded per-source buffer (spec.md §4.1: "drop to a bounded buffer of
/// 1024 per source; overflow logs and drops oldest"). A plain channel
/// can't express drop-oldest-on-full, so this is a small ring guarded by a
/// mutex with a `Notify` to wake the drain loop.
struct SourceBuffer {
    queue: Mutex<VecDeque<RawMessage>>,
    capacity: usize,
    notify: Notify,
    metrics: Arc<Metrics>,
}

impl SourceBuffer {
    fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            metrics,
        }
    }

    async fn push(&self, msg: RawMessage) {
        let mut q = self.queue.lock().await;
        if q.len() >= self.capacity {
            q.pop_front();
            self.metrics.record_ingest_buffer_dropped();
        }
        q.push_back(msg);
        drop(q);
        self.notify.notify_one();
    }

    async fn pop(&self) -> RawMessage {
        loop {
            {
                let mut q = self.queue.lock().await;
                if let Some(msg) = q.pop_front() {
                    return msg;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Spawns the long-lived ingest task for one source: connects via
/// `transport`, pushes every inbound message into a bounded buffer, and
/// forwards drained messages onward to the shared parser channel. Runs
/// forever with exponential backoff on transient failures; returns
/// `Err` only on a fatal authentication failure (spec.md §4.1).
pub async fn run_source(
    source: SourceConfig,
    transport: Arc<dyn ChatTransport>,
    buffer_capacity: usize,
    parser_tx: mpsc::Sender<RawMessage>,
    backoff_min: Duration,
    backoff_max: Duration,
    metrics: Arc<crate::metrics::Metrics>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), crate::error::SentryError> {
    let buffer = Arc::new(SourceBuffer::new(buffer_capacity, metrics.clone()));

    let drain_buffer = buffer.clone();
    let drain_source_id = source.source_id.clone();
    let drain_parser_tx = parser_tx.clone();
    let mut drain_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = drain_shutdown.changed() => {
                    if *drain_shutdown.borrow() { return; }
                }
                msg = drain_buffer.pop() => {
                    if drain_parser_tx.send(msg).await.is_err() {
                        tracing::warn!(source_id = %drain_source_id, "parser channel closed, stopping drain");
                        return;
                    }
                }
            }
        }
    });

    let mut delay = backoff_min;
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        tracing::info!(source_id = %source.source_id, "ingest session starting");
        let (tx, mut rx) = mpsc::channel::<RawTransportMessage>(buffer_capacity);
        let transport_clone = transport.clone();
        let run_fut = Box::pin(transport_clone.run(tx));

        let outcome = tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!(source_id = %source.source_id, "ingest session stopping for shutdown");
                return Ok(());
            }
            result = drain_into_buffer(&source, &buffer, rx.by_ref(), run_fut) => result,
        };

        match outcome {
            Ok(()) => {
                tracing::info!(source_id = %source.source_id, "ingest session closed cleanly, reconnecting");
                delay = backoff_min;
            }
            Err(TransportError::AuthFailed(reason)) => {
                tracing::error!(source_id = %source.source_id, reason, "ingest authentication failed, fatal");
                return Err(crate::error::SentryError::IngestAuthFailed {
                    source_id: source.source_id.clone(),
                    reason,
                });
            }
            Err(TransportError::Transient(reason)) => {
                tracing::warn!(source_id = %source.source_id, reason, "ingest transport error, retrying");
            }
        }

        metrics.record_ingest_reconnect();
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(backoff_max);
    }
}

/// Runs one connection attempt: drains `rx` into the source buffer while
/// `run_fut` drives the transport, until either the transport future
/// resolves (clean close or error) or the sender side is dropped.
async fn drain_into_buffer(
    source: &SourceConfig,
    buffer: &Arc<SourceBuffer>,
    mut rx: mpsc::Receiver<RawTransportMessage>,
    run_fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send>>,
) -> Result<(), TransportError> {
    tokio::pin!(run_fut);
    loop {
        tokio::select! {
            maybe_msg = rx.recv() => {
                match maybe_msg {
                    Some(raw) => {
                        let now = Utc::now();
                        let msg = RawMessage {
                            source_id: source.source_id.clone(),
                            received_at: std::time::Instant::now(),
                            received_at_wall: now,
                            text: raw.text,
                            entities: raw.entities,
                            thread_id: raw.thread_id,
                        };
                        buffer.push(msg).await;
                    }
                    None => {
                        // Transport closed its sender; wait for run_fut's final result.
                        return (&mut run_fut).await;
                    }
                }
            }
            result = &mut run_fut => {
                return result;
            }
        }
    }
}
