mod api;
mod config;
mod correlator;
mod emitter;
mod error;
mod fanout;
mod ingest;
mod log;
mod metrics;
mod model;
mod parser;
mod state;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;

use crate::config::{Config, SourceConfig, SourceKind};
use crate::correlator::{Correlator, NoopOutcomesFeed};
use crate::emitter::{Emitter, HttpQuoteService, NoopQuoteService, QuoteService};
use crate::fanout::{FanOut, SubscriberRegistry};
use crate::ingest::{ChatTransport, WebSocketTransport};
use crate::log::mirror::{FileSystemMirror, MirrorTask, NoopMirror, RemoteMirror};
use crate::log::DurableLog;
use crate::metrics::Metrics;
use crate::model::RawMessage;
use crate::parser::ParseMetrics;
use crate::state::TokenStateStore;

#[derive(Parser, Debug)]
#[command(name = "sentry-core")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,

    /// Print the fully resolved configuration as YAML and exit without
    /// starting the pipeline.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(2);
        }
    };

    if cli.print_config {
        println!("{}", cfg.to_yaml());
        return;
    }

    match run(cfg).await {
        Ok(()) => std::process::exit(0),
        Err(FatalError::IngestAuth { source_id, reason }) => {
            tracing::error!(source_id, reason, "unrecoverable ingest authentication failure");
            std::process::exit(3);
        }
        Err(FatalError::DurableWriteFailed { reason }) => {
            tracing::error!(reason, "durable log write failed after retries and emergency sidecar, exiting");
            std::process::exit(4);
        }
    }
}

enum FatalError {
    IngestAuth { source_id: String, reason: String },
    DurableWriteFailed { reason: String },
}

async fn run(cfg: Config) -> Result<(), FatalError> {
    let log = match DurableLog::open(
        &cfg.durable_log.path,
        cfg.durable_log.backup_count,
        &cfg.durable_log.emergency_sidecar_path,
        &cfg.durable_log.lock_path,
    )
    .await
    {
        Ok(log) => Arc::new(log),
        Err(e) => {
            tracing::error!(error = %e, "failed to open durable log");
            std::process::exit(2);
        }
    };

    let mirror: Arc<dyn RemoteMirror> = if cfg.remote_mirror.enabled {
        Arc::new(FileSystemMirror::new(cfg.remote_mirror.endpoint.clone()))
    } else {
        Arc::new(NoopMirror)
    };

    reconcile_mirror(&log, mirror.as_ref()).await;

    let mirror_failures = Arc::new(AtomicU64::new(0));
    let mirror_task = Arc::new(MirrorTask::spawn(
        mirror.clone(),
        Duration::from_millis(cfg.remote_mirror.coalesce_window_ms),
        cfg.remote_mirror.max_coalesced,
        mirror_failures.clone(),
    ));

    let metrics = Arc::new(Metrics::new());
    let parse_metrics = Arc::new(ParseMetrics::new());

    let state_store = Arc::new(TokenStateStore::new());
    let correlator = Arc::new(Correlator::new(
        state_store.clone(),
        cfg.thresholds.clone(),
        Box::new(NoopOutcomesFeed),
    ));
    let registry = Arc::new(SubscriberRegistry::new());
    let fanout = Arc::new(FanOut::with_delivery(
        registry.clone(),
        None,
        Arc::new(fanout::NoopDelivery),
        cfg.ingest.fanout_channel_capacity,
        Some(metrics.clone()),
    ));
    let quotes: Box<dyn QuoteService> = if cfg.quote_service.enabled {
        Box::new(HttpQuoteService::new(
            cfg.quote_service.base_url.clone(),
            Duration::from_secs(cfg.quote_service.timeout_secs),
        ))
    } else {
        Box::new(NoopQuoteService)
    };
    let emitter = Arc::new(Emitter::new(
        state_store.clone(),
        correlator.clone(),
        log.clone(),
        fanout.clone(),
        quotes,
        cfg.thresholds.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (parser_tx, parser_rx) = mpsc::channel::<RawMessage>(cfg.ingest.parser_channel_capacity);

    let source_kinds: HashMap<String, SourceKind> = cfg
        .sources
        .iter()
        .map(|s| (s.source_id.clone(), s.kind))
        .collect();

    let mut ingest_handles = Vec::new();
    for source in &cfg.sources {
        let transport = build_transport(source);
        let handle = tokio::spawn(ingest::run_source(
            source.clone(),
            transport,
            cfg.ingest.buffer_per_source,
            parser_tx.clone(),
            Duration::from_secs(cfg.ingest.reconnect_backoff_min_secs),
            Duration::from_secs(cfg.ingest.reconnect_backoff_max_secs),
            metrics.clone(),
            shutdown_rx.clone(),
        ));
        ingest_handles.push(handle);
    }
    drop(parser_tx);

    let mut correlator_handle = tokio::spawn(correlate_and_emit(
        parser_rx,
        source_kinds,
        cfg.thresholds.clone(),
        state_store.clone(),
        correlator.clone(),
        emitter.clone(),
        parse_metrics.clone(),
        metrics.clone(),
        mirror_task.clone(),
        log.clone(),
        shutdown_rx.clone(),
    ));

    let eviction_handle = tokio::spawn(periodic_eviction(
        state_store.clone(),
        cfg.thresholds.clone(),
        shutdown_rx.clone(),
    ));

    let api_state = api::AppState::new(
        log.clone(),
        registry.clone(),
        metrics.clone(),
        parse_metrics.clone(),
        mirror_failures.clone(),
        Duration::from_secs(cfg.api.cache_ttl_secs),
    );
    let api_handle = tokio::spawn(api::serve(api_state, cfg.api.listen_port));

    // The correlator is the only task that can surface a fatal mid-run error
    // (spec.md §7: DurableWriteFailed, only once retries and the emergency
    // sidecar have both failed). Race it against the shutdown signal so a
    // fatal exits immediately rather than waiting for the operator to Ctrl-C.
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received, draining");
        }
        result = &mut correlator_handle => {
            if let Ok(Err(crate::error::SentryError::DurableWriteFailed(reason))) = result {
                let _ = shutdown_tx.send(true);
                eviction_handle.abort();
                api_handle.abort();
                drop(mirror_task);
                return Err(FatalError::DurableWriteFailed { reason });
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain_budget = Duration::from_secs(5);
    for handle in ingest_handles {
        if let Ok(Ok(Err(crate::error::SentryError::IngestAuthFailed { source_id, reason }))) =
            tokio::time::timeout(drain_budget, handle).await
        {
            return Err(FatalError::IngestAuth { source_id, reason });
        }
    }

    if let Ok(Ok(Err(crate::error::SentryError::DurableWriteFailed(reason)))) =
        tokio::time::timeout(drain_budget, correlator_handle).await
    {
        return Err(FatalError::DurableWriteFailed { reason });
    }
    eviction_handle.abort();
    api_handle.abort();
    drop(mirror_task);

    tracing::info!("shutdown complete");
    Ok(())
}

fn build_transport(source: &SourceConfig) -> Arc<dyn ChatTransport> {
    let credential = source
        .credential_env
        .as_ref()
        .and_then(|var| std::env::var(var).ok());
    Arc::new(WebSocketTransport::new(source.endpoint.clone(), credential))
}

async fn reconcile_mirror(log: &DurableLog, mirror: &dyn RemoteMirror) {
    let doc = log.snapshot().await;
    let local_ids: std::collections::HashSet<String> =
        doc.alerts.iter().map(|a| a.id.clone()).collect();
    let recovered = crate::log::mirror::reconcile(mirror, &local_ids).await;
    for record in recovered {
        tracing::info!(id = %record.id, "recovered record from remote mirror");
        if let Err(e) = log.append(record).await {
            tracing::error!(error = %e, "failed to persist record recovered from mirror");
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sig) = signal(SignalKind::terminate()) {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// The single linearizer task (spec.md §5): parses, updates token state,
/// evaluates tier rules, and hands survivors to the emitter in strict
/// per-message order. Nothing else mutates `state_store` or the log.
#[allow(clippy::too_many_arguments)]
async fn correlate_and_emit(
    mut parser_rx: mpsc::Receiver<RawMessage>,
    source_kinds: HashMap<String, SourceKind>,
    thresholds: crate::config::ThresholdsConfig,
    state_store: Arc<TokenStateStore>,
    correlator: Arc<Correlator>,
    emitter: Arc<Emitter>,
    parse_metrics: Arc<ParseMetrics>,
    metrics: Arc<Metrics>,
    mirror_task: Arc<MirrorTask>,
    log: Arc<DurableLog>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> crate::error::Result<()> {
    loop {
        let raw = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            msg = parser_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let now = chrono::Utc::now();
        if now - raw.received_at_wall > chrono::Duration::seconds(thresholds.ingest_latency_budget_secs) {
            metrics.record_ingest_latency_drop();
            continue;
        }

        let Some(kind) = source_kinds.get(&raw.source_id).copied() else {
            continue;
        };

        if kind == SourceKind::TrendingFeed {
            if let Some((symbol, callers, subs)) = parser::extract_echo(&raw.text) {
                match log.update_callers_subs(&symbol, None, callers, subs).await {
                    Ok(updated) if updated > 0 => {
                        tracing::info!(symbol, updated, "xtrack echo enrichment applied");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, symbol, "xtrack echo enrichment failed");
                    }
                }
            }
        }

        let Some(event) = parser::parse(&raw, kind, &thresholds) else {
            parse_metrics.record_miss(&raw.source_id);
            continue;
        };

        let Some(contract) = state_store.upsert(event, now, &thresholds).await else {
            continue;
        };

        let Some(candidate) = correlator.evaluate(&contract, now).await else {
            metrics.record_eligibility_rejected();
            continue;
        };

        match emitter.handle(candidate).await {
            Ok(Some(record)) => mirror_task.enqueue(record).await,
            Ok(None) => metrics.record_dedup_suppressed(),
            Err(e @ crate::error::SentryError::DurableWriteFailed(_)) => {
                metrics.record_durable_write_failure();
                tracing::error!(error = %e, "durable write failed after retries and emergency sidecar, exiting");
                return Err(e);
            }
            Err(e) => {
                metrics.record_durable_write_failure();
                tracing::error!(error = %e, "emitter failed to persist alert");
            }
        }
    }
    tracing::info!("correlator task stopped");
    Ok(())
}

async fn periodic_eviction(
    state_store: Arc<TokenStateStore>,
    thresholds: crate::config::ThresholdsConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                let evicted = state_store.evict_idle(chrono::Utc::now(), &thresholds).await;
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted idle token states");
                }
            }
        }
    }
}
