use thiserror::Error;

/// Errors that are allowed to propagate out of a component boundary.
///
/// Per the propagation policy: ingest and the parser never produce one of
/// these (transport hiccups and parse misses are counters, not errors);
/// the correlator only ever surfaces `DurableWriteFailed`, and only once
/// the emergency sidecar write has also failed; fan-out never propagates.
#[derive(Debug, Error)]
pub enum SentryError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("durable log write failed after all retries and emergency sidecar: {0}")]
    DurableWriteFailed(String),

    #[error("ingest authentication failed for source {source_id}: {reason}")]
    IngestAuthFailed { source_id: String, reason: String },

    #[error("durable log is corrupt: {0}")]
    LogCorrupt(String),
}

pub type Result<T> = std::result::Result<T, SentryError>;
