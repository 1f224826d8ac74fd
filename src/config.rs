use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SentryError};

/// Kind of upstream chat-room source, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    BuyFeed,
    SocialFeed,
    MomentumFeed,
    TrendingFeed,
    HotlistFeed,
}

/// One configured upstream source. Immutable after startup (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    #[serde(default = "default_trust_weight")]
    pub trust_weight: f64,
    pub endpoint: String,
    /// Name of an environment variable holding the credential for this source.
    #[serde(default)]
    pub credential_env: Option<String>,
}

fn default_trust_weight() -> f64 {
    1.0
}

/// Every numeric constant named in spec.md §4.4, surfaced through configuration
/// as spec.md §9's open question directs, defaulted to the spec's own values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub state_window_secs: i64,
    pub dedupe_window_secs: i64,
    pub hotlist_reconcile_window_secs: i64,

    pub min_liquidity_usd: f64,
    pub max_market_cap_usd: f64,

    pub tier1_hotlist_window_secs: i64,
    pub tier1_mc_min_usd: f64,
    pub tier1_mc_max_usd: f64,
    pub tier1_social_min_callers: u32,
    pub tier1_social_min_subs: u32,

    pub tier2_mc_min_usd: f64,
    pub tier2_mc_max_usd: f64,

    pub low_liquidity_penalty_threshold_usd: f64,
    pub large_buy_sol: f64,
    pub whale_buy_sol: f64,
    pub buy_size_boost_top_buy_sol: f64,
    pub buy_size_boost_last_buy_sol: f64,

    pub churn_penalty_lookback_hours: i64,
    pub churn_penalty_peak_multiple: f64,

    pub dynamic_tighten_alert_count: u32,
    pub dynamic_restore_alert_count: u32,
    pub dynamic_mc_tighten_usd: f64,
    pub dynamic_social_tighten_pct: f64,

    pub max_tracked_contracts: usize,
    pub max_events_per_token: usize,

    pub ingest_latency_budget_secs: i64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            state_window_secs: 30 * 60,
            dedupe_window_secs: 5 * 60,
            hotlist_reconcile_window_secs: 20 * 60,

            min_liquidity_usd: 10_000.0,
            max_market_cap_usd: 1_000_000.0,

            tier1_hotlist_window_secs: 20 * 60,
            tier1_mc_min_usd: 40_000.0,
            tier1_mc_max_usd: 100_000.0,
            tier1_social_min_callers: 20,
            tier1_social_min_subs: 100_000,

            tier2_mc_min_usd: 30_000.0,
            tier2_mc_max_usd: 120_000.0,

            low_liquidity_penalty_threshold_usd: 5_000.0,
            large_buy_sol: 5.0,
            whale_buy_sol: 20.0,
            buy_size_boost_top_buy_sol: 20.0,
            buy_size_boost_last_buy_sol: 5.0,

            churn_penalty_lookback_hours: 48,
            churn_penalty_peak_multiple: 4.0,

            dynamic_tighten_alert_count: 10,
            dynamic_restore_alert_count: 8,
            dynamic_mc_tighten_usd: 10_000.0,
            dynamic_social_tighten_pct: 0.25,

            max_tracked_contracts: 10_000,
            max_events_per_token: 256,

            ingest_latency_budget_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableLogConfig {
    pub path: String,
    pub backup_count: usize,
    pub emergency_sidecar_path: String,
    pub lock_path: String,
}

impl Default for DurableLogConfig {
    fn default() -> Self {
        Self {
            path: "./data/alerts.json".into(),
            backup_count: 5,
            emergency_sidecar_path: "./data/alerts.jsonl.emergency".into(),
            lock_path: "./data/alerts.json.lock".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteMirrorConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub credential_env: Option<String>,
    pub coalesce_window_ms: u64,
    pub max_coalesced: usize,
}

impl Default for RemoteMirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            credential_env: None,
            coalesce_window_ms: 2_000,
            max_coalesced: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteServiceConfig {
    pub enabled: bool,
    pub base_url: String,
    pub credential_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for QuoteServiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.dexscreener.com/latest/dex/tokens".into(),
            credential_env: None,
            timeout_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_port: u16,
    pub cache_ttl_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            cache_ttl_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub buffer_per_source: usize,
    pub parser_channel_capacity: usize,
    pub fanout_channel_capacity: usize,
    pub reconnect_backoff_min_secs: u64,
    pub reconnect_backoff_max_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            buffer_per_source: 1024,
            parser_channel_capacity: 4096,
            fanout_channel_capacity: 256,
            reconnect_backoff_min_secs: 2,
            reconnect_backoff_max_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub durable_log: DurableLogConfig,
    #[serde(default)]
    pub remote_mirror: RemoteMirrorConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub quote_service: QuoteServiceConfig,
}

impl Config {
    /// Loads configuration layered as defaults -> YAML file -> environment
    /// variables (prefix `SENTRY`, `__` nesting separator), per SPEC_FULL.md.
    pub fn load(path: &Path) -> Result<Self> {
        let defaults = Config::default();
        let defaults_json = serde_json::to_value(&defaults)
            .map_err(|e| SentryError::Config(format!("failed to serialize defaults: {e}")))?;

        let mut builder = config::Config::builder().add_source(config::File::from(
            config_file_source(&defaults_json),
        ));

        if path.exists() {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        } else {
            tracing::warn!(
                "config file {} not found, using built-in defaults",
                path.display()
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SENTRY")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder
            .build()
            .map_err(|e| SentryError::Config(format!("failed to build config: {e}")))?;

        let cfg: Config = raw
            .try_deserialize()
            .map_err(|e| SentryError::Config(format!("failed to parse config: {e}")))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.thresholds.tier1_mc_min_usd >= self.thresholds.tier1_mc_max_usd {
            return Err(SentryError::Config(
                "tier1_mc_min_usd must be < tier1_mc_max_usd".into(),
            ));
        }
        if self.thresholds.tier2_mc_min_usd >= self.thresholds.tier2_mc_max_usd {
            return Err(SentryError::Config(
                "tier2_mc_min_usd must be < tier2_mc_max_usd".into(),
            ));
        }
        if self.durable_log.path.is_empty() {
            return Err(SentryError::Config("durable_log.path must be set".into()));
        }
        for src in &self.sources {
            if src.source_id.is_empty() {
                return Err(SentryError::Config("source_id must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| format!("# failed to render config: {e}"))
    }
}

/// Wraps the serialized defaults as an in-memory config source so the
/// builder can layer file/env overrides on top of them uniformly.
fn config_file_source(value: &serde_json::Value) -> config::File<config::FileSourceString, config::FileFormat> {
    config::File::from_str(&value.to_string(), config::FileFormat::Json)
}
