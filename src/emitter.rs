//! Dedup & Alert Emitter (spec.md §4.5): the correlator calls this after a
//! candidate survives tier evaluation. Runs on the single linearizer task —
//! append-to-log must complete before fan-out begins (the ordering
//! guarantee in spec.md §4.5 and §5).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::ThresholdsConfig;
use crate::correlator::Correlator;
use crate::fanout::FanOut;
use crate::log::DurableLog;
use crate::model::{cohort_time_relative, AlertCandidate, AlertRecord};
use crate::state::TokenStateStore;

/// Live market-snapshot lookup used to populate `entry_mc_usd` at emission
/// time (spec.md §4.5 step 2). The core ships no concrete quote-service
/// transport; this is an injectable capability (SPEC_FULL.md [SUPPLEMENT]).
#[async_trait]
pub trait QuoteService: Send + Sync {
    async fn market_cap_usd(&self, contract: &str) -> Option<f64>;
}

/// Always misses — enrichment then falls back to the parsed market cap.
pub struct NoopQuoteService;

#[async_trait]
impl QuoteService for NoopQuoteService {
    async fn market_cap_usd(&self, _contract: &str) -> Option<f64> {
        None
    }
}

#[derive(serde::Deserialize)]
struct DexPair {
    fdv: Option<f64>,
    #[serde(rename = "marketCap")]
    market_cap: Option<f64>,
}

#[derive(serde::Deserialize)]
struct DexScreenerResponse {
    #[serde(default)]
    pairs: Vec<DexPair>,
}

/// Fetches a token's market cap from a DexScreener-shaped HTTP endpoint.
/// A miss (timeout, non-200, or empty `pairs`) degrades to `None` rather
/// than propagating, same as the pre-warm fetch it's modeled on: a quote
/// lookup is an enrichment, never load-bearing for emission.
pub struct HttpQuoteService {
    client: reqwest::Client,
    base_url: String,
    timeout: StdDuration,
}

impl HttpQuoteService {
    pub fn new(base_url: String, timeout: StdDuration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            timeout,
        }
    }
}

#[async_trait]
impl QuoteService for HttpQuoteService {
    async fn market_cap_usd(&self, contract: &str) -> Option<f64> {
        let url = format!("{}/{contract}", self.base_url);
        let resp = match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(contract, error = %e, "quote service request failed");
                return None;
            }
        };

        let parsed: DexScreenerResponse = match resp.json().await {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(contract, error = %e, "quote service response unparseable");
                return None;
            }
        };

        parsed.pairs.into_iter().find_map(|p| p.market_cap.or(p.fdv))
    }
}

pub struct Emitter {
    state_store: Arc<TokenStateStore>,
    correlator: Arc<Correlator>,
    log: Arc<DurableLog>,
    fanout: Arc<FanOut>,
    quotes: Box<dyn QuoteService>,
    thresholds: ThresholdsConfig,
    enrichment_timeout: StdDuration,
}

impl Emitter {
    pub fn new(
        state_store: Arc<TokenStateStore>,
        correlator: Arc<Correlator>,
        log: Arc<DurableLog>,
        fanout: Arc<FanOut>,
        quotes: Box<dyn QuoteService>,
        thresholds: ThresholdsConfig,
    ) -> Self {
        Self {
            state_store,
            correlator,
            log,
            fanout,
            quotes,
            thresholds,
            enrichment_timeout: StdDuration::from_secs(2),
        }
    }

    /// Processes one AlertCandidate: dedup, enrich, persist, fan out, then
    /// mark the token state as alerted. Returns the persisted record, or
    /// `None` if suppressed by dedup.
    pub async fn handle(&self, candidate: AlertCandidate) -> crate::error::Result<Option<AlertRecord>> {
        let now = Utc::now();

        if let Some(snap) = self.state_store.snapshot(&candidate.contract_address).await {
            if let (Some(prev_tier), Some(prev_at)) = (snap.alerted_tier, snap.last_alert_at) {
                let within_dedupe_window =
                    now - prev_at <= chrono::Duration::seconds(self.dedupe_window_secs());
                let is_upgrade = candidate.tier.is_stronger_than(prev_tier);
                if within_dedupe_window && !is_upgrade {
                    tracing::debug!(
                        contract = %candidate.contract_address,
                        tier = candidate.tier.as_u8(),
                        "dedup suppressed"
                    );
                    return Ok(None);
                }
            }
        }

        let (entry_mc_usd, stale_mc) = self.enrich(&candidate).await;

        let today = now.format("%Y-%m-%d");
        let id = format!("{}_{today}", candidate.contract_address[..8.min(candidate.contract_address.len())].to_uppercase());

        let mut tags = candidate.tags.clone();
        if stale_mc && !tags.contains(&"stale_mc".to_string()) {
            tags.push("stale_mc".to_string());
        }

        let record = AlertRecord {
            id,
            token: candidate.symbol.clone(),
            tier: candidate.tier.as_u8(),
            level: candidate.tier.level().to_string(),
            timestamp: now,
            contract: candidate.contract_address.clone(),
            entry_mc_usd,
            hotlist: if candidate.hotlist { "Yes".to_string() } else { "No".to_string() },
            description: describe(&candidate),
            matched_signals: candidate.matched_signals.clone(),
            tags,
            liquidity: candidate.liquidity_usd,
            callers: candidate.callers,
            subs: candidate.subs,
            confirmation_count: candidate.confirmation_count,
            cohort_time: cohort_time_relative(candidate.cohort_start_at, now),
        };

        let persisted = self.log.append(record).await?;

        self.fanout.deliver(persisted.clone()).await;

        self.state_store
            .mark_alerted(&candidate.contract_address, candidate.tier, now)
            .await;
        self.correlator.record_emitted(&candidate.symbol, candidate.tier, now);

        Ok(Some(persisted))
    }

    fn dedupe_window_secs(&self) -> i64 {
        self.thresholds.dedupe_window_secs
    }

    async fn enrich(&self, candidate: &AlertCandidate) -> (Option<f64>, bool) {
        for _ in 0..2 {
            let fetch = self.quotes.market_cap_usd(&candidate.contract_address);
            if let Ok(Some(mc)) = tokio::time::timeout(self.enrichment_timeout, fetch).await {
                return (Some(mc), false);
            }
        }
        if candidate.market_cap_usd.is_some() {
            (candidate.market_cap_usd, true)
        } else {
            (None, true)
        }
    }
}

fn describe(candidate: &AlertCandidate) -> String {
    match candidate.description_theme {
        "hotlist" => format!("{} is trending on the hotlist with confirmed momentum", candidate.symbol),
        "momentum" => format!("{} is showing a sharp momentum spike", candidate.symbol),
        "smart_money" => format!("{} attracted a large buy from a high-conviction wallet", candidate.symbol),
        _ => format!("{} is gaining early traction", candidate.symbol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::NoopOutcomesFeed;
    use crate::fanout::{FanOut, SubscriberRegistry};
    use crate::model::Tier;

    async fn build_emitter() -> (Emitter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state_store = Arc::new(TokenStateStore::new());
        let correlator = Arc::new(Correlator::new(
            state_store.clone(),
            crate::config::ThresholdsConfig::default(),
            Box::new(NoopOutcomesFeed),
        ));
        let log = Arc::new(
            DurableLog::open(
                dir.path().join("alerts.json"),
                5,
                dir.path().join("alerts.jsonl.emergency"),
                dir.path().join("alerts.json.lock"),
            )
            .await
            .unwrap(),
        );
        let fanout = Arc::new(FanOut::new(Arc::new(SubscriberRegistry::new()), None));
        let emitter = Emitter::new(
            state_store,
            correlator,
            log,
            fanout,
            Box::new(NoopQuoteService),
            crate::config::ThresholdsConfig::default(),
        );
        (emitter, dir)
    }

    fn candidate(contract: &str, tier: Tier) -> AlertCandidate {
        AlertCandidate {
            contract_address: contract.into(),
            symbol: "FOO".into(),
            tier,
            reasons: vec!["whale_buy".into()],
            description_theme: "smart_money",
            observed_at: Utc::now(),
            market_cap_usd: Some(60_000.0),
            liquidity_usd: Some(20_000.0),
            callers: None,
            subs: None,
            matched_signals: vec!["whale_buy".into()],
            tags: vec!["whale_buy".into()],
            hotlist: false,
            confirmation_count: 1,
            cohort_start_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn first_alert_is_persisted() {
        let (emitter, _dir) = build_emitter().await;
        let contract = "AAAA1111AAAA1111AAAA1111AAAA1111AAAA";
        emitter.state_store.upsert(
            crate::model::ParsedEvent {
                source_id: "s".into(),
                source_kind: crate::config::SourceKind::BuyFeed,
                observed_at: Utc::now(),
                wall_clock: Utc::now(),
                contract_address: contract.into(),
                symbol: "FOO".into(),
                market_cap_usd: Some(60_000.0),
                liquidity_usd: Some(20_000.0),
                buy_sol: Some(25.0),
                holders: None,
                callers: None,
                subs: None,
                hotlist_rank: None,
                signal_tags: Default::default(),
            },
            Utc::now(),
            &crate::config::ThresholdsConfig::default(),
        ).await;

        let result = emitter.handle(candidate(contract, Tier::Two)).await.unwrap();
        assert!(result.is_some());
        assert_eq!(emitter.log.snapshot().await.alerts.len(), 1);
    }

    #[tokio::test]
    async fn dedup_suppresses_equal_tier_within_window() {
        let (emitter, _dir) = build_emitter().await;
        let contract = "BBBB2222BBBB2222BBBB2222BBBB2222BBBB";
        emitter.state_store.upsert(
            crate::model::ParsedEvent {
                source_id: "s".into(),
                source_kind: crate::config::SourceKind::BuyFeed,
                observed_at: Utc::now(),
                wall_clock: Utc::now(),
                contract_address: contract.into(),
                symbol: "BAR".into(),
                market_cap_usd: Some(60_000.0),
                liquidity_usd: Some(20_000.0),
                buy_sol: Some(25.0),
                holders: None,
                callers: None,
                subs: None,
                hotlist_rank: None,
                signal_tags: Default::default(),
            },
            Utc::now(),
            &crate::config::ThresholdsConfig::default(),
        ).await;

        emitter.handle(candidate(contract, Tier::Two)).await.unwrap();
        let second = emitter.handle(candidate(contract, Tier::Two)).await.unwrap();
        assert!(second.is_none(), "equal tier within dedup window must be suppressed");
    }

    #[tokio::test]
    async fn upgrade_always_emits() {
        let (emitter, _dir) = build_emitter().await;
        let contract = "CCCC3333CCCC3333CCCC3333CCCC3333CCCC";
        emitter.state_store.upsert(
            crate::model::ParsedEvent {
                source_id: "s".into(),
                source_kind: crate::config::SourceKind::BuyFeed,
                observed_at: Utc::now(),
                wall_clock: Utc::now(),
                contract_address: contract.into(),
                symbol: "BAZ".into(),
                market_cap_usd: Some(60_000.0),
                liquidity_usd: Some(20_000.0),
                buy_sol: Some(25.0),
                holders: None,
                callers: None,
                subs: None,
                hotlist_rank: None,
                signal_tags: Default::default(),
            },
            Utc::now(),
            &crate::config::ThresholdsConfig::default(),
        ).await;

        emitter.handle(candidate(contract, Tier::Two)).await.unwrap();
        let upgraded = emitter.handle(candidate(contract, Tier::One)).await.unwrap();
        assert!(upgraded.is_some(), "strictly stronger tier must emit");
    }
}
