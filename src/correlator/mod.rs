//! Correlator & Tier Scorer (spec.md §4.4): evaluated after every state
//! upsert for the affected contract, on the single linearizer task. Applies
//! eligibility gates, cohort detection, the tier ladder, dynamic threshold
//! adjustment and the three scoring penalties/boosts.

mod tiers;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::ThresholdsConfig;
use crate::model::{AlertCandidate, SignalTag, Tier, TokenState};
use crate::state::TokenStateStore;

/// Peak-multiple data for a symbol's prior alerts, consumed by the churn
/// penalty (spec.md §4.4). The core ships no concrete transport for this —
/// it is a capability injected at wiring time (SPEC_FULL.md [SUPPLEMENT]).
#[async_trait]
pub trait OutcomesFeed: Send + Sync {
    /// The highest multiple-of-entry-price reached since `since`, if the
    /// feed has an opinion. `None` means "no data", which spec.md §4.4
    /// states must never apply a penalty.
    async fn peak_multiple(&self, symbol: &str, since: DateTime<Utc>) -> Option<f64>;
}

/// Default feed: always returns `None`, so the churn penalty never fires
/// unless a real outcomes source is wired in.
pub struct NoopOutcomesFeed;

#[async_trait]
impl OutcomesFeed for NoopOutcomesFeed {
    async fn peak_multiple(&self, _symbol: &str, _since: DateTime<Utc>) -> Option<f64> {
        None
    }
}

/// Tracks the rolling count of Tier-1 alerts in the last 24h and applies the
/// tighten/restore hysteresis from spec.md §4.4.
struct DynamicThresholds {
    tier1_alert_times: VecDeque<DateTime<Utc>>,
    tightened: bool,
}

impl DynamicThresholds {
    fn new() -> Self {
        Self {
            tier1_alert_times: VecDeque::new(),
            tightened: false,
        }
    }

    fn record_tier1_alert(&mut self, at: DateTime<Utc>) {
        self.tier1_alert_times.push_back(at);
    }

    fn effective(&mut self, now: DateTime<Utc>, thresholds: &ThresholdsConfig) -> (f64, bool) {
        let day_ago = now - Duration::hours(24);
        while self.tier1_alert_times.front().is_some_and(|t| *t < day_ago) {
            self.tier1_alert_times.pop_front();
        }
        let count = self.tier1_alert_times.len() as u32;
        if count > thresholds.dynamic_tighten_alert_count {
            self.tightened = true;
        } else if count < thresholds.dynamic_restore_alert_count {
            self.tightened = false;
        }
        let mc_max = if self.tightened {
            thresholds.tier1_mc_max_usd + thresholds.dynamic_mc_tighten_usd
        } else {
            thresholds.tier1_mc_max_usd
        };
        (mc_max, self.tightened)
    }
}

/// A symbol's most recent alert time, used by the churn penalty to decide
/// whether "the same symbol was alerted in the prior 48h" (spec.md §4.4).
struct RecentAlerts {
    by_symbol: HashMap<String, DateTime<Utc>>,
}

impl RecentAlerts {
    fn new() -> Self {
        Self {
            by_symbol: HashMap::new(),
        }
    }

    fn record(&mut self, symbol: &str, at: DateTime<Utc>) {
        self.by_symbol.insert(symbol.to_uppercase(), at);
    }

    fn alerted_within(&self, symbol: &str, now: DateTime<Utc>, lookback: Duration) -> bool {
        self.by_symbol
            .get(&symbol.to_uppercase())
            .is_some_and(|t| now - *t <= lookback)
    }
}

pub struct Correlator {
    state_store: std::sync::Arc<TokenStateStore>,
    thresholds: ThresholdsConfig,
    outcomes: Box<dyn OutcomesFeed>,
    dynamic: Mutex<DynamicThresholds>,
    recent_alerts: Mutex<RecentAlerts>,
}

impl Correlator {
    pub fn new(
        state_store: std::sync::Arc<TokenStateStore>,
        thresholds: ThresholdsConfig,
        outcomes: Box<dyn OutcomesFeed>,
    ) -> Self {
        Self {
            state_store,
            thresholds,
            outcomes,
            dynamic: Mutex::new(DynamicThresholds::new()),
            recent_alerts: Mutex::new(RecentAlerts::new()),
        }
    }

    /// Called by the emitter once a candidate from this evaluation is
    /// actually accepted (survives dedup) — feeds the dynamic-threshold
    /// counter and the churn-penalty lookback.
    pub fn record_emitted(&self, symbol: &str, tier: Tier, now: DateTime<Utc>) {
        self.recent_alerts.lock().unwrap().record(symbol, now);
        if tier == Tier::One {
            self.dynamic.lock().unwrap().record_tier1_alert(now);
        }
    }

    fn eligible(&self, state: &TokenState) -> bool {
        if crate::model::is_hotlist_sentinel(&state.contract_address) {
            return false;
        }
        if state
            .latest_liquidity_usd
            .is_some_and(|l| l < self.thresholds.min_liquidity_usd)
        {
            return false;
        }
        if state
            .latest_market_cap_usd
            .is_some_and(|mc| mc > self.thresholds.max_market_cap_usd)
        {
            return false;
        }
        if state
            .source_kinds_seen
            .iter()
            .all(|k| *k == crate::config::SourceKind::SocialFeed)
        {
            return false;
        }
        true
    }

    fn top_buy_sol(state: &TokenState) -> Option<f64> {
        state.event_ring.iter().filter_map(|e| e.buy_sol).fold(None, |acc, v| {
            Some(acc.map_or(v, |a: f64| a.max(v)))
        })
    }

    fn last_buy_sol(state: &TokenState) -> Option<f64> {
        state.event_ring.iter().rev().find_map(|e| e.buy_sol)
    }

    fn demote(tier: Tier) -> Option<Tier> {
        match tier {
            Tier::One => Some(Tier::Two),
            Tier::Two => Some(Tier::Three),
            Tier::Three => None,
        }
    }

    fn description_theme(state: &TokenState) -> &'static str {
        let hotlist_present =
            state.tags_union.contains(&SignalTag::Top5Hotlist) || state.tags_union.contains(&SignalTag::LateHotlist);
        if hotlist_present {
            "hotlist"
        } else if state.tags_union.contains(&SignalTag::MomentumSpike) {
            "momentum"
        } else if state.tags_union.contains(&SignalTag::WhaleBuy) || state.tags_union.contains(&SignalTag::LargeBuy) {
            "smart_money"
        } else {
            "early_trending"
        }
    }

    /// Evaluates the contract's current state and returns an `AlertCandidate`
    /// if a tier rule fires after gates, dynamic thresholding, and scoring
    /// penalties/boosts are applied. At most one candidate per call.
    pub async fn evaluate(&self, contract: &str, now: DateTime<Utc>) -> Option<AlertCandidate> {
        let state = self.state_store.snapshot(contract).await?;
        if !self.eligible(&state) {
            return None;
        }

        let (effective_tier1_mc_max, social_tighten) = {
            let mut dyn_thresholds = self.dynamic.lock().unwrap();
            dyn_thresholds.effective(now, &self.thresholds)
        };

        let outcome = tiers::evaluate(
            &state,
            now,
            &self.thresholds,
            effective_tier1_mc_max,
            social_tighten,
        )?;

        let mut tier = outcome.tier;
        let mut tags = outcome.reasons.clone();

        if state
            .latest_liquidity_usd
            .is_some_and(|l| l < self.thresholds.low_liquidity_penalty_threshold_usd)
        {
            tier = match Self::demote(tier) {
                Some(t) => t,
                None => return None,
            };
        }

        let lookback = Duration::hours(self.thresholds.churn_penalty_lookback_hours);
        let previously_alerted = self
            .recent_alerts
            .lock()
            .unwrap()
            .alerted_within(&state.symbol, now, lookback);
        if previously_alerted {
            if let Some(peak) = self.outcomes.peak_multiple(&state.symbol, now - lookback).await {
                if peak < self.thresholds.churn_penalty_peak_multiple {
                    tier = match Self::demote(tier) {
                        Some(t) => t,
                        None => return None,
                    };
                }
            }
        }

        let top_buy = Self::top_buy_sol(&state);
        let last_buy = Self::last_buy_sol(&state);
        let boost_eligible = top_buy.is_some_and(|v| v >= self.thresholds.buy_size_boost_top_buy_sol)
            || last_buy.is_some_and(|v| v >= self.thresholds.buy_size_boost_last_buy_sol);
        if tier == Tier::Three && boost_eligible {
            tier = Tier::Two;
            tags.push("buy_size_boost".to_string());
        }

        let hotlist = state.tags_union.contains(&SignalTag::Top5Hotlist)
            || state.tags_union.contains(&SignalTag::LateHotlist);
        let confirmation_count = state
            .tags_union
            .iter()
            .filter(|t| t.is_non_hotlist_confirmation())
            .count() as u32;

        Some(AlertCandidate {
            contract_address: state.contract_address.clone(),
            symbol: state.symbol.clone(),
            tier,
            reasons: outcome.reasons,
            description_theme: Self::description_theme(&state),
            observed_at: now,
            market_cap_usd: state.latest_market_cap_usd,
            liquidity_usd: state.latest_liquidity_usd,
            callers: state.latest_callers,
            subs: state.latest_subs,
            matched_signals: tags,
            tags: state.tags_union.iter().map(|t| t.as_str().to_string()).collect(),
            hotlist,
            confirmation_count,
            cohort_start_at: state.cohort_start_at.unwrap_or(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use crate::model::ParsedEvent;
    use std::collections::HashSet as StdHashSet;
    use std::sync::Arc;

    fn event(contract: &str, symbol: &str, kind: SourceKind, at: DateTime<Utc>, tags: &[SignalTag]) -> ParsedEvent {
        ParsedEvent {
            source_id: "s1".into(),
            source_kind: kind,
            observed_at: at,
            wall_clock: at,
            contract_address: contract.into(),
            symbol: symbol.into(),
            market_cap_usd: Some(60_000.0),
            liquidity_usd: Some(20_000.0),
            buy_sol: Some(25.0),
            holders: None,
            callers: None,
            subs: None,
            hotlist_rank: None,
            signal_tags: tags.iter().copied().collect::<StdHashSet<_>>(),
        }
    }

    #[tokio::test]
    async fn s1_tier1_end_to_end() {
        let store = Arc::new(TokenStateStore::new());
        let thresholds = ThresholdsConfig::default();
        let correlator = Correlator::new(store.clone(), thresholds.clone(), Box::new(NoopOutcomesFeed));
        let t0 = Utc::now();
        let contract = "AAAA1111AAAA1111AAAA1111AAAA1111AAAA";

        store
            .upsert(
                event(contract, "FOO", SourceKind::MomentumFeed, t0, &[SignalTag::CohortConfirmation]),
                t0,
                &thresholds,
            )
            .await;

        let mut hotlist_ev = event("HOTLIST:FOO", "FOO", SourceKind::HotlistFeed, t0 + Duration::seconds(30), &[]);
        hotlist_ev.signal_tags.insert(SignalTag::Top5Hotlist);
        store.upsert(hotlist_ev, t0 + Duration::seconds(30), &thresholds).await;

        store
            .upsert(
                event(
                    contract,
                    "FOO",
                    SourceKind::BuyFeed,
                    t0 + Duration::seconds(60),
                    &[SignalTag::WhaleBuy],
                ),
                t0 + Duration::seconds(60),
                &thresholds,
            )
            .await;

        let candidate = correlator.evaluate(contract, t0 + Duration::seconds(60)).await.unwrap();
        assert_eq!(candidate.tier, Tier::One);
        assert!(candidate.hotlist);
        assert!(candidate.matched_signals.iter().any(|s| s == "whale_buy"));
    }

    #[tokio::test]
    async fn s5_social_only_is_ineligible() {
        let store = Arc::new(TokenStateStore::new());
        let thresholds = ThresholdsConfig::default();
        let correlator = Correlator::new(store.clone(), thresholds.clone(), Box::new(NoopOutcomesFeed));
        let t0 = Utc::now();
        let contract = "CCCC3333CCCC3333CCCC3333CCCC3333CCCC";

        store
            .upsert(
                event(contract, "BAZ", SourceKind::SocialFeed, t0, &[SignalTag::CohortConfirmation]),
                t0,
                &thresholds,
            )
            .await;
        store
            .upsert(
                event(contract, "BAZ", SourceKind::SocialFeed, t0 + Duration::minutes(1), &[]),
                t0 + Duration::minutes(1),
                &thresholds,
            )
            .await;

        assert!(correlator.evaluate(contract, t0 + Duration::minutes(1)).await.is_none());
    }

    struct StubOutcomesFeed(f64);

    #[async_trait::async_trait]
    impl OutcomesFeed for StubOutcomesFeed {
        async fn peak_multiple(&self, _symbol: &str, _since: DateTime<Utc>) -> Option<f64> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn churn_penalty_demotes_previously_alerted_symbol() {
        let store = Arc::new(TokenStateStore::new());
        let thresholds = ThresholdsConfig::default();
        let correlator = Correlator::new(store.clone(), thresholds.clone(), Box::new(StubOutcomesFeed(1.5)));
        let t0 = Utc::now();
        let contract = "DDDD4444DDDD4444DDDD4444DDDD4444DDDD";

        let ev = event(
            contract,
            "QUX",
            SourceKind::MomentumFeed,
            t0,
            &[SignalTag::CohortConfirmation, SignalTag::WhaleBuy],
        );
        store.upsert(ev, t0, &thresholds).await;
        let mut hotlist_ev = event("HOTLIST:QUX", "QUX", SourceKind::HotlistFeed, t0, &[]);
        hotlist_ev.signal_tags.insert(SignalTag::Top5Hotlist);
        store.upsert(hotlist_ev, t0, &thresholds).await;

        correlator.record_emitted("QUX", Tier::One, t0 - Duration::hours(1));

        let candidate = correlator.evaluate(contract, t0).await.unwrap();
        assert_eq!(candidate.tier, Tier::Two, "tier 1 demoted to 2 by churn penalty (peak 1.5x < 4x)");
    }
}
