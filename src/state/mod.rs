//! Per-contract token state store (spec.md §4.3). Single-writer discipline:
//! only the correlator task calls `upsert`/`mark_alerted`; the read side
//! only ever sees immutable `snapshot` clones.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::config::ThresholdsConfig;
use crate::model::{hotlist_symbol, is_hotlist_sentinel, ParsedEvent, SignalTag, Tier, TokenState};

pub struct TokenStateStore {
    states: RwLock<HashMap<String, TokenState>>,
}

impl TokenStateStore {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Applies one parsed event to the store. Returns the canonical contract
    /// address that should be handed to the correlator for rule evaluation —
    /// `None` when the event was a hotlist sentinel that found no matching
    /// real-contract state (nothing eligible to evaluate yet, per the gate
    /// that excludes sentinel-only states in spec.md §4.4).
    pub async fn upsert(
        &self,
        event: ParsedEvent,
        now: DateTime<Utc>,
        thresholds: &ThresholdsConfig,
    ) -> Option<String> {
        let window = Duration::seconds(thresholds.state_window_secs);
        let reconcile_window = Duration::seconds(thresholds.hotlist_reconcile_window_secs);

        if is_hotlist_sentinel(&event.contract_address) {
            self.upsert_hotlist(event, now, window, reconcile_window).await;
            return None;
        }

        let contract = event.contract_address.clone();
        let mut states = self.states.write().await;
        self.apply_real_event(&mut states, event, now, window, thresholds.max_events_per_token);
        self.reconcile_against_orphans(&mut states, &contract, reconcile_window);
        Some(contract)
    }

    fn apply_real_event(
        &self,
        states: &mut HashMap<String, TokenState>,
        event: ParsedEvent,
        now: DateTime<Utc>,
        window: Duration,
        max_events: usize,
    ) {
        let contract = event.contract_address.clone();
        let symbol = event.symbol.clone();
        let state = states
            .entry(contract.clone())
            .or_insert_with(|| TokenState::new(contract.clone(), symbol, now));

        state.sources_seen.insert(event.source_id.clone());
        state.source_kinds_seen.insert(event.source_kind);
        state.tags_union.extend(event.signal_tags.iter().copied());

        if event.signal_tags.contains(&SignalTag::CohortConfirmation) && state.cohort_start_at.is_none() {
            state.cohort_start_at = Some(event.observed_at);
        }
        if let Some(mc) = event.market_cap_usd {
            state.latest_market_cap_usd = Some(mc);
        }
        if let Some(liq) = event.liquidity_usd {
            state.latest_liquidity_usd = Some(liq);
        }
        if let Some(c) = event.callers {
            state.latest_callers = Some(c);
        }
        if let Some(s) = event.subs {
            state.latest_subs = Some(s);
        }

        state.event_ring.push_back(event);
        state.last_updated_at = now;

        // Trim to the state window and the hard size cap.
        while let Some(front) = state.event_ring.front() {
            if now - front.observed_at > window {
                state.event_ring.pop_front();
            } else {
                break;
            }
        }
        while state.event_ring.len() > max_events {
            state.event_ring.pop_front();
        }

        rederive_metrics(state);
    }

    /// Records a hotlist sentinel observation. If a matching real-contract
    /// state already exists, tags it `top5_hotlist` when the mention falls
    /// within ±`reconcile_window` of its first_seen_at (regardless of
    /// visible rank), or `late_hotlist` when it falls outside that window
    /// and carries a confirmed rank. An unranked mention outside the window
    /// asserts nothing — it stays conservatively untagged. Otherwise keeps
    /// the sentinel as its own orphan entry so a later real-contract event
    /// can reconcile against it.
    async fn upsert_hotlist(
        &self,
        event: ParsedEvent,
        now: DateTime<Utc>,
        window: Duration,
        reconcile_window: Duration,
    ) {
        let symbol = event.symbol.clone();
        let rank_confirmed = event.hotlist_rank.is_some();
        let mut states = self.states.write().await;

        let matched_real = states
            .values_mut()
            .find(|s| !is_hotlist_sentinel(&s.contract_address) && s.symbol == symbol);

        if let Some(real) = matched_real {
            let within_window = (event.observed_at - real.first_seen_at).abs() <= reconcile_window;
            if within_window {
                real.tags_union.insert(SignalTag::Top5Hotlist);
            } else if rank_confirmed {
                real.tags_union.insert(SignalTag::LateHotlist);
            }
            return;
        }

        let sentinel_key = event.contract_address.clone();
        let sentinel = states
            .entry(sentinel_key.clone())
            .or_insert_with(|| TokenState::new(sentinel_key, symbol, now));
        sentinel.tags_union.extend(event.signal_tags.iter().copied());
        sentinel.event_ring.push_back(event);
        sentinel.last_updated_at = now;

        while let Some(front) = sentinel.event_ring.front() {
            if now - front.observed_at > window {
                sentinel.event_ring.pop_front();
            } else {
                break;
            }
        }
    }

    /// After a real-contract event lands, checks whether an orphan hotlist
    /// sentinel for the same symbol is waiting, and applies the same
    /// window/rank test as `upsert_hotlist`: any sentinel event within
    /// ±`reconcile_window` of `first_seen_at` wins `top5_hotlist` outright;
    /// failing that, any ranked sentinel event outside the window wins
    /// `late_hotlist`.
    fn reconcile_against_orphans(
        &self,
        states: &mut HashMap<String, TokenState>,
        contract: &str,
        reconcile_window: Duration,
    ) {
        let Some((symbol, first_seen_at)) = states
            .get(contract)
            .map(|s| (s.symbol.clone(), s.first_seen_at))
        else {
            return;
        };

        let mut merge_tag = None;
        for sentinel in states.values() {
            if hotlist_symbol(&sentinel.contract_address) != Some(symbol.as_str()) {
                continue;
            }
            for ev in &sentinel.event_ring {
                if (ev.observed_at - first_seen_at).abs() <= reconcile_window {
                    merge_tag = Some(SignalTag::Top5Hotlist);
                    break;
                } else if ev.hotlist_rank.is_some() && merge_tag.is_none() {
                    merge_tag = Some(SignalTag::LateHotlist);
                }
            }
            if merge_tag == Some(SignalTag::Top5Hotlist) {
                break;
            }
        }

        if let Some(tag) = merge_tag {
            if let Some(real) = states.get_mut(contract) {
                real.tags_union.insert(tag);
            }
        }
    }

    /// Immutable view handed to the scorer.
    pub async fn snapshot(&self, contract: &str) -> Option<TokenState> {
        self.states.read().await.get(contract).cloned()
    }

    /// Records that tier `t` has fired for `contract`; upgrades only
    /// (spec.md §4.3: `alerted_tier := max(alerted_tier, t)` where stronger
    /// tiers rank higher).
    pub async fn mark_alerted(&self, contract: &str, tier: Tier, now: DateTime<Utc>) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(contract) {
            let upgraded = match state.alerted_tier {
                None => true,
                Some(existing) => tier.is_stronger_than(existing),
            };
            if upgraded {
                state.alerted_tier = Some(tier);
            }
            state.last_alert_at = Some(now);
        }
    }

    /// Periodic housekeeping: evicts contracts idle beyond the state window
    /// once the tracked-contract count exceeds the configured cap.
    pub async fn evict_idle(&self, now: DateTime<Utc>, thresholds: &ThresholdsConfig) -> usize {
        let window = Duration::seconds(thresholds.state_window_secs);
        let mut states = self.states.write().await;
        if states.len() <= thresholds.max_tracked_contracts {
            return 0;
        }
        let before = states.len();
        states.retain(|_, s| now - s.last_updated_at <= window);
        before - states.len()
    }

    pub async fn tracked_count(&self) -> usize {
        self.states.read().await.len()
    }
}

impl Default for TokenStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn rederive_metrics(state: &mut TokenState) {
    let mut buy_sources = std::collections::HashSet::new();
    let mut total_buy_sol = 0.0;
    let mut buy_timestamps: Vec<DateTime<Utc>> = Vec::new();

    for ev in &state.event_ring {
        if let Some(sol) = ev.buy_sol {
            total_buy_sol += sol;
            buy_sources.insert(ev.source_id.clone());
            buy_timestamps.push(ev.observed_at);
        }
    }
    buy_timestamps.sort();

    state.total_buy_sol = total_buy_sol;
    state.distinct_buy_sources = buy_sources.len();
    state.first_to_second_buy_gap = if buy_timestamps.len() >= 2 {
        Some(buy_timestamps[1] - buy_timestamps[0])
    } else {
        None
    };
    state.time_spread = match (state.event_ring.front(), state.event_ring.back()) {
        (Some(first), Some(last)) => last.observed_at - first.observed_at,
        _ => Duration::zero(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use std::collections::HashSet;

    fn event(contract: &str, symbol: &str, kind: SourceKind, at: DateTime<Utc>) -> ParsedEvent {
        ParsedEvent {
            source_id: "s1".into(),
            source_kind: kind,
            observed_at: at,
            wall_clock: at,
            contract_address: contract.into(),
            symbol: symbol.into(),
            market_cap_usd: Some(50_000.0),
            liquidity_usd: Some(15_000.0),
            buy_sol: Some(10.0),
            holders: None,
            callers: None,
            subs: None,
            hotlist_rank: None,
            signal_tags: HashSet::new(),
        }
    }

    #[tokio::test]
    async fn upsert_real_event_returns_contract() {
        let store = TokenStateStore::new();
        let now = Utc::now();
        let result = store
            .upsert(
                event("AAAA1111AAAA1111AAAA1111AAAA1111AAAA", "FOO", SourceKind::BuyFeed, now),
                now,
                &ThresholdsConfig::default(),
            )
            .await;
        assert_eq!(result, Some("AAAA1111AAAA1111AAAA1111AAAA1111AAAA".to_string()));
        let snap = store.snapshot("AAAA1111AAAA1111AAAA1111AAAA1111AAAA").await.unwrap();
        assert_eq!(snap.symbol, "FOO");
        assert_eq!(snap.total_buy_sol, 10.0);
    }

    #[tokio::test]
    async fn hotlist_reconciles_onto_existing_real_state() {
        let store = TokenStateStore::new();
        let now = Utc::now();
        let contract = "BBBB2222BBBB2222BBBB2222BBBB2222BBBB";
        store
            .upsert(event(contract, "BAR", SourceKind::MomentumFeed, now), now, &ThresholdsConfig::default())
            .await;

        let mut hotlist_ev = event("HOTLIST:BAR", "BAR", SourceKind::HotlistFeed, now + Duration::minutes(5));
        hotlist_ev.signal_tags.insert(SignalTag::Top5Hotlist);
        store.upsert(hotlist_ev, now + Duration::minutes(5), &ThresholdsConfig::default()).await;

        let snap = store.snapshot(contract).await.unwrap();
        assert!(snap.tags_union.contains(&SignalTag::Top5Hotlist));
    }

    #[tokio::test]
    async fn unranked_hotlist_mention_within_window_still_counts_as_top5() {
        let store = TokenStateStore::new();
        let now = Utc::now();
        let contract = "EEEE5555EEEE5555EEEE5555EEEE5555EEEE";
        store
            .upsert(event(contract, "QUX", SourceKind::MomentumFeed, now), now, &ThresholdsConfig::default())
            .await;

        // No visible rank (hotlist_rank: None), but only 1 minute after
        // first_seen_at — well inside the ±20 min reconcile window.
        let hotlist_ev = event("HOTLIST:QUX", "QUX", SourceKind::HotlistFeed, now + Duration::minutes(1));
        store.upsert(hotlist_ev, now + Duration::minutes(1), &ThresholdsConfig::default()).await;

        let snap = store.snapshot(contract).await.unwrap();
        assert!(snap.tags_union.contains(&SignalTag::Top5Hotlist));
        assert!(!snap.tags_union.contains(&SignalTag::LateHotlist));
    }

    #[tokio::test]
    async fn ranked_hotlist_mention_outside_window_is_late_not_top5() {
        let store = TokenStateStore::new();
        let now = Utc::now();
        let contract = "FFFF6666FFFF6666FFFF6666FFFF6666FFFF";
        store
            .upsert(event(contract, "ZAP", SourceKind::MomentumFeed, now), now, &ThresholdsConfig::default())
            .await;

        let mut hotlist_ev = event("HOTLIST:ZAP", "ZAP", SourceKind::HotlistFeed, now + Duration::minutes(25));
        hotlist_ev.hotlist_rank = Some(3);
        store.upsert(hotlist_ev, now + Duration::minutes(25), &ThresholdsConfig::default()).await;

        let snap = store.snapshot(contract).await.unwrap();
        assert!(snap.tags_union.contains(&SignalTag::LateHotlist));
        assert!(!snap.tags_union.contains(&SignalTag::Top5Hotlist));
    }

    #[tokio::test]
    async fn unranked_hotlist_mention_outside_window_asserts_nothing() {
        let store = TokenStateStore::new();
        let now = Utc::now();
        let contract = "GGGG7777GGGG7777GGGG7777GGGG7777GGGG";
        store
            .upsert(event(contract, "YOO", SourceKind::MomentumFeed, now), now, &ThresholdsConfig::default())
            .await;

        let hotlist_ev = event("HOTLIST:YOO", "YOO", SourceKind::HotlistFeed, now + Duration::minutes(25));
        store.upsert(hotlist_ev, now + Duration::minutes(25), &ThresholdsConfig::default()).await;

        let snap = store.snapshot(contract).await.unwrap();
        assert!(!snap.tags_union.contains(&SignalTag::Top5Hotlist));
        assert!(!snap.tags_union.contains(&SignalTag::LateHotlist));
    }

    #[tokio::test]
    async fn mark_alerted_upgrades_only() {
        let store = TokenStateStore::new();
        let now = Utc::now();
        let contract = "CCCC3333CCCC3333CCCC3333CCCC3333CCCC";
        store
            .upsert(event(contract, "BAZ", SourceKind::BuyFeed, now), now, &ThresholdsConfig::default())
            .await;

        store.mark_alerted(contract, Tier::Two, now).await;
        let snap = store.snapshot(contract).await.unwrap();
        assert_eq!(snap.alerted_tier, Some(Tier::Two));

        store.mark_alerted(contract, Tier::Three, now).await;
        let snap = store.snapshot(contract).await.unwrap();
        assert_eq!(snap.alerted_tier, Some(Tier::Two), "weaker tier must not downgrade");

        store.mark_alerted(contract, Tier::One, now).await;
        let snap = store.snapshot(contract).await.unwrap();
        assert_eq!(snap.alerted_tier, Some(Tier::One), "stronger tier upgrades");
    }
}
