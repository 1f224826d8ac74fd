//! Pure, per-message parsing (spec.md §4.2). `parse` depends only on its
//! input message and the static source table — no shared state, so it is
//! trivially idempotent and safe to run on a stateless worker pool.

mod contract;
mod numeric;
mod symbol;
mod tags;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{SourceKind, ThresholdsConfig};
use crate::model::{hotlist_sentinel, ParsedEvent, RawMessage};

/// Per-source parse-miss counters (spec.md §4.2: "Failures return null and
/// are counted"). Cheap to clone and share across the parser pool.
#[derive(Default)]
pub struct ParseMetrics {
    misses: std::sync::Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl ParseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_for(&self, source_id: &str) -> Arc<AtomicU64> {
        let mut guard = self.misses.lock().unwrap_or_else(|p| p.into_inner());
        match guard.entry(source_id.to_string()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                let c = Arc::new(AtomicU64::new(0));
                e.insert(c.clone());
                c
            }
        }
    }

    pub fn record_miss(&self, source_id: &str) {
        self.counter_for(source_id).fetch_add(1, Ordering::Relaxed);
    }

    pub fn misses_for(&self, source_id: &str) -> u64 {
        self.counter_for(source_id).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        let guard = self.misses.lock().unwrap_or_else(|p| p.into_inner());
        guard
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

static RANKED_ENTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*#?(\d+)[.)]\s").unwrap());

/// Best-effort detection of a hotlist message's numeric rank, so
/// `top5_hotlist` can be promoted when the source lists its entries
/// ranked ("1. FOO", "#2 BAR", ...). Messages with no visible rank are
/// treated conservatively as not-top-5; `TokenState`'s hotlist
/// reconciliation still merges the tag later if a subsequent ranked
/// mention arrives within the window.
fn hotlist_rank(text: &str) -> Option<u32> {
    RANKED_ENTRY.captures(text).and_then(|c| c[1].parse().ok())
}

/// Parses one raw message into a `ParsedEvent`, or `None` on a parse miss.
pub fn parse(
    raw: &RawMessage,
    source_kind: SourceKind,
    thresholds: &ThresholdsConfig,
) -> Option<ParsedEvent> {
    let symbol = symbol::extract(&raw.text)?;

    let contract_address = if source_kind == SourceKind::HotlistFeed {
        hotlist_sentinel(&symbol)
    } else {
        contract::extract(raw)?
    };

    let market_cap_usd = numeric::extract_market_cap_usd(&raw.text);
    let liquidity_usd = numeric::extract_liquidity_usd(&raw.text);
    let buy_sol = numeric::extract_buy_sol(&raw.text);
    let holders = numeric::extract_holders(&raw.text);
    let callers = numeric::extract_callers(&raw.text);
    let subs = numeric::extract_subs(&raw.text);

    let rank = hotlist_rank(&raw.text);
    let is_top5_hotlist_entry =
        source_kind == SourceKind::HotlistFeed && rank.is_some_and(|r| r <= 5);

    let signal_tags = tags::assign(
        &tags::TagContext {
            source_kind,
            text: &raw.text,
            buy_sol,
            is_top5_hotlist_entry,
        },
        thresholds,
    );

    let hotlist_rank = if source_kind == SourceKind::HotlistFeed { rank } else { None };

    Some(ParsedEvent {
        source_id: raw.source_id.clone(),
        source_kind,
        observed_at: raw.received_at_wall,
        wall_clock: raw.received_at_wall,
        contract_address,
        symbol,
        market_cap_usd,
        liquidity_usd,
        buy_sol,
        holders,
        callers,
        subs,
        hotlist_rank,
        signal_tags,
    })
}

/// Extracts a bare `(symbol, callers, subs)` triple for XTRACK echo
/// enrichment (spec.md §4.6.2), independent of contract extraction: a
/// trending tracker re-mentioning a token we've already alerted carries
/// no contract address, only the symbol and updated social counts.
pub fn extract_echo(text: &str) -> Option<(String, Option<u32>, Option<u32>)> {
    let symbol = symbol::extract(text)?;
    let callers = numeric::extract_callers(text);
    let subs = numeric::extract_subs(text);
    if callers.is_none() && subs.is_none() {
        return None;
    }
    Some((symbol, callers, subs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entity;

    fn msg(source_id: &str, text: &str) -> RawMessage {
        RawMessage {
            source_id: source_id.to_string(),
            received_at: std::time::Instant::now(),
            received_at_wall: chrono::Utc::now(),
            text: text.to_string(),
            entities: vec![Entity {
                url: String::new(),
                anchor_text: String::new(),
            }],
            thread_id: None,
        }
    }

    #[test]
    fn parses_buy_feed_whale_event() {
        let addr = "8xKWq7P2nF4hY6mZ1cQeRtLb3xVnSjDp9AoGhUi5Ekrt";
        let text = format!("💰 FOO ($60K) CA: {addr} whale bought 25 SOL");
        let event = parse(&msg("buyfeed", &text), SourceKind::BuyFeed, &ThresholdsConfig::default())
            .expect("should parse");
        assert_eq!(event.symbol, "FOO");
        assert_eq!(event.contract_address, addr.to_uppercase());
        assert_eq!(event.market_cap_usd, Some(60_000.0));
        assert_eq!(event.buy_sol, Some(25.0));
    }

    #[test]
    fn hotlist_message_yields_sentinel_contract() {
        let text = "1. FOO is trending";
        let event = parse(&msg("hotlist", text), SourceKind::HotlistFeed, &ThresholdsConfig::default())
            .expect("should parse");
        assert_eq!(event.contract_address, "HOTLIST:FOO");
        assert!(event.signal_tags.contains(&crate::model::SignalTag::Top5Hotlist));
    }

    #[test]
    fn parse_miss_on_no_symbol() {
        let text = "gm everyone have a great day";
        assert!(parse(&msg("social", text), SourceKind::SocialFeed, &ThresholdsConfig::default()).is_none());
    }

    #[test]
    fn parse_is_idempotent() {
        let addr = "9yLXr8Q3oG5iZ7nA2dRfSuMc4yWoTkEq0BpHiVj6Flsu";
        let text = format!("CALL ALERT: BAR CA: {addr}");
        let m = msg("callfeed", &text);
        let a = parse(&m, SourceKind::BuyFeed, &ThresholdsConfig::default());
        let b = parse(&m, SourceKind::BuyFeed, &ThresholdsConfig::default());
        assert_eq!(a.map(|e| e.contract_address.clone()), b.map(|e| e.contract_address.clone()));
    }

    #[test]
    fn echo_extracts_symbol_and_social_counts_without_a_contract() {
        let (symbol, callers, subs) = extract_echo("$FOO trending again — Callers: 24 | Subs: 120000").unwrap();
        assert_eq!(symbol, "FOO");
        assert_eq!(callers, Some(24));
        assert_eq!(subs, Some(120_000));
    }

    #[test]
    fn echo_misses_when_no_social_counts_present() {
        assert!(extract_echo("$FOO still trending, no new numbers").is_none());
    }
}
