use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SourceKind;

/// A URL entity extracted from a chat message, with its anchor text.
#[derive(Debug, Clone)]
pub struct Entity {
    pub url: String,
    pub anchor_text: String,
}

/// One inbound chat message, before parsing.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub source_id: String,
    /// Monotonic receive instant, used only for latency-budget accounting.
    pub received_at: std::time::Instant,
    /// Wall-clock receive time, used for ordering and the age-budget check.
    pub received_at_wall: DateTime<Utc>,
    pub text: String,
    pub entities: Vec<Entity>,
    pub thread_id: Option<String>,
}

/// Categorical confirmation signals a parsed event may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTag {
    EarlyTrending,
    MomentumSpike,
    LargeBuy,
    WhaleBuy,
    Top5Hotlist,
    /// The 2x/3x confirmation from the momentum-tracker source — the cohort-start trigger.
    CohortConfirmation,
    /// A top5_hotlist observation outside the ±20 min window around T0.
    LateHotlist,
    /// Appended by the emitter when enrichment fails and the parsed MC is reused.
    StaleMc,
}

impl SignalTag {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalTag::EarlyTrending => "early_trending",
            SignalTag::MomentumSpike => "momentum_spike",
            SignalTag::LargeBuy => "large_buy",
            SignalTag::WhaleBuy => "whale_buy",
            SignalTag::Top5Hotlist => "top5_hotlist",
            SignalTag::CohortConfirmation => "cohort_confirmation",
            SignalTag::LateHotlist => "late_hotlist",
            SignalTag::StaleMc => "stale_mc",
        }
    }

    /// Strong confirmation tags per spec.md §4.4 Tier 1/2 rules.
    pub fn is_strong_confirmation(self) -> bool {
        matches!(
            self,
            SignalTag::MomentumSpike
                | SignalTag::LargeBuy
                | SignalTag::WhaleBuy
                | SignalTag::EarlyTrending
        )
    }

    /// Non-hotlist confirmation tags, counted for Tier 3's "2+ confirmations" rule.
    pub fn is_non_hotlist_confirmation(self) -> bool {
        matches!(
            self,
            SignalTag::MomentumSpike
                | SignalTag::LargeBuy
                | SignalTag::WhaleBuy
                | SignalTag::EarlyTrending
                | SignalTag::CohortConfirmation
        )
    }
}

/// Sentinel prefix used when only a symbol (not a contract) is known.
pub const HOTLIST_PREFIX: &str = "HOTLIST:";

pub fn hotlist_sentinel(symbol: &str) -> String {
    format!("{HOTLIST_PREFIX}{symbol}")
}

pub fn hotlist_symbol(contract_address: &str) -> Option<&str> {
    contract_address.strip_prefix(HOTLIST_PREFIX)
}

pub fn is_hotlist_sentinel(contract_address: &str) -> bool {
    contract_address.starts_with(HOTLIST_PREFIX)
}

/// A message that yielded usable data.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub source_id: String,
    pub source_kind: SourceKind,
    pub observed_at: DateTime<Utc>,
    pub wall_clock: DateTime<Utc>,
    pub contract_address: String,
    pub symbol: String,
    pub market_cap_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub buy_sol: Option<f64>,
    pub holders: Option<u32>,
    pub callers: Option<u32>,
    pub subs: Option<u32>,
    /// The hotlist's own visible rank for this mention, if the source listed
    /// one at all (any number, not just ≤5). `None` means the mention carried
    /// no rank and must not be asserted as a confirmed late-hotlist sighting.
    pub hotlist_rank: Option<u32>,
    pub signal_tags: HashSet<SignalTag>,
}

impl ParsedEvent {
    pub fn is_hotlist(&self) -> bool {
        is_hotlist_sentinel(&self.contract_address)
    }
}

/// Tier ranking: 1 is strongest. Ordering here matches spec.md's {1 > 2 > 3}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    One = 1,
    Two = 2,
    Three = 3,
}

impl Tier {
    /// True if `self` is strictly stronger than `other` (lower numeral wins).
    pub fn is_stronger_than(self, other: Tier) -> bool {
        (self as u8) < (other as u8)
    }

    pub fn level(self) -> &'static str {
        match self {
            Tier::One => "HIGH",
            Tier::Two | Tier::Three => "MEDIUM",
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Ephemeral output of the correlator, consumed by the dedup/emitter stage.
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub contract_address: String,
    pub symbol: String,
    pub tier: Tier,
    pub reasons: Vec<String>,
    pub description_theme: &'static str,
    pub observed_at: DateTime<Utc>,
    pub market_cap_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub callers: Option<u32>,
    pub subs: Option<u32>,
    pub matched_signals: Vec<String>,
    pub tags: Vec<String>,
    pub hotlist: bool,
    pub confirmation_count: u32,
    pub cohort_start_at: DateTime<Utc>,
}

/// Durable, append-only alert record. Field names are serialized in the
/// lowerCamelCase the persisted log format requires (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub token: String,
    pub tier: u8,
    pub level: String,
    pub timestamp: DateTime<Utc>,
    pub contract: String,
    #[serde(rename = "entryMc")]
    pub entry_mc_usd: Option<f64>,
    pub hotlist: String,
    pub description: String,
    #[serde(rename = "matchedSignals")]
    pub matched_signals: Vec<String>,
    pub tags: Vec<String>,
    pub liquidity: Option<f64>,
    pub callers: Option<u32>,
    pub subs: Option<u32>,
    #[serde(rename = "confirmationCount")]
    pub confirmation_count: u32,
    #[serde(rename = "cohortTime")]
    pub cohort_time: String,
}

/// Rolling aggregate for one contract, owned exclusively by the correlator
/// (spec.md §3 / §4.3). Events are trimmed to the state window on every
/// `upsert`; derived metrics are re-computed from the trimmed ring.
#[derive(Debug, Clone)]
pub struct TokenState {
    pub contract_address: String,
    pub symbol: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub event_ring: VecDeque<ParsedEvent>,
    pub sources_seen: HashSet<String>,
    pub source_kinds_seen: HashSet<crate::config::SourceKind>,
    pub tags_union: HashSet<SignalTag>,

    pub total_buy_sol: f64,
    pub distinct_buy_sources: usize,
    pub first_to_second_buy_gap: Option<Duration>,
    pub time_spread: Duration,

    /// The highest tier already emitted for this contract, and when.
    pub alerted_tier: Option<Tier>,
    pub last_alert_at: Option<DateTime<Utc>>,

    /// T0: the first cohort-confirmation event's timestamp, if any.
    pub cohort_start_at: Option<DateTime<Utc>>,

    /// Most recently observed market cap / liquidity, carried forward even
    /// as older events age out of the ring (used by the enrichment fallback).
    pub latest_market_cap_usd: Option<f64>,
    pub latest_liquidity_usd: Option<f64>,
    pub latest_callers: Option<u32>,
    pub latest_subs: Option<u32>,
}

impl TokenState {
    pub fn new(contract_address: String, symbol: String, now: DateTime<Utc>) -> Self {
        Self {
            contract_address,
            symbol,
            first_seen_at: now,
            last_updated_at: now,
            event_ring: VecDeque::new(),
            sources_seen: HashSet::new(),
            source_kinds_seen: HashSet::new(),
            tags_union: HashSet::new(),
            total_buy_sol: 0.0,
            distinct_buy_sources: 0,
            first_to_second_buy_gap: None,
            time_spread: Duration::zero(),
            alerted_tier: None,
            last_alert_at: None,
            cohort_start_at: None,
            latest_market_cap_usd: None,
            latest_liquidity_usd: None,
            latest_callers: None,
            latest_subs: None,
        }
    }
}

/// Renders a relative "Nh ago" / "Nm ago" string from a UTC timestamp,
/// reconstructable from `timestamp` per spec.md §3's invariant.
pub fn cohort_time_relative(cohort_start_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = now - cohort_start_at;
    let mins = delta.num_minutes();
    if mins < 1 {
        "just now".to_string()
    } else if mins < 60 {
        format!("{mins}m ago")
    } else {
        format!("{}h ago", mins / 60)
    }
}
