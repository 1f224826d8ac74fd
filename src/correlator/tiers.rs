//! Pure tier-rule evaluation (spec.md §4.4). Takes a token state snapshot and
//! the currently effective thresholds; has no knowledge of dynamic
//! thresholding, penalties, or boosts — those live in the orchestrating
//! `correlator` module.

use chrono::{DateTime, Duration, Utc};

use crate::config::ThresholdsConfig;
use crate::model::{SignalTag, Tier, TokenState};

pub struct TierOutcome {
    pub tier: Tier,
    pub reasons: Vec<String>,
    pub matched_signals: Vec<String>,
}

fn has_strong_confirmation(state: &TokenState) -> bool {
    state.tags_union.iter().any(|t| t.is_strong_confirmation())
}

fn confirmation_count(state: &TokenState) -> usize {
    state
        .tags_union
        .iter()
        .filter(|t| t.is_non_hotlist_confirmation())
        .count()
}

fn hotlist_in_window(state: &TokenState) -> bool {
    state.tags_union.contains(&SignalTag::Top5Hotlist)
}

fn hotlist_late(state: &TokenState) -> bool {
    state.tags_union.contains(&SignalTag::LateHotlist)
}

fn social_strength(state: &TokenState, thresholds: &ThresholdsConfig, social_tighten: bool) -> bool {
    let (min_callers, min_subs) = if social_tighten {
        (
            (thresholds.tier1_social_min_callers as f64 * (1.0 + thresholds.dynamic_social_tighten_pct)) as u32,
            (thresholds.tier1_social_min_subs as f64 * (1.0 + thresholds.dynamic_social_tighten_pct)) as u32,
        )
    } else {
        (thresholds.tier1_social_min_callers, thresholds.tier1_social_min_subs)
    };
    state.latest_callers.is_some_and(|c| c >= min_callers)
        && state.latest_subs.is_some_and(|s| s >= min_subs)
}

fn in_range(value: Option<f64>, min: f64, max: f64) -> bool {
    value.is_some_and(|v| v >= min && v <= max)
}

/// Evaluates Tier 1 -> 2 -> 3 in order, first satisfied tier wins. Returns
/// `None` if no cohort has started or no tier rule is satisfied.
pub fn evaluate(
    state: &TokenState,
    now: DateTime<Utc>,
    thresholds: &ThresholdsConfig,
    effective_tier1_mc_max: f64,
    social_tighten: bool,
) -> Option<TierOutcome> {
    let t0 = state.cohort_start_at?;
    let state_window = Duration::seconds(thresholds.state_window_secs);
    if now - t0 > state_window {
        return None;
    }

    let mc = state.latest_market_cap_usd;
    let in_window = hotlist_in_window(state);
    let late = hotlist_late(state);

    // Tier 1. The "contract present OR social strength" clause in spec.md
    // §4.4 is trivially satisfied by gate 1 (only real contracts reach here);
    // social strength is still computed so it can be surfaced as a reason.
    if in_window
        && has_strong_confirmation(state)
        && in_range(mc, thresholds.tier1_mc_min_usd, effective_tier1_mc_max)
    {
        let mut reasons = reasons_for(state, true, false);
        if social_strength(state, thresholds, social_tighten) {
            reasons.push("social_strength".to_string());
        }
        return Some(TierOutcome {
            tier: Tier::One,
            matched_signals: reasons.clone(),
            reasons,
        });
    }

    // Tier 2.
    if in_window
        && confirmation_count(state) >= 1
        && in_range(mc, thresholds.tier2_mc_min_usd, thresholds.tier2_mc_max_usd)
    {
        return Some(TierOutcome {
            tier: Tier::Two,
            reasons: reasons_for(state, true, false),
            matched_signals: matched_signals_for(state, true, false),
        });
    }

    // Tier 3.
    if confirmation_count(state) >= 2 || late {
        return Some(TierOutcome {
            tier: Tier::Three,
            reasons: reasons_for(state, in_window, late),
            matched_signals: matched_signals_for(state, in_window, late),
        });
    }

    None
}

fn reasons_for(state: &TokenState, hotlist_in_window: bool, hotlist_late: bool) -> Vec<String> {
    let mut reasons = Vec::new();
    if hotlist_in_window {
        reasons.push("hotlist".to_string());
    }
    if hotlist_late {
        reasons.push("late_hotlist".to_string());
    }
    for tag in [
        SignalTag::WhaleBuy,
        SignalTag::LargeBuy,
        SignalTag::MomentumSpike,
        SignalTag::EarlyTrending,
    ] {
        if state.tags_union.contains(&tag) {
            reasons.push(tag.as_str().to_string());
        }
    }
    reasons
}

fn matched_signals_for(state: &TokenState, hotlist_in_window: bool, hotlist_late: bool) -> Vec<String> {
    reasons_for(state, hotlist_in_window, hotlist_late)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_state(now: DateTime<Utc>) -> TokenState {
        let mut s = TokenState::new("AAAA".into(), "FOO".into(), now);
        s.cohort_start_at = Some(now);
        s.latest_market_cap_usd = Some(60_000.0);
        s.latest_liquidity_usd = Some(20_000.0);
        s
    }

    #[test]
    fn tier1_fires_with_hotlist_and_whale_buy() {
        let now = Utc::now();
        let mut s = base_state(now);
        s.tags_union.insert(SignalTag::Top5Hotlist);
        s.tags_union.insert(SignalTag::WhaleBuy);
        let outcome = evaluate(&s, now, &ThresholdsConfig::default(), 100_000.0, false).unwrap();
        assert_eq!(outcome.tier, Tier::One);
    }

    #[test]
    fn tier3_via_late_hotlist() {
        let now = Utc::now();
        let mut s = base_state(now);
        s.latest_market_cap_usd = Some(200_000.0);
        s.tags_union.insert(SignalTag::LateHotlist);
        let outcome = evaluate(&s, now, &ThresholdsConfig::default(), 100_000.0, false).unwrap();
        assert_eq!(outcome.tier, Tier::Three);
    }

    #[test]
    fn no_cohort_start_means_no_alert() {
        let now = Utc::now();
        let mut s = TokenState::new("AAAA".into(), "FOO".into(), now);
        s.tags_union.insert(SignalTag::WhaleBuy);
        assert!(evaluate(&s, now, &ThresholdsConfig::default(), 100_000.0, false).is_none());
    }

    #[test]
    fn tier3_via_two_confirmations_without_hotlist() {
        let now = Utc::now();
        let mut s = base_state(now);
        s.latest_market_cap_usd = Some(500_000.0);
        s.tags_union.insert(SignalTag::WhaleBuy);
        s.tags_union.insert(SignalTag::MomentumSpike);
        let outcome = evaluate(&s, now, &ThresholdsConfig::default(), 100_000.0, false).unwrap();
        assert_eq!(outcome.tier, Tier::Three);
    }
}
