//! Tag assignment: source kind sets a baseline, text content promotes
//! specific confirmation tags (spec.md §4.2).

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{SourceKind, ThresholdsConfig};
use crate::model::SignalTag;

/// Matches a percent-in-seconds/minutes spike, e.g. "+180% in 45s" or "up 250% in 2min".
static SPIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[+]?\d{2,4}%\s*(?:in\s*)?\d+\s*(?:s|sec|secs|seconds|min|mins|minutes)\b").unwrap());

/// Matches the momentum-tracker's 2x/3x confirmation trigger (spec.md's cohort start).
static COHORT_MULTIPLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b[23]x\b").unwrap());

pub struct TagContext<'a> {
    pub source_kind: SourceKind,
    pub text: &'a str,
    pub buy_sol: Option<f64>,
    pub is_top5_hotlist_entry: bool,
}

pub fn assign(ctx: &TagContext, thresholds: &ThresholdsConfig) -> HashSet<SignalTag> {
    let mut tags = HashSet::new();

    match ctx.source_kind {
        SourceKind::TrendingFeed => {
            tags.insert(SignalTag::EarlyTrending);
        }
        SourceKind::MomentumFeed => {
            if COHORT_MULTIPLE.is_match(ctx.text) {
                tags.insert(SignalTag::CohortConfirmation);
            }
        }
        SourceKind::HotlistFeed if ctx.is_top5_hotlist_entry => {
            tags.insert(SignalTag::Top5Hotlist);
        }
        _ => {}
    }

    if SPIKE.is_match(ctx.text) {
        tags.insert(SignalTag::MomentumSpike);
    }

    if let Some(sol) = ctx.buy_sol {
        if sol >= thresholds.whale_buy_sol {
            tags.insert(SignalTag::WhaleBuy);
        } else if sol >= thresholds.large_buy_sol {
            tags.insert(SignalTag::LargeBuy);
        }
    }

    tags
}
