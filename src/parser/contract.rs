//! Contract-address extraction cascade (spec.md §4.2).
//!
//! Each function is a pure fragment extractor tried in priority order;
//! the first `Some` wins. No inheritance, no shared mutable state — a
//! plain ordered list of functions, per SPEC_FULL.md's rewriting notes.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::RawMessage;

const MIN_LEN: usize = 32;
const MAX_LEN: usize = 44;

static DEEP_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?&]start=(?:\d+_)?([1-9A-HJ-NP-Za-km-z]{32,44})\b").unwrap());

static DEX_EXPLORER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:gmgn\.ai/sol/token/(?:[A-Za-z0-9]+_)?|pump\.fun/)([1-9A-HJ-NP-Za-km-z]{32,44})\b",
    )
    .unwrap()
});

static KEYED_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\bCA:|\bMint:|\bContract:|📄)\s*\**([1-9A-HJ-NP-Za-km-z]{32,44})\b")
        .unwrap()
});

static BARE_BASE58: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([1-9A-HJ-NP-Za-km-z]{32,44})\b").unwrap());

/// Validates and canonicalizes a candidate address: base58 charset,
/// length 32-44, never an 0x-prefixed (Ethereum-style) string.
fn validate(candidate: &str) -> Option<String> {
    if candidate.len() < MIN_LEN || candidate.len() > MAX_LEN {
        return None;
    }
    if candidate.starts_with("0x") || candidate.starts_with("0X") {
        return None;
    }
    if bs58::decode(candidate).into_vec().is_err() {
        return None;
    }
    Some(candidate.to_uppercase())
}

type Extractor = fn(&RawMessage) -> Option<String>;

fn from_deep_link(raw: &RawMessage) -> Option<String> {
    let haystacks = std::iter::once(raw.text.as_str()).chain(raw.entities.iter().map(|e| e.url.as_str()));
    for hay in haystacks {
        if let Some(caps) = DEEP_LINK.captures(hay) {
            if let Some(v) = validate(&caps[1]) {
                return Some(v);
            }
        }
    }
    None
}

fn from_dex_explorer(raw: &RawMessage) -> Option<String> {
    let haystacks = std::iter::once(raw.text.as_str()).chain(raw.entities.iter().map(|e| e.url.as_str()));
    for hay in haystacks {
        if let Some(caps) = DEX_EXPLORER.captures(hay) {
            if let Some(v) = validate(&caps[1]) {
                return Some(v);
            }
        }
    }
    None
}

fn from_keyed_label(raw: &RawMessage) -> Option<String> {
    KEYED_LABEL
        .captures(&raw.text)
        .and_then(|caps| validate(&caps[1]))
}

fn from_bare_run(raw: &RawMessage) -> Option<String> {
    for caps in BARE_BASE58.captures_iter(&raw.text) {
        if let Some(v) = validate(&caps[1]) {
            return Some(v);
        }
    }
    None
}

const CASCADE: &[Extractor] = &[from_deep_link, from_dex_explorer, from_keyed_label, from_bare_run];

/// Runs the priority cascade and returns the first valid, canonicalized address.
pub fn extract(raw: &RawMessage) -> Option<String> {
    CASCADE.iter().find_map(|f| f(raw))
}
