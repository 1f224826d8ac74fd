//! Numeric-field extraction: market cap, liquidity, SOL buy size, holders,
//! callers, subs (spec.md §4.2).

use once_cell::sync::Lazy;
use regex::Regex;

/// Parses a shorthand numeric like "198.1K", "1.2M", "950,000" into a float.
fn parse_shorthand(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    let last = cleaned.chars().last()?;
    let (number_part, multiplier) = match last.to_ascii_uppercase() {
        'K' => (&cleaned[..cleaned.len() - 1], 1_000.0),
        'M' => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        'B' => (&cleaned[..cleaned.len() - 1], 1_000_000_000.0),
        _ => (cleaned, 1.0),
    };
    number_part.trim().parse::<f64>().ok().map(|n| n * multiplier)
}

static MC_KEYED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:MCap|MC|Market Cap|Current MC):?\s*\$?([\d.,]+\s*[KMB]?)\b").unwrap()
});
static MC_PAREN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(\$([\d.,]+\s*[KMB]?)\)").unwrap());
static MC_EMOJI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)💰\s*MC:?\s*\$?([\d.,]+\s*[KMB]?)\b").unwrap());

static LIQUIDITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:Liq(?:uidity)?):?\s*\$?([\d.,]+\s*[KMB]?)\b").unwrap()
});

static BUY_SOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([\d.,]+)\s*SOL\b").unwrap());

static HOLDERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Holders:?\s*([\d,]+)\b").unwrap());
static CALLERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Callers:?\s*([\d,]+)\b").unwrap());
static SUBS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Subs:?\s*([\d,]+)\b").unwrap());

pub fn extract_market_cap_usd(text: &str) -> Option<f64> {
    MC_KEYED
        .captures(text)
        .or_else(|| MC_EMOJI.captures(text))
        .or_else(|| MC_PAREN.captures(text))
        .and_then(|c| parse_shorthand(&c[1]))
}

pub fn extract_liquidity_usd(text: &str) -> Option<f64> {
    LIQUIDITY.captures(text).and_then(|c| parse_shorthand(&c[1]))
}

pub fn extract_buy_sol(text: &str) -> Option<f64> {
    BUY_SOL.captures(text).and_then(|c| parse_shorthand(&c[1]))
}

fn parse_int(raw: &str) -> Option<u32> {
    raw.chars()
        .filter(|c| *c != ',')
        .collect::<String>()
        .parse()
        .ok()
}

pub fn extract_holders(text: &str) -> Option<u32> {
    HOLDERS.captures(text).and_then(|c| parse_int(&c[1]))
}

pub fn extract_callers(text: &str) -> Option<u32> {
    CALLERS.captures(text).and_then(|c| parse_int(&c[1]))
}

pub fn extract_subs(text: &str) -> Option<u32> {
    SUBS.captures(text).and_then(|c| parse_int(&c[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_cap_keyed_shorthand() {
        assert_eq!(extract_market_cap_usd("MC: $198.1K"), Some(198_100.0));
    }

    #[test]
    fn market_cap_parenthetical() {
        assert_eq!(extract_market_cap_usd("FOO ($1.2M)"), Some(1_200_000.0));
    }

    #[test]
    fn market_cap_with_commas() {
        assert_eq!(extract_market_cap_usd("Market Cap: $950,000"), Some(950_000.0));
    }

    #[test]
    fn liquidity_keyed() {
        assert_eq!(extract_liquidity_usd("Liq: $21.8K"), Some(21_800.0));
    }

    #[test]
    fn buy_sol_amount() {
        assert_eq!(extract_buy_sol("Whale bought 25.5 SOL worth"), Some(25.5));
    }

    #[test]
    fn callers_and_subs() {
        assert_eq!(extract_callers("Callers: 22 | Subs: 150000"), Some(22));
        assert_eq!(extract_subs("Callers: 22 | Subs: 150000"), Some(150_000));
    }
}
