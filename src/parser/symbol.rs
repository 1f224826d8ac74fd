//! Symbol extraction cascade (spec.md §4.2).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::RawMessage;

static TRENDING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)🔥.*?New Trending.*?#?\$?([A-Za-z][A-Za-z0-9]{1,15})\b").unwrap());
static EMOJI_MONEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"💰\s*([A-Za-z][A-Za-z0-9]{1,15})\s*\(\$").unwrap());
static EMOJI_ZAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"⚡\s*([A-Za-z][A-Za-z0-9]{1,15})\s*\(\$").unwrap());
static SWAP_FOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Swapped\s+[\d.,]+\s*SOL.*?for\s+[\d.,]+\s*#([A-Za-z][A-Za-z0-9]{1,15})\b").unwrap());
static DID_EMOJI: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Za-z][A-Za-z0-9]{1,15})\s+did\s+👉").unwrap());
static WHITE_CIRCLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"⚪.*?\(#([A-Za-z][A-Za-z0-9]{1,15})\)").unwrap());
static CALL_ALERT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)CALL ALERT:\s*([A-Za-z][A-Za-z0-9]{1,15})\b").unwrap());
static CALL_ON: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)call on\s+([A-Za-z][A-Za-z0-9]{1,15})\b").unwrap());
static LEADING_HASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#([A-Za-z][A-Za-z0-9]{1,15})\b").unwrap());
static DOLLAR_SIGN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$([A-Za-z][A-Za-z0-9]{1,15})\b").unwrap());

fn clean(raw: &str) -> Option<String> {
    let trimmed: String = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if trimmed.is_empty() || trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(trimmed.to_uppercase())
}

fn via(re: &Lazy<Regex>, text: &str) -> Option<String> {
    re.captures(text).and_then(|c| clean(&c[1]))
}

/// Runs the priority cascade documented in spec.md §4.2.
pub fn extract(text: &str) -> Option<String> {
    via(&TRENDING, text)
        .or_else(|| via(&EMOJI_MONEY, text))
        .or_else(|| via(&EMOJI_ZAP, text))
        .or_else(|| via(&SWAP_FOR, text))
        .or_else(|| via(&DID_EMOJI, text))
        .or_else(|| via(&WHITE_CIRCLE, text))
        .or_else(|| via(&CALL_ALERT, text))
        .or_else(|| via(&CALL_ON, text))
        .or_else(|| via(&LEADING_HASH, text))
        .or_else(|| via(&DOLLAR_SIGN, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emoji_money_form() {
        assert_eq!(extract("💰 FOO ($1.2M)"), Some("FOO".to_string()));
    }

    #[test]
    fn swap_for_takes_buy_side_symbol() {
        assert_eq!(
            extract("Swapped 2.5 SOL on Raydium for 1,000,000 #FOO"),
            Some("FOO".to_string())
        );
    }

    #[test]
    fn leading_hash() {
        assert_eq!(extract("#BAR just launched"), Some("BAR".to_string()));
    }

    #[test]
    fn dollar_sign() {
        assert_eq!(extract("watching $BAZ closely"), Some("BAZ".to_string()));
    }

    #[test]
    fn rejects_pure_numeric() {
        assert_eq!(extract("$12345 random number"), None);
    }

    #[test]
    fn call_alert_form() {
        assert_eq!(extract("CALL ALERT: QUX"), Some("QUX".to_string()));
    }
}
