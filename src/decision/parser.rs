//! Tolerant parsing of model responses.
//!
//! Models are instructed to emit a `<reasoning>` block followed by a
//! `<decision>` block holding a JSON array, but obedience is not assumed:
//! fenced code blocks are stripped, single objects are accepted where arrays
//! were asked for, action names go through a synonym table, and when tag
//! extraction fails entirely a substring count over `"action":"..."` pairs
//! salvages the dominant action.

use serde::Deserialize;
use tracing::debug;

use crate::models::{normalize_symbol, TradeAction, TradeDecision};

#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub chain_of_thought: Option<String>,
    pub decisions: Vec<TradeDecision>,
    pub used_fallback: bool,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    leverage: Option<f64>,
    #[serde(default)]
    position_pct: Option<f64>,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    take_profit: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Extract the inner text of `<tag>...</tag>`, case-insensitive on the tag.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = lower.find(&open)? + open.len();
    let end = lower[start..].find(&close)? + start;
    Some(text[start..end].trim().to_string())
}

fn strip_fences(s: &str) -> &str {
    let s = s.trim();
    let s = s
        .strip_prefix("```json")
        .or_else(|| s.strip_prefix("```"))
        .unwrap_or(s);
    s.strip_suffix("```").unwrap_or(s).trim()
}

/// Map the model's action word onto the closed action set.
pub fn normalize_action(raw: &str) -> Option<TradeAction> {
    let s = raw
        .trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_");
    match s.as_str() {
        "open_long" | "buy" | "long" | "go_long" => Some(TradeAction::OpenLong),
        "open_short" | "short" | "go_short" => Some(TradeAction::OpenShort),
        "close_long" | "exit_long" | "sell_long" => Some(TradeAction::CloseLong),
        "close_short" | "exit_short" | "cover" => Some(TradeAction::CloseShort),
        "hold" | "keep" => Some(TradeAction::Hold),
        "wait" | "none" | "no_action" | "skip" => Some(TradeAction::Wait),
        _ => None,
    }
}

fn sanitize(raw: RawDecision) -> Option<TradeDecision> {
    let action = normalize_action(&raw.action)?;
    let symbol = normalize_symbol(&raw.symbol);
    if symbol.is_empty() {
        return None;
    }
    Some(TradeDecision {
        symbol,
        action,
        confidence: raw.confidence.unwrap_or(50.0).clamp(0.0, 100.0),
        leverage: raw
            .leverage
            .filter(|l| l.is_finite() && *l >= 1.0)
            .map(|l| l.round() as u32),
        position_pct: raw
            .position_pct
            .filter(|p| p.is_finite() && *p > 0.0 && *p <= 1.0),
        stop_loss: raw.stop_loss.filter(|v| v.is_finite() && *v > 0.0),
        take_profit: raw.take_profit.filter(|v| v.is_finite() && *v > 0.0),
        reasoning: raw.reasoning.filter(|r| !r.trim().is_empty()),
    })
}

/// Parse the JSON payload of a decision-bearing tag. Invalid entries are
/// dropped, not fatal.
pub fn parse_tagged_decisions(text: &str, tag: &str) -> Option<Vec<TradeDecision>> {
    let payload = extract_tag(text, tag)?;
    let payload = strip_fences(&payload);

    let raws: Vec<RawDecision> = match serde_json::from_str::<Vec<RawDecision>>(payload) {
        Ok(list) => list,
        Err(_) => match serde_json::from_str::<RawDecision>(payload) {
            Ok(single) => vec![single],
            Err(e) => {
                debug!(error = %e, tag, "decision payload is not valid json");
                return None;
            }
        },
    };

    Some(raws.into_iter().filter_map(sanitize).collect())
}

/// Substring fallback: count `"action":"x"` occurrences for every known
/// action and return the winner. Ties break on the declared action priority.
pub fn fallback_action(text: &str) -> Option<TradeAction> {
    let compact = text.replace(char::is_whitespace, "");
    let mut best: Option<(TradeAction, usize)> = None;
    for action in TradeAction::ALL {
        let needle = format!("\"action\":\"{}\"", action.as_str());
        let count = compact.matches(&needle).count();
        if count == 0 {
            continue;
        }
        best = match best {
            None => Some((action, count)),
            Some((prev, prev_count)) => {
                if count > prev_count
                    || (count == prev_count && action.priority() > prev.priority())
                {
                    Some((action, count))
                } else {
                    Some((prev, prev_count))
                }
            }
        };
    }
    best.map(|(action, _)| action)
}

/// Full response parse for the decision pipeline.
///
/// `fallback_symbol` is used when tag extraction fails but the substring
/// fallback finds a dominant action (debates with a declared coin; a
/// candidate universe of one).
pub fn parse_response(text: &str, fallback_symbol: Option<&str>) -> ParsedResponse {
    let chain_of_thought = extract_tag(text, "reasoning");

    if let Some(decisions) = parse_tagged_decisions(text, "decision") {
        return ParsedResponse {
            chain_of_thought,
            decisions,
            used_fallback: false,
        };
    }

    let mut decisions = Vec::new();
    if let (Some(symbol), Some(action)) = (fallback_symbol, fallback_action(text)) {
        decisions.push(TradeDecision {
            symbol: normalize_symbol(symbol),
            action,
            confidence: 50.0,
            leverage: None,
            position_pct: None,
            stop_loss: None,
            take_profit: None,
            reasoning: None,
        });
    }
    ParsedResponse {
        chain_of_thought,
        decisions,
        used_fallback: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"
Some preamble the model added.
<reasoning>
BTC looks oversold on the 4h.
</reasoning>
<decision>
[
  {"symbol": "BTCUSDT", "action": "open_long", "confidence": 82,
   "leverage": 5, "position_pct": 0.2, "stop_loss": 0.03, "take_profit": 0.06,
   "reasoning": "oversold bounce"},
  {"symbol": "ethusdt", "action": "buy", "confidence": 140},
  {"symbol": "SOLUSDT", "action": "teleport", "confidence": 50},
  {"symbol": "", "action": "hold"}
]
</decision>
"#;

    #[test]
    fn parses_tags_and_sanitizes() {
        let parsed = parse_response(RESPONSE, None);
        assert!(!parsed.used_fallback);
        assert_eq!(
            parsed.chain_of_thought.as_deref(),
            Some("BTC looks oversold on the 4h.")
        );
        // unknown action and empty symbol dropped
        assert_eq!(parsed.decisions.len(), 2);
        assert_eq!(parsed.decisions[0].symbol, "BTCUSDT");
        assert_eq!(parsed.decisions[0].action, TradeAction::OpenLong);
        // synonym "buy" and clamped confidence
        assert_eq!(parsed.decisions[1].symbol, "ETHUSDT");
        assert_eq!(parsed.decisions[1].action, TradeAction::OpenLong);
        assert_eq!(parsed.decisions[1].confidence, 100.0);
    }

    #[test]
    fn fenced_json_and_single_object() {
        let text = "<decision>```json\n{\"symbol\": \"btc\", \"action\": \"wait\"}\n```</decision>";
        let parsed = parse_response(text, None);
        assert_eq!(parsed.decisions.len(), 1);
        assert_eq!(parsed.decisions[0].symbol, "BTCUSDT");
        assert_eq!(parsed.decisions[0].action, TradeAction::Wait);
    }

    #[test]
    fn fallback_counts_action_substrings() {
        let text = r#"model rambled: "action":"open_long" then "action": "open_long"
            and once "action":"close_short""#;
        assert_eq!(fallback_action(text), Some(TradeAction::OpenLong));

        let parsed = parse_response(text, Some("BTCUSDT"));
        assert!(parsed.used_fallback);
        assert_eq!(parsed.decisions.len(), 1);
        assert_eq!(parsed.decisions[0].action, TradeAction::OpenLong);
        assert_eq!(parsed.decisions[0].confidence, 50.0);
    }

    #[test]
    fn fallback_without_symbol_yields_nothing() {
        let parsed = parse_response("\"action\":\"open_long\"", None);
        assert!(parsed.used_fallback);
        assert!(parsed.decisions.is_empty());
    }

    #[test]
    fn fallback_tie_breaks_on_priority() {
        let text = r#""action":"open_long" "action":"close_long""#;
        assert_eq!(fallback_action(text), Some(TradeAction::CloseLong));
    }

    #[test]
    fn position_pct_out_of_range_dropped() {
        let text = r#"<decision>[{"symbol":"BTC","action":"open_long","position_pct":5.0}]</decision>"#;
        let parsed = parse_response(text, None);
        assert_eq!(parsed.decisions[0].position_pct, None);
    }

    #[test]
    fn vote_tag_uses_same_parser() {
        let text = r#"<final_vote>[{"symbol":"BTC","action":"open_short","confidence":70}]</final_vote>"#;
        let votes = parse_tagged_decisions(text, "final_vote").unwrap();
        assert_eq!(votes[0].action, TradeAction::OpenShort);
    }
}
