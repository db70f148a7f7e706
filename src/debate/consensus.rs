//! Confidence-weighted consensus over the final votes.

use std::collections::HashMap;

use crate::models::{round2, TradeAction, TradeDecision};
use crate::store::DebateVote;

const MIN_WEIGHT: f64 = 0.5;
const DEFAULT_LEVERAGE: f64 = 5.0;
const DEFAULT_POSITION_PCT: f64 = 0.2;
const DEFAULT_STOP_LOSS: f64 = 0.03;
const DEFAULT_TAKE_PROFIT: f64 = 0.06;

/// Resolve one winning decision per symbol mentioned across all votes.
///
/// Each vote contributes `max(confidence/100, 0.5)` to its action's score —
/// the floor deliberately keeps low-confidence and zero-confidence votes in
/// play. Ties break on the declared action priority, not map order, so the
/// outcome is deterministic. Output is sorted by symbol.
pub fn compute_consensus(votes: &[DebateVote]) -> Vec<TradeDecision> {
    // symbol -> action -> contributing decisions
    let mut by_symbol: HashMap<String, HashMap<TradeAction, Vec<&TradeDecision>>> = HashMap::new();
    for vote in votes {
        for d in &vote.decisions {
            by_symbol
                .entry(d.symbol.clone())
                .or_default()
                .entry(d.action)
                .or_default()
                .push(d);
        }
    }

    let mut out = Vec::new();
    for (symbol, actions) in by_symbol {
        let mut winner: Option<(TradeAction, f64)> = None;
        for (&action, contributors) in &actions {
            let score: f64 = contributors
                .iter()
                .map(|d| (d.confidence / 100.0).max(MIN_WEIGHT))
                .sum();
            winner = match winner {
                None => Some((action, score)),
                Some((prev_action, prev_score)) => {
                    if score > prev_score
                        || (score == prev_score && action.priority() > prev_action.priority())
                    {
                        Some((action, score))
                    } else {
                        Some((prev_action, prev_score))
                    }
                }
            };
        }

        let Some((action, _)) = winner else { continue };
        let contributors = &actions[&action];
        out.push(merge_contributors(symbol, action, contributors));
    }

    out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    out
}

fn avg_or<F>(contributors: &[&TradeDecision], default: f64, f: F) -> f64
where
    F: Fn(&TradeDecision) -> Option<f64>,
{
    let present: Vec<f64> = contributors.iter().filter_map(|d| f(d)).collect();
    if present.is_empty() {
        default
    } else {
        present.iter().sum::<f64>() / present.len() as f64
    }
}

fn merge_contributors(
    symbol: String,
    action: TradeAction,
    contributors: &[&TradeDecision],
) -> TradeDecision {
    let confidence = round2(
        contributors.iter().map(|d| d.confidence).sum::<f64>() / contributors.len() as f64,
    );

    if !action.is_open() {
        return TradeDecision {
            symbol,
            action,
            confidence,
            leverage: None,
            position_pct: None,
            stop_loss: None,
            take_profit: None,
            reasoning: None,
        };
    }

    let leverage = avg_or(contributors, DEFAULT_LEVERAGE, |d| {
        d.leverage.map(f64::from)
    })
    .round()
    .clamp(1.0, 20.0);
    let position_pct =
        avg_or(contributors, DEFAULT_POSITION_PCT, |d| d.position_pct).clamp(0.1, 1.0);
    let stop_loss = avg_or(contributors, DEFAULT_STOP_LOSS, |d| d.stop_loss);
    let take_profit = avg_or(contributors, DEFAULT_TAKE_PROFIT, |d| d.take_profit);

    TradeDecision {
        symbol,
        action,
        confidence,
        leverage: Some(leverage as u32),
        position_pct: Some(position_pct),
        stop_loss: Some(stop_loss),
        take_profit: Some(take_profit),
        reasoning: None,
    }
}

/// The decision the executor acts on: the one matching the session symbol
/// when declared, else the first.
pub fn pick_primary<'a>(
    decisions: &'a [TradeDecision],
    session_symbol: Option<&str>,
) -> Option<&'a TradeDecision> {
    if let Some(symbol) = session_symbol {
        if let Some(found) = decisions.iter().find(|d| d.symbol == symbol) {
            return Some(found);
        }
    }
    decisions.first()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(participant: &str, decisions: Vec<TradeDecision>) -> DebateVote {
        DebateVote {
            id: participant.to_string(),
            session_id: "s1".to_string(),
            participant_id: participant.to_string(),
            author: participant.to_string(),
            decisions,
            created_at: 0,
        }
    }

    fn decision(symbol: &str, action: TradeAction, confidence: f64) -> TradeDecision {
        TradeDecision {
            symbol: symbol.to_string(),
            action,
            confidence,
            leverage: None,
            position_pct: None,
            stop_loss: None,
            take_profit: None,
            reasoning: None,
        }
    }

    #[test]
    fn weighted_majority_wins() {
        let votes = vec![
            vote("a", vec![decision("BTCUSDT", TradeAction::OpenLong, 80.0)]),
            vote("b", vec![decision("BTCUSDT", TradeAction::OpenLong, 40.0)]),
            vote("c", vec![decision("BTCUSDT", TradeAction::OpenShort, 70.0)]),
        ];
        let out = compute_consensus(&votes);
        assert_eq!(out.len(), 1);
        // scores: open_long 0.8 + 0.5 (40 floors to 0.5) = 1.3 vs open_short 0.7
        assert_eq!(out[0].action, TradeAction::OpenLong);
        assert_eq!(out[0].confidence, 60.0);
        // defaults applied for openings
        assert_eq!(out[0].leverage, Some(5));
        assert_eq!(out[0].position_pct, Some(0.2));
        assert_eq!(out[0].stop_loss, Some(0.03));
        assert_eq!(out[0].take_profit, Some(0.06));
    }

    #[test]
    fn tie_breaks_on_declared_priority() {
        let votes = vec![
            vote("a", vec![decision("BTCUSDT", TradeAction::OpenLong, 70.0)]),
            vote("b", vec![decision("BTCUSDT", TradeAction::CloseLong, 70.0)]),
        ];
        let out = compute_consensus(&votes);
        assert_eq!(out[0].action, TradeAction::CloseLong);
    }

    #[test]
    fn zero_confidence_still_weighs_half() {
        let votes = vec![
            vote("a", vec![decision("BTCUSDT", TradeAction::OpenShort, 0.0)]),
            vote("b", vec![decision("BTCUSDT", TradeAction::Wait, 40.0)]),
        ];
        // both weigh 0.5; open_short outranks wait on priority
        let out = compute_consensus(&votes);
        assert_eq!(out[0].action, TradeAction::OpenShort);
    }

    #[test]
    fn clamps_averaged_parameters() {
        let mut lev_heavy = decision("ETHUSDT", TradeAction::OpenLong, 90.0);
        lev_heavy.leverage = Some(50);
        lev_heavy.position_pct = Some(0.01);
        let votes = vec![vote("a", vec![lev_heavy])];
        let out = compute_consensus(&votes);
        assert_eq!(out[0].leverage, Some(20));
        assert_eq!(out[0].position_pct, Some(0.1));
    }

    #[test]
    fn multi_coin_votes_and_primary_pick() {
        let votes = vec![
            vote(
                "a",
                vec![
                    decision("BTCUSDT", TradeAction::OpenLong, 80.0),
                    decision("ETHUSDT", TradeAction::Wait, 60.0),
                ],
            ),
            vote("b", vec![decision("ETHUSDT", TradeAction::Wait, 70.0)]),
        ];
        let out = compute_consensus(&votes);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].symbol, "BTCUSDT");

        let primary = pick_primary(&out, Some("ETHUSDT")).unwrap();
        assert_eq!(primary.symbol, "ETHUSDT");
        let primary = pick_primary(&out, None).unwrap();
        assert_eq!(primary.symbol, "BTCUSDT");
    }
}
