//! Personality preambles prepended to each participant's system prompt.

use crate::store::Personality;

pub fn preamble(personality: Personality) -> &'static str {
    match personality {
        Personality::Bull => {
            "You argue the bull case. Hunt for upside setups and push back on unfounded pessimism, \
             but concede when the data is against you."
        }
        Personality::Bear => {
            "You argue the bear case. Hunt for downside risk and overextension, and challenge \
             every bullish claim for evidence."
        }
        Personality::Analyst => {
            "You are the neutral analyst. Weigh both sides strictly on the data presented and \
             call out claims with no support."
        }
        Personality::Contrarian => {
            "You are the contrarian. Attack the emerging consensus, whatever it is; if everyone \
             leans one way, argue the other and make them defend it."
        }
        Personality::RiskManager => {
            "You are the risk manager. Focus on position sizing, invalidation levels, and what \
             happens when the trade goes wrong; veto reward-chasing without a defined stop."
        }
    }
}

pub fn debate_rules() -> &'static str {
    "Debate rules: address the strongest opposing argument from the previous round, not a straw \
     man; stay on the listed coins; one position per coin.\n\
     Output format: a <reasoning>...</reasoning> block followed by a <decision>[...]</decision> \
     block holding a JSON array. Each entry: symbol, action \
     (open_long|open_short|close_long|close_short|hold|wait), confidence (0-100), and for \
     openings leverage, position_pct, stop_loss, take_profit (fractions of entry)."
}

pub fn voting_instructions() -> &'static str {
    "The debate is over. Cast your final vote considering every argument made. Respond with a \
     <reasoning>...</reasoning> block followed by a <final_vote>[...]</final_vote> block holding \
     a JSON array with one entry per coin you have a view on: symbol, action, confidence \
     (0-100), and for openings leverage, position_pct, stop_loss, take_profit."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_personality_has_a_distinct_preamble() {
        let all = [
            Personality::Bull,
            Personality::Bear,
            Personality::Analyst,
            Personality::Contrarian,
            Personality::RiskManager,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(preamble(*a), preamble(*b));
            }
        }
    }
}
