use anyhow::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{new_id, Store};
use crate::models::TradeDecision;

/// Everything one cycle produced, success or not. Kept for auditability and
/// the trader-detail views.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub trader_id: String,
    pub cycle_number: u64,
    pub created_at: i64,
    pub system_prompt: String,
    pub input_prompt: String,
    pub chain_of_thought: String,
    pub decision_json: String,
    pub raw_response: String,
    pub candidate_coins: Vec<String>,
    pub execution_log: Vec<String>,
    pub decisions: Vec<TradeDecision>,
    pub success: bool,
    pub error_message: String,
    pub ai_request_duration_ms: u64,
}

impl Store {
    pub async fn insert_decision_record(&self, mut rec: DecisionRecord) -> Result<DecisionRecord> {
        if rec.id.is_empty() {
            rec.id = new_id();
        }
        let candidates = serde_json::to_string(&rec.candidate_coins)?;
        let log = serde_json::to_string(&rec.execution_log)?;
        let decisions = serde_json::to_string(&rec.decisions)?;

        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO decision_records (id, trader_id, cycle_number, created_at, system_prompt,
             input_prompt, chain_of_thought, decision_json, raw_response, candidate_coins,
             execution_log, decisions, success, error_message, ai_request_duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                &rec.id,
                &rec.trader_id,
                rec.cycle_number as i64,
                rec.created_at,
                &rec.system_prompt,
                &rec.input_prompt,
                &rec.chain_of_thought,
                &rec.decision_json,
                &rec.raw_response,
                &candidates,
                &log,
                &decisions,
                rec.success as i64,
                &rec.error_message,
                rec.ai_request_duration_ms as i64
            ],
        )?;
        Ok(rec)
    }

    pub async fn list_decision_records(
        &self,
        trader_id: &str,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>> {
        let limit = limit.clamp(1, 500) as i64;
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, trader_id, cycle_number, created_at, system_prompt, input_prompt,
             chain_of_thought, decision_json, raw_response, candidate_coins, execution_log,
             decisions, success, error_message, ai_request_duration_ms
             FROM decision_records WHERE trader_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let out = stmt
            .query_map(params![trader_id, limit], |row| {
                let candidates: String = row.get(9)?;
                let log: String = row.get(10)?;
                let decisions: String = row.get(11)?;
                Ok(DecisionRecord {
                    id: row.get(0)?,
                    trader_id: row.get(1)?,
                    cycle_number: row.get::<_, i64>(2)?.max(0) as u64,
                    created_at: row.get(3)?,
                    system_prompt: row.get(4)?,
                    input_prompt: row.get(5)?,
                    chain_of_thought: row.get(6)?,
                    decision_json: row.get(7)?,
                    raw_response: row.get(8)?,
                    candidate_coins: serde_json::from_str(&candidates).unwrap_or_default(),
                    execution_log: serde_json::from_str(&log).unwrap_or_default(),
                    decisions: serde_json::from_str(&decisions).unwrap_or_default(),
                    success: row.get::<_, i64>(12)? != 0,
                    error_message: row.get(13)?,
                    ai_request_duration_ms: row.get::<_, i64>(14)?.max(0) as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeAction;

    #[tokio::test]
    async fn record_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let rec = DecisionRecord {
            trader_id: "t1".to_string(),
            cycle_number: 7,
            created_at: 1000,
            candidate_coins: vec!["BTCUSDT".to_string()],
            execution_log: vec!["submitted BTCUSDT open_long".to_string()],
            decisions: vec![TradeDecision {
                symbol: "BTCUSDT".to_string(),
                action: TradeAction::OpenLong,
                confidence: 80.0,
                leverage: Some(5),
                position_pct: Some(0.2),
                stop_loss: Some(0.03),
                take_profit: Some(0.06),
                reasoning: None,
            }],
            success: true,
            ..Default::default()
        };
        store.insert_decision_record(rec).await.unwrap();

        let loaded = store.list_decision_records("t1", 10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].cycle_number, 7);
        assert_eq!(loaded[0].decisions[0].action, TradeAction::OpenLong);
        assert!(loaded[0].success);
    }
}
