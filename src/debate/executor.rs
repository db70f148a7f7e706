//! Acting on a completed debate: the primary consensus decision goes through
//! the trader's normal risk-enforced execution path, exactly once.

use anyhow::{anyhow, Result};
use tracing::info;

use crate::models::round2;
use crate::store::{DebateStatus, Store};
use crate::trader::TraderRuntime;

/// Minimum notional the executor will submit, in USD.
const MIN_EXECUTION_USD: f64 = 12.0;

/// Execute the session's primary decision through `runtime`. Requires a
/// completed, not-yet-executed session; marks it executed afterwards so a
/// second call is rejected.
pub async fn execute_consensus(
    store: &Store,
    session_id: &str,
    runtime: &TraderRuntime,
) -> Result<Vec<String>> {
    let session = store
        .get_debate_session(session_id)
        .await?
        .ok_or_else(|| anyhow!("debate session {session_id} not found"))?;
    if session.status != DebateStatus::Completed {
        return Err(anyhow!(
            "debate {} is {}, expected completed",
            session_id,
            session.status.as_str()
        ));
    }
    if session.executed {
        return Err(anyhow!("debate {session_id} already executed"));
    }
    let mut decision = session
        .primary_decision
        .clone()
        .ok_or_else(|| anyhow!("debate {session_id} has no consensus decision"))?;

    if decision.action.is_open() {
        let account = runtime.deps().adapter.account_info().await?;
        let pct = decision.position_pct.unwrap_or(0.2);
        let size = (account.available_balance * pct).max(MIN_EXECUTION_USD);
        // Pin the sizing the debate agreed on; the risk caps still apply
        // downstream.
        decision.position_pct = if account.available_balance > 0.0 {
            Some((size / account.available_balance).min(1.0))
        } else {
            decision.position_pct
        };

        let mark = runtime.deps().adapter.mark_price(&decision.symbol).await?;
        info!(
            session = %session_id,
            symbol = %decision.symbol,
            size_usd = round2(size),
            mark,
            "executing consensus"
        );
    }

    let log = runtime.execute_decision(decision).await?;
    store.set_debate_executed(session_id).await?;
    Ok(log)
}
