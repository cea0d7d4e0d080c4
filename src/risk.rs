// =============================================================================
// Risk Gate — store-backed pre-trade limits
// =============================================================================
//
// Four limits protect the paper book:
//   1. Open positions  — count of open/closing rows vs MAX_OPEN_POSITIONS.
//   2. Daily trades    — paper fills today vs MAX_DAILY_TRADES.
//   3. Daily loss      — realized P&L today vs -MAX_DAILY_LOSS.
//   4. Position size   — per-entry capital vs MAX_POSITION_SIZE (enforced
//                        through the strike selector's risk budget).
//
// Unlike a purely in-memory breaker, every check reads the store so that
// concurrent workers and restarts all see the same counters.
// =============================================================================

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::store::Store;
use crate::strike::RiskBudget;

const DAY_MS: i64 = 86_400_000;

/// Start of the current UTC day.
pub fn day_start_ms(now_ms: i64) -> i64 {
    now_ms - now_ms.rem_euclid(DAY_MS)
}

/// One limit's current reading, for the monitoring endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RiskLimitInfo {
    pub name: &'static str,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

#[derive(Clone)]
pub struct RiskGate {
    store: Store,
    max_open_positions: i64,
    max_daily_trades: i64,
    max_daily_loss: f64,
    max_position_size: f64,
}

impl RiskGate {
    pub fn new(store: Store, config: &AppConfig) -> Self {
        info!(
            max_open_positions = config.max_open_positions,
            max_daily_trades = config.max_daily_trades,
            max_daily_loss = config.max_daily_loss,
            max_position_size = config.max_position_size,
            "risk gate initialised"
        );
        Self {
            store,
            max_open_positions: config.max_open_positions,
            max_daily_trades: config.max_daily_trades,
            max_daily_loss: config.max_daily_loss,
            max_position_size: config.max_position_size,
        }
    }

    /// Whether a new entry may be created right now. Returns the blocking
    /// reason when not.
    pub async fn can_enter(&self, now_ms: i64) -> Result<(bool, Option<String>)> {
        let open = self.store.count_open_positions().await?;
        if open >= self.max_open_positions {
            let reason = format!("open positions {open} >= cap {}", self.max_open_positions);
            warn!(%reason, "entry blocked");
            return Ok((false, Some(reason)));
        }

        let day_start = day_start_ms(now_ms);
        let fills_today = self.store.count_fills_since(day_start).await?;
        if fills_today >= self.max_daily_trades {
            let reason = format!(
                "daily fills {fills_today} >= cap {}",
                self.max_daily_trades
            );
            warn!(%reason, "entry blocked");
            return Ok((false, Some(reason)));
        }

        let pnl_today = self.store.realized_pnl_since(day_start).await?;
        if pnl_today <= -self.max_daily_loss {
            let reason = format!(
                "daily realized pnl {pnl_today:.0} breaches loss cap {}",
                self.max_daily_loss
            );
            warn!(%reason, "entry blocked");
            return Ok((false, Some(reason)));
        }

        Ok((true, None))
    }

    /// How many more paper fills the executor may perform today.
    pub async fn remaining_daily_fills(&self, now_ms: i64) -> Result<i64> {
        let fills_today = self.store.count_fills_since(day_start_ms(now_ms)).await?;
        Ok((self.max_daily_trades - fills_today).max(0))
    }

    /// Dollar budget handed to the strike selector for a single entry.
    pub fn entry_budget(&self) -> RiskBudget {
        RiskBudget {
            max_premium_loss: self.max_position_size,
            max_capital_allocation: self.max_position_size,
        }
    }

    /// Current limit readings for /monitoring/status.
    pub async fn limits(&self, now_ms: i64) -> Result<Vec<RiskLimitInfo>> {
        let day_start = day_start_ms(now_ms);
        let open = self.store.count_open_positions().await?;
        let fills = self.store.count_fills_since(day_start).await?;
        let pnl = self.store.realized_pnl_since(day_start).await?;

        Ok(vec![
            RiskLimitInfo {
                name: "open_positions",
                current: open as f64,
                limit: self.max_open_positions as f64,
                tripped: open >= self.max_open_positions,
            },
            RiskLimitInfo {
                name: "daily_trades",
                current: fills as f64,
                limit: self.max_daily_trades as f64,
                tripped: fills >= self.max_daily_trades,
            },
            RiskLimitInfo {
                name: "daily_loss",
                current: pnl,
                limit: -self.max_daily_loss,
                tripped: pnl <= -self.max_daily_loss,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::collections::HashMap;

    fn test_config(max_open: &str, max_trades: &str) -> AppConfig {
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("DATABASE_URL", ":memory:".to_string());
        vars.insert("JWT_SECRET", "0123456789abcdef0123456789abcdef".to_string());
        vars.insert("MAX_OPEN_POSITIONS", max_open.to_string());
        vars.insert("MAX_DAILY_TRADES", max_trades.to_string());
        AppConfig::from_vars(|k| vars.get(k).cloned()).unwrap()
    }

    #[test]
    fn day_start_floors_to_utc_midnight() {
        // 2024-03-15T14:30:00Z -> 2024-03-15T00:00:00Z
        assert_eq!(day_start_ms(1_710_513_000_000), 1_710_460_800_000);
        assert_eq!(day_start_ms(1_710_460_800_000), 1_710_460_800_000);
    }

    #[tokio::test]
    async fn empty_book_allows_entry() {
        let store = Store::open_in_memory().unwrap();
        let gate = RiskGate::new(store, &test_config("10", "20"));
        let (allowed, reason) = gate.can_enter(1_710_513_000_000).await.unwrap();
        assert!(allowed);
        assert!(reason.is_none());
        assert_eq!(gate.remaining_daily_fills(1_710_513_000_000).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn limits_snapshot_reports_all_breakers() {
        let store = Store::open_in_memory().unwrap();
        let gate = RiskGate::new(store, &test_config("10", "20"));
        let limits = gate.limits(1_710_513_000_000).await.unwrap();
        assert_eq!(limits.len(), 3);
        assert!(limits.iter().all(|l| !l.tripped));
    }

    #[tokio::test]
    async fn zero_caps_block_entry() {
        let store = Store::open_in_memory().unwrap();
        let gate = RiskGate::new(store, &test_config("0", "20"));
        let (allowed, reason) = gate.can_enter(1_710_513_000_000).await.unwrap();
        assert!(!allowed);
        assert!(reason.unwrap().contains("open positions"));
    }
}
