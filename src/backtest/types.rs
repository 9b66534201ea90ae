use crate::db::models::{Regime, SellReason};
use chrono::NaiveDate;
use std::collections::HashMap;

/// Entry-pass cap: a single day's trigger count beyond this is almost
/// certainly a validator escape (a condition that's always true), not a
/// real market event.
pub const EXPLOSION_THRESHOLD: usize = 50;

#[derive(Debug, Clone)]
pub struct BacktestInputs {
    pub bars: HashMap<String, Vec<crate::db::models::DailyBar>>,
    pub regimes: HashMap<NaiveDate, Regime>,
    pub initial_capital: f64,
    pub max_positions: usize,
    pub max_position_pct: f64,
}

impl Default for BacktestInputs {
    fn default() -> Self {
        Self {
            bars: HashMap::new(),
            regimes: HashMap::new(),
            initial_capital: 100_000.0,
            max_positions: 10,
            max_position_pct: 30.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub code: String,
    pub member_name: String,
    pub buy_date: NaiveDate,
    pub buy_price: f64,
    pub shares: f64,
    pub notional: f64,
}

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub code: String,
    pub strategy_name: String,
    pub buy_date: NaiveDate,
    pub buy_price: f64,
    pub sell_date: NaiveDate,
    pub sell_price: f64,
    pub sell_reason: SellReason,
    pub pnl_pct: f64,
    pub pnl_value: f64,
    pub hold_days: i64,
}

impl ClosedTrade {
    pub fn into_model(self, regime: Option<Regime>) -> crate::db::models::BacktestTrade {
        crate::db::models::BacktestTrade {
            code: self.code,
            strategy_name: self.strategy_name,
            buy_date: self.buy_date,
            buy_price: self.buy_price,
            sell_date: self.sell_date,
            sell_price: self.sell_price,
            sell_reason: self.sell_reason,
            pnl_pct: self.pnl_pct,
            pnl_value: self.pnl_value,
            hold_days: self.hold_days,
            regime: regime.map(|r| r.as_str().to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BacktestOutcome {
    pub trades: Vec<ClosedTrade>,
    pub equity_curve: Vec<super::metrics::EquityPoint>,
    pub sell_reason_stats: HashMap<String, usize>,
}
