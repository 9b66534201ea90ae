//! Domain entities from spec §3, as plain Rust structs. Condition trees
//! and exit configs are stored as JSON text columns and (de)serialized at
//! the repository boundary; everything else maps 1:1 onto a SQLite row.

use crate::conditions::Condition;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stock {
    pub code: String,
    pub name: String,
    pub market: String,
    pub industry: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub amount: f64,
}

impl DailyBar {
    /// `low <= open,close <= high`, `volume >= 0` — spec §3 invariant.
    pub fn is_consistent(&self) -> bool {
        self.volume >= 0.0
            && self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub is_open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExitConfig {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_hold_days: i32,
}

impl ExitConfig {
    pub const DEFAULT_STOP_LOSS_PCT: f64 = -8.0;
    pub const DEFAULT_TAKE_PROFIT_PCT: f64 = 20.0;
    pub const DEFAULT_MAX_HOLD_DAYS: i32 = 20;

    /// Clamp/fill per spec §4.2 step 9.
    pub fn normalize(mut self) -> Self {
        if self.stop_loss_pct > 0.0 {
            self.stop_loss_pct = Self::DEFAULT_STOP_LOSS_PCT;
        }
        if self.stop_loss_pct == 0.0 {
            self.stop_loss_pct = Self::DEFAULT_STOP_LOSS_PCT;
        }
        if self.take_profit_pct < 0.0 {
            self.take_profit_pct = Self::DEFAULT_TAKE_PROFIT_PCT;
        }
        if self.take_profit_pct == 0.0 {
            self.take_profit_pct = Self::DEFAULT_TAKE_PROFIT_PCT;
        }
        if self.max_hold_days < 1 {
            self.max_hold_days = Self::DEFAULT_MAX_HOLD_DAYS;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboMember {
    pub name: String,
    pub buy_conditions: Vec<Condition>,
    pub sell_conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SellMode {
    Any,
    Majority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboConfig {
    pub members: Vec<ComboMember>,
    pub vote_threshold: usize,
    pub sell_mode: SellMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub buy_conditions: Vec<Condition>,
    pub sell_conditions: Vec<Condition>,
    pub exit_config: ExitConfig,
    pub portfolio_config: Option<ComboConfig>,
    pub category: Option<String>,
    pub source_experiment_id: Option<i64>,
}

impl Strategy {
    pub fn is_combo(&self) -> bool {
        self.portfolio_config.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Generating,
    Backtesting,
    Done,
    Failed,
}

impl ExperimentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Backtesting => "backtesting",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "generating" => Self::Generating,
            "backtesting" => Self::Backtesting,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Terminal statuses do not transition further except for an admin
    /// forced reset (spec §3 invariant on `Experiment`).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Template,
    Custom,
    Clone,
    Combo,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Custom => "custom",
            Self::Clone => "clone",
            Self::Combo => "combo",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "custom" => Self::Custom,
            "clone" => Self::Clone,
            "combo" => Self::Combo,
            _ => Self::Template,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStrategyStatus {
    Pending,
    Backtesting,
    Done,
    Invalid,
    Failed,
}

impl ExperimentStrategyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Backtesting => "backtesting",
            Self::Done => "done",
            Self::Invalid => "invalid",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "backtesting" => Self::Backtesting,
            "done" => Self::Done,
            "invalid" => Self::Invalid,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Invalid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub theme: String,
    pub source_type: SourceType,
    pub source_text: String,
    pub status: ExperimentStatus,
    pub capital: f64,
    pub max_positions: u32,
    pub max_position_pct: f64,
    pub strategy_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentStrategy {
    pub id: i64,
    pub experiment_id: i64,
    pub name: String,
    pub buy_conditions: Vec<Condition>,
    pub sell_conditions: Vec<Condition>,
    pub exit_config: ExitConfig,
    pub status: ExperimentStrategyStatus,
    pub error_message: Option<String>,
    pub total_trades: i64,
    pub win_rate: f64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub avg_hold_days: f64,
    pub avg_pnl_pct: f64,
    pub score: f64,
    pub regime_stats: Option<serde_json::Value>,
    pub combo_config: Option<ComboConfig>,
    pub backtest_run_id: Option<i64>,
    pub promoted_strategy_id: Option<i64>,
    pub seq: i64,
}

impl ExperimentStrategy {
    /// spec §9 open question 3: retryable iff buy_conditions is non-empty.
    pub fn is_retryable(&self) -> bool {
        !self.buy_conditions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SellReason {
    StopLoss,
    TakeProfit,
    MaxHold,
    Signal,
}

impl SellReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::MaxHold => "max_hold",
            Self::Signal => "signal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTrade {
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
    pub regime: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    TrendingBull,
    TrendingBear,
    Ranging,
    Volatile,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrendingBull => "trending_bull",
            Self::TrendingBear => "trending_bear",
            Self::Ranging => "ranging",
            Self::Volatile => "volatile",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "trending_bear" => Self::TrendingBear,
            "volatile" => Self::Volatile,
            "ranging" => Self::Ranging,
            _ => Self::TrendingBull,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegimeLabel {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub regime: Regime,
    pub confidence: f64,
    pub trend_strength: f64,
    pub volatility: f64,
    pub index_return_pct: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub code: String,
    pub date: NaiveDate,
    pub action: SignalAction,
    pub alpha_score: f64,
    pub component_scores: serde_json::Value,
    pub strategy_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "sell" {
            Self::Sell
        } else {
            Self::Buy
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Executed,
    Expired,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePlan {
    pub id: i64,
    pub code: String,
    pub direction: Direction,
    pub plan_price: f64,
    pub quantity: i64,
    pub sell_pct: Option<f64>,
    pub plan_date: NaiveDate,
    pub status: PlanStatus,
    pub execution_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotPortfolio {
    pub code: String,
    pub quantity: i64,
    pub avg_cost: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotTrade {
    pub code: String,
    pub action: TradeAction,
    pub quantity: i64,
    pub price: f64,
    pub amount: f64,
    pub trade_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotTradeReview {
    pub code: String,
    pub opened_at: NaiveDate,
    pub closed_at: NaiveDate,
    pub avg_cost: f64,
    pub exit_price: f64,
    pub pnl_pct: f64,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRecommendation {
    pub stock_code: String,
    pub stock_name: String,
    pub action: RecommendationAction,
    pub reason: String,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub target: Option<f64>,
    pub alpha_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationAction {
    Buy,
    Sell,
    Hold,
    Reduce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiReport {
    pub id: i64,
    pub report_date: NaiveDate,
    pub report_type: String,
    pub market_regime: Option<String>,
    pub market_regime_confidence: Option<f64>,
    pub thinking_process: Option<String>,
    pub summary: Option<String>,
    pub recommendations: Vec<AiRecommendation>,
    pub strategy_actions: Vec<serde_json::Value>,
}
