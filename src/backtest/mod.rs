//! Portfolio Backtest Engine: bar-by-bar simulation, regime attribution,
//! and the scoring formula consumed by the Experiment Runner.

pub mod engine;
pub mod metrics;
pub mod types;

pub use engine::run;
pub use metrics::{score, BacktestMetrics, EquityPoint, ScoreWeights};
pub use types::{BacktestInputs, BacktestOutcome};

use crate::config::AiLabConfig;

impl From<&AiLabConfig> for ScoreWeights {
    fn from(cfg: &AiLabConfig) -> Self {
        Self {
            weight_return: cfg.weight_return,
            weight_drawdown: cfg.weight_drawdown,
            weight_sharpe: cfg.weight_sharpe,
            weight_plr: cfg.weight_plr,
        }
    }
}
