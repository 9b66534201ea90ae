//! Performance-metric computation over a completed backtest's trade log
//! and equity curve. Grounded directly on the teacher's `engine/metrics.rs`
//! (same equity-return statistics, same calendar-day guard before reporting
//! annualized figures), extended with `profit_loss_ratio` and
//! `regime_stats` attribution per spec.md §4.3.

use crate::db::models::BacktestTrade;
use chrono::NaiveDate;
use std::collections::HashMap;

/// Below this many calendar days of equity-curve span, CAGR/Calmar are
/// misleadingly inflated and are reported as zero instead.
const MIN_CALENDAR_DAYS_FOR_ANNUALIZED: f64 = 25.0;

#[derive(Debug, Clone, Copy)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegimeStat {
    pub trades: usize,
    pub avg_pnl: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub win_rate: f64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub avg_hold_days: f64,
    pub avg_pnl_pct: f64,
    pub cagr_pct: f64,
    pub sharpe_ratio: f64,
    pub calmar_ratio: f64,
    pub profit_loss_ratio: f64,
    pub sell_reason_stats: HashMap<String, usize>,
    pub regime_stats: HashMap<String, RegimeStat>,
}

pub fn compute(
    trades: &[BacktestTrade],
    equity_curve: &[EquityPoint],
    initial_capital: f64,
) -> BacktestMetrics {
    if initial_capital <= 0.0 {
        return BacktestMetrics::default();
    }

    let (win_rate, avg_hold_days, avg_pnl_pct, profit_loss_ratio) = trade_stats(trades);
    let (total_return_pct, max_drawdown_pct, cagr_pct, sharpe_ratio, calmar_ratio) =
        equity_stats(equity_curve, initial_capital);

    let mut sell_reason_stats: HashMap<String, usize> = HashMap::new();
    for t in trades {
        *sell_reason_stats.entry(t.sell_reason.as_str().to_string()).or_insert(0) += 1;
    }

    let regime_stats = regime_attribution(trades);

    BacktestMetrics {
        total_trades: trades.len(),
        win_rate,
        total_return_pct,
        max_drawdown_pct,
        avg_hold_days,
        avg_pnl_pct,
        cagr_pct,
        sharpe_ratio,
        calmar_ratio,
        profit_loss_ratio,
        sell_reason_stats,
        regime_stats,
    }
}

#[allow(clippy::cast_precision_loss)]
fn trade_stats(trades: &[BacktestTrade]) -> (f64, f64, f64, f64) {
    if trades.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let total = trades.len() as f64;
    let wins: Vec<f64> = trades.iter().filter(|t| t.pnl_pct > 0.0).map(|t| t.pnl_pct).collect();
    let losses: Vec<f64> = trades.iter().filter(|t| t.pnl_pct < 0.0).map(|t| t.pnl_pct).collect();

    let win_rate = wins.len() as f64 / total;
    let avg_hold_days = trades.iter().map(|t| t.hold_days).sum::<i64>() as f64 / total;
    let avg_pnl_pct = trades.iter().map(|t| t.pnl_pct).sum::<f64>() / total;

    let avg_win = if wins.is_empty() { 0.0 } else { wins.iter().sum::<f64>() / wins.len() as f64 };
    let avg_loss = if losses.is_empty() { 0.0 } else { losses.iter().sum::<f64>() / losses.len() as f64 };
    let profit_loss_ratio = if avg_loss != 0.0 { avg_win / avg_loss.abs() } else { 0.0 };

    (win_rate, avg_hold_days, avg_pnl_pct, profit_loss_ratio)
}

#[allow(clippy::cast_precision_loss)]
fn equity_stats(curve: &[EquityPoint], initial_capital: f64) -> (f64, f64, f64, f64, f64) {
    if curve.len() < 2 {
        return (0.0, 0.0, 0.0, 0.0, 0.0);
    }

    let mut returns = Vec::with_capacity(curve.len());
    let mut prev = initial_capital;
    for point in curve {
        if prev > 0.0 {
            returns.push((point.equity - prev) / prev);
        }
        prev = point.equity;
    }
    if returns.is_empty() {
        return (0.0, 0.0, 0.0, 0.0, 0.0);
    }

    let mean_return = returns.iter().sum::<f64>() / returns.len() as f64;
    let std_return = std_dev(&returns);
    let annualization = 252.0_f64.sqrt();
    let sharpe = if std_return > 0.0 { mean_return / std_return * annualization } else { 0.0 };

    let max_drawdown_pct = max_drawdown(curve) * 100.0;

    let final_equity = curve.last().unwrap().equity;
    let total_return_pct = (final_equity - initial_capital) / initial_capital * 100.0;

    let calendar_days = (curve.last().unwrap().date - curve.first().unwrap().date).num_days().max(0) as f64;
    let (cagr_pct, calmar_ratio) = if calendar_days >= MIN_CALENDAR_DAYS_FOR_ANNUALIZED && final_equity > 0.0 {
        let years = calendar_days / 365.0;
        let cagr = ((final_equity / initial_capital).powf(1.0 / years) - 1.0) * 100.0;
        let calmar = if max_drawdown_pct.abs() > 0.0 { cagr / max_drawdown_pct.abs() } else { 0.0 };
        (cagr, calmar)
    } else {
        (0.0, 0.0)
    };

    (total_return_pct, max_drawdown_pct, cagr_pct, sharpe, calmar_ratio)
}

#[allow(clippy::cast_precision_loss)]
fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let mean = data.iter().sum::<f64>() / data.len() as f64;
    let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

fn max_drawdown(curve: &[EquityPoint]) -> f64 {
    let mut peak = curve[0].equity;
    let mut max_dd: f64 = 0.0;
    for point in curve {
        if point.equity > peak {
            peak = point.equity;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - point.equity) / peak);
        }
    }
    max_dd
}

#[allow(clippy::cast_precision_loss)]
fn regime_attribution(trades: &[BacktestTrade]) -> HashMap<String, RegimeStat> {
    let mut buckets: HashMap<String, Vec<f64>> = HashMap::new();
    for t in trades {
        let Some(regime) = t.regime.clone() else {
            continue;
        };
        buckets.entry(regime).or_default().push(t.pnl_pct);
    }
    buckets
        .into_iter()
        .map(|(regime, pnls)| {
            let trades = pnls.len();
            let avg_pnl = pnls.iter().sum::<f64>() / trades as f64;
            let win_rate = pnls.iter().filter(|p| **p > 0.0).count() as f64 / trades as f64;
            (regime, RegimeStat { trades, avg_pnl, win_rate })
        })
        .collect()
}

/// The four-component logistic score (spec.md §4.3). Each weight defaults
/// per `AiLabConfig`; the final value is halved when drawdown exceeds 80%.
pub struct ScoreWeights {
    pub weight_return: f64,
    pub weight_drawdown: f64,
    pub weight_sharpe: f64,
    pub weight_plr: f64,
}

fn sigmoid(x: f64, center: f64, scale: f64) -> f64 {
    1.0 / (1.0 + (-(x - center) / scale).exp())
}

pub fn score(metrics: &BacktestMetrics, weights: &ScoreWeights) -> f64 {
    let ret_score = sigmoid(metrics.total_return_pct, 0.0, 30.0);
    let dd_score = 1.0 - sigmoid(metrics.max_drawdown_pct.abs(), 30.0, 15.0);
    let sharpe_score = sigmoid(metrics.sharpe_ratio, 0.0, 1.5);
    let plr_score = sigmoid(metrics.profit_loss_ratio, 1.0, 1.5);

    let mut total = weights.weight_return * ret_score
        + weights.weight_drawdown * dd_score
        + weights.weight_sharpe * sharpe_score
        + weights.weight_plr * plr_score;

    if metrics.max_drawdown_pct.abs() > 80.0 {
        total *= 0.5;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::SellReason;

    fn trade(pnl_pct: f64, hold_days: i64, reason: SellReason) -> BacktestTrade {
        BacktestTrade {
            code: "600000.SH".into(),
            strategy_name: "s".into(),
            buy_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            buy_price: 10.0,
            sell_date: NaiveDate::from_ymd_opt(2024, 1, 1 + hold_days as u32).unwrap_or_default(),
            sell_price: 10.0 * (1.0 + pnl_pct / 100.0),
            sell_reason: reason,
            pnl_pct,
            pnl_value: pnl_pct,
            hold_days,
            regime: None,
        }
    }

    #[test]
    fn win_rate_and_profit_loss_ratio() {
        let trades = vec![
            trade(10.0, 5, SellReason::TakeProfit),
            trade(-5.0, 3, SellReason::StopLoss),
        ];
        let curve = vec![
            EquityPoint { date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), equity: 100_000.0 },
            EquityPoint { date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(), equity: 105_000.0 },
        ];
        let m = compute(&trades, &curve, 100_000.0);
        assert_eq!(m.total_trades, 2);
        assert!((m.win_rate - 0.5).abs() < 1e-9);
        assert!(m.profit_loss_ratio > 0.0);
    }

    #[test]
    fn empty_trades_yield_zeroed_metrics() {
        let m = compute(&[], &[], 100_000.0);
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.win_rate, 0.0);
    }

    #[test]
    fn score_drops_by_half_on_extreme_drawdown() {
        let weights = ScoreWeights { weight_return: 0.3, weight_drawdown: 0.25, weight_sharpe: 0.25, weight_plr: 0.2 };
        let mut m = BacktestMetrics::default();
        m.max_drawdown_pct = 90.0;
        let with_extreme_dd = score(&m, &weights);
        m.max_drawdown_pct = 5.0;
        let without = score(&m, &weights);
        assert!(with_extreme_dd < without);
    }
}
