//! Per-day portfolio simulation loop (spec.md §4.3). Grounded on the
//! teacher's `engine/` simulation pass for the entry/exit/mark-to-market
//! sequencing; the combo voting and regime attribution are additions.

use crate::conditions::indicators::IndicatorFrame;
use crate::conditions::{all_true, any_true, Condition};
use crate::db::models::{ComboConfig, DailyBar, SellMode, SellReason, Strategy};
use crate::error::{CoreError, CoreResult};
use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};
use tokio_util::sync::CancellationToken;

use super::metrics::EquityPoint;
use super::types::{BacktestInputs, BacktestOutcome, ClosedTrade, OpenPosition, EXPLOSION_THRESHOLD};

struct Leg {
    name: String,
    buy_conditions: Vec<Condition>,
    sell_conditions: Vec<Condition>,
}

struct Plan {
    legs: Vec<Leg>,
    vote_threshold: usize,
    sell_mode: SellMode,
}

fn build_plan(strategy: &Strategy) -> Plan {
    match &strategy.portfolio_config {
        Some(ComboConfig { members, vote_threshold, sell_mode }) => Plan {
            legs: members
                .iter()
                .map(|m| Leg {
                    name: m.name.clone(),
                    buy_conditions: m.buy_conditions.clone(),
                    sell_conditions: m.sell_conditions.clone(),
                })
                .collect(),
            vote_threshold: *vote_threshold,
            sell_mode: *sell_mode,
        },
        None => Plan {
            legs: vec![Leg {
                name: strategy.name.clone(),
                buy_conditions: strategy.buy_conditions.clone(),
                sell_conditions: strategy.sell_conditions.clone(),
            }],
            vote_threshold: 1,
            sell_mode: SellMode::Any,
        },
    }
}

/// Run one backtest of `strategy` over `inputs`. Returns `CoreError::SignalExplosion`
/// if a single day's entry pass would open more than `EXPLOSION_THRESHOLD` positions,
/// or `CoreError::BacktestTimeout` if `cancel` fires mid-run.
pub fn run(strategy: &Strategy, inputs: &BacktestInputs, cancel: &CancellationToken) -> CoreResult<BacktestOutcome> {
    let plan = build_plan(strategy);

    let frames: HashMap<&str, (IndicatorFrame<'_>, HashMap<NaiveDate, usize>)> = inputs
        .bars
        .iter()
        .map(|(code, bars)| {
            let by_date: HashMap<NaiveDate, usize> = bars.iter().enumerate().map(|(i, b)| (b.date, i)).collect();
            (code.as_str(), (IndicatorFrame::new(bars), by_date))
        })
        .collect();

    let time_grid: BTreeSet<NaiveDate> = inputs.bars.values().flat_map(|bars| bars.iter().map(|b| b.date)).collect();

    let mut cash = inputs.initial_capital;
    let mut positions: HashMap<String, (OpenPosition, usize)> = HashMap::new();
    let mut trades: Vec<ClosedTrade> = Vec::new();
    let mut equity_curve: Vec<EquityPoint> = Vec::new();
    let mut sell_reason_stats: HashMap<String, usize> = HashMap::new();
    let mut last_close: HashMap<String, f64> = HashMap::new();

    let codes_sorted: Vec<String> = {
        let mut v: Vec<String> = inputs.bars.keys().cloned().collect();
        v.sort();
        v
    };

    for &day in &time_grid {
        if cancel.is_cancelled() {
            return Err(CoreError::BacktestTimeout);
        }

        // --- exit pass ---
        let held_codes: Vec<String> = positions.keys().cloned().collect();
        for code in held_codes {
            let Some((_, by_date)) = frames.get(code.as_str()) else { continue };
            let Some(&idx) = by_date.get(&day) else { continue };
            let bar = &inputs.bars[&code][idx];
            let (pos, leg_idx) = positions.get(&code).unwrap();
            let leg = &plan.legs[*leg_idx];

            let stop_price = pos.buy_price * (1.0 + strategy.exit_config.stop_loss_pct / 100.0);
            let profit_price = pos.buy_price * (1.0 + strategy.exit_config.take_profit_pct / 100.0);
            let hold_days = (day - pos.buy_date).num_days();

            let exit = if bar.low <= stop_price {
                Some((SellReason::StopLoss, fill_price(stop_price, bar)))
            } else if bar.high >= profit_price {
                Some((SellReason::TakeProfit, fill_price(profit_price, bar)))
            } else if hold_days >= i64::from(strategy.exit_config.max_hold_days) {
                Some((SellReason::MaxHold, bar.close))
            } else if sell_signal(leg, &plan, day, &frames, &positions, &code) {
                Some((SellReason::Signal, bar.close))
            } else {
                None
            };

            if let Some((reason, sell_price)) = exit {
                let (pos, _) = positions.remove(&code).unwrap();
                cash += pos.shares * sell_price;
                let pnl_value = (sell_price - pos.buy_price) * pos.shares;
                let pnl_pct = (sell_price - pos.buy_price) / pos.buy_price * 100.0;
                *sell_reason_stats.entry(reason.as_str().to_string()).or_insert(0) += 1;
                trades.push(ClosedTrade {
                    code: pos.code,
                    strategy_name: pos.member_name,
                    buy_date: pos.buy_date,
                    buy_price: pos.buy_price,
                    sell_date: day,
                    sell_price,
                    sell_reason: reason,
                    pnl_pct,
                    pnl_value,
                    hold_days,
                });
            }
        }

        // --- entry pass ---
        let equity_before_entries = cash
            + positions
                .values()
                .map(|(p, _)| last_close.get(&p.code).copied().unwrap_or(p.buy_price) * p.shares)
                .sum::<f64>();

        let mut triggered: Vec<(String, usize)> = Vec::new();
        for code in &codes_sorted {
            if positions.contains_key(code) {
                continue;
            }
            let Some((frame, by_date)) = frames.get(code.as_str()) else { continue };
            let Some(&idx) = by_date.get(&day) else { continue };

            let mut votes = 0usize;
            let mut first_leg = None;
            for (i, leg) in plan.legs.iter().enumerate() {
                if !leg.buy_conditions.is_empty() && all_true(&leg.buy_conditions, frame, idx) {
                    votes += 1;
                    if first_leg.is_none() {
                        first_leg = Some(i);
                    }
                }
            }
            if votes >= plan.vote_threshold.max(1) {
                if let Some(leg_idx) = first_leg {
                    triggered.push((code.clone(), leg_idx));
                }
            }
        }

        if triggered.len() > EXPLOSION_THRESHOLD {
            return Err(CoreError::SignalExplosion { name: strategy.name.clone(), day, count: triggered.len() });
        }

        for (code, leg_idx) in triggered {
            if positions.len() >= inputs.max_positions {
                break;
            }
            let Some((_, by_date)) = frames.get(code.as_str()) else { continue };
            let Some(&idx) = by_date.get(&day) else { continue };
            let bar = &inputs.bars[&code][idx];

            let notional = (inputs.max_position_pct / 100.0 * equity_before_entries).min(cash);
            if notional <= 0.0 {
                continue;
            }
            let shares = notional / bar.close;
            cash -= notional;
            positions.insert(
                code.clone(),
                (
                    OpenPosition {
                        code: code.clone(),
                        member_name: plan.legs[leg_idx].name.clone(),
                        buy_date: day,
                        buy_price: bar.close,
                        shares,
                        notional,
                    },
                    leg_idx,
                ),
            );
        }

        // --- mark to market ---
        let mut equity = cash;
        for (pos, _) in positions.values() {
            let price = frames
                .get(pos.code.as_str())
                .and_then(|(_, by_date)| by_date.get(&day))
                .map(|&idx| inputs.bars[&pos.code][idx].close)
                .unwrap_or_else(|| last_close.get(&pos.code).copied().unwrap_or(pos.buy_price));
            last_close.insert(pos.code.clone(), price);
            equity += price * pos.shares;
        }
        equity_curve.push(EquityPoint { date: day, equity });
    }

    Ok(BacktestOutcome { trades, equity_curve, sell_reason_stats })
}

fn fill_price(threshold: f64, bar: &DailyBar) -> f64 {
    if threshold >= bar.low && threshold <= bar.high {
        threshold
    } else {
        bar.close
    }
}

fn sell_signal(
    leg: &Leg,
    plan: &Plan,
    day: NaiveDate,
    frames: &HashMap<&str, (IndicatorFrame<'_>, HashMap<NaiveDate, usize>)>,
    positions: &HashMap<String, (OpenPosition, usize)>,
    code: &str,
) -> bool {
    let Some((frame, by_date)) = frames.get(code) else { return false };
    let Some(&idx) = by_date.get(&day) else { return false };
    let _ = positions;

    if plan.legs.len() == 1 {
        return any_true(&leg.sell_conditions, frame, idx);
    }

    let votes = plan
        .legs
        .iter()
        .filter(|l| !l.sell_conditions.is_empty() && any_true(&l.sell_conditions, frame, idx))
        .count();

    match plan.sell_mode {
        SellMode::Any => votes >= 1,
        SellMode::Majority => votes * 2 >= plan.legs.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{Condition, Operator};
    use crate::db::models::ExitConfig;

    fn bars(closes: &[f64]) -> Vec<DailyBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| DailyBar {
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                open: c,
                high: c * 1.01,
                low: c * 0.99,
                close: c,
                volume: 1_000.0,
                amount: c * 1_000.0,
            })
            .collect()
    }

    fn simple_strategy() -> Strategy {
        Strategy {
            id: 1,
            name: "trend".into(),
            description: String::new(),
            buy_conditions: vec![Condition::Value {
                field: "close".into(),
                params: Default::default(),
                operator: Operator::Gt,
                compare_value: 9.0,
            }],
            sell_conditions: vec![Condition::Value {
                field: "close".into(),
                params: Default::default(),
                operator: Operator::Lt,
                compare_value: 5.0,
            }],
            exit_config: ExitConfig { stop_loss_pct: -8.0, take_profit_pct: 20.0, max_hold_days: 20 },
            portfolio_config: None,
            category: None,
            source_experiment_id: None,
        }
    }

    #[test]
    fn buys_when_close_exceeds_threshold_and_marks_equity() {
        let strategy = simple_strategy();
        let mut inputs = BacktestInputs::default();
        inputs.bars.insert("600000.SH".into(), bars(&[8.0, 9.5, 10.0, 10.5, 11.0]));
        let token = CancellationToken::new();
        let outcome = run(&strategy, &inputs, &token).unwrap();
        assert!(!outcome.equity_curve.is_empty());
    }

    #[test]
    fn take_profit_closes_position() {
        let mut strategy = simple_strategy();
        strategy.exit_config.take_profit_pct = 5.0;
        let mut inputs = BacktestInputs::default();
        inputs.bars.insert("600000.SH".into(), bars(&[9.5, 10.0, 11.0, 11.5, 12.0]));
        let token = CancellationToken::new();
        let outcome = run(&strategy, &inputs, &token).unwrap();
        assert!(outcome.trades.iter().any(|t| t.sell_reason == SellReason::TakeProfit));
    }

    #[test]
    fn cancellation_aborts_immediately() {
        let strategy = simple_strategy();
        let mut inputs = BacktestInputs::default();
        inputs.bars.insert("600000.SH".into(), bars(&[9.5, 10.0, 11.0]));
        let token = CancellationToken::new();
        token.cancel();
        let result = run(&strategy, &inputs, &token);
        assert!(matches!(result, Err(CoreError::BacktestTimeout)));
    }
}
