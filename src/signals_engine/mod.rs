//! Signal Engine (spec.md §4.4): per-stock, multi-strategy evaluation
//! producing one `TradingSignal` per `(code, date)`, plus stale-row GC.
//! Grounded on the same condition-tree evaluation used by the Backtest
//! Engine, reading the `IndicatorFrame` built over each stock's trailing
//! window rather than a full history.

use crate::conditions::indicators::IndicatorFrame;
use crate::conditions::{all_true, any_true, Params};
use crate::db::models::{ComboConfig, SellMode, SignalAction, Strategy, TradingSignal};
use crate::error::CoreResult;
use chrono::NaiveDate;
use serde_json::json;

pub const TRAILING_WINDOW_DAYS: i64 = 250;
pub const MIN_BARS_REQUIRED: usize = 60;
pub const SENTIMENT_BEARISH_THRESHOLD: f64 = 30.0;
pub const SENTIMENT_MIN_CORROBORATION: usize = 2;
pub const COMMIT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    Start { total: usize, cached: usize, date: NaiveDate },
    Progress { current: usize, total: usize, pct: f64, code: String, name: String },
    Signal(TradingSignal),
    Done { total_generated: usize },
}

struct Leg<'a> {
    name: &'a str,
    buy_conditions: &'a [crate::conditions::Condition],
    sell_conditions: &'a [crate::conditions::Condition],
}

fn legs_of(strategy: &Strategy) -> Vec<Leg<'_>> {
    match &strategy.portfolio_config {
        Some(ComboConfig { members, .. }) => members
            .iter()
            .map(|m| Leg { name: &m.name, buy_conditions: &m.buy_conditions, sell_conditions: &m.sell_conditions })
            .collect(),
        None => vec![Leg { name: &strategy.name, buy_conditions: &strategy.buy_conditions, sell_conditions: &strategy.sell_conditions }],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Triggered {
    Buy,
    Sell,
    None,
}

fn evaluate_strategy(strategy: &Strategy, frame: &IndicatorFrame, idx: usize, held: bool) -> (Triggered, Vec<String>) {
    let legs = legs_of(strategy);
    let (vote_threshold, sell_mode) = match &strategy.portfolio_config {
        Some(cfg) => (cfg.vote_threshold, cfg.sell_mode),
        None => (1, SellMode::Any),
    };

    let mut buy_votes = Vec::new();
    let mut sell_votes = 0usize;
    for leg in &legs {
        if !leg.buy_conditions.is_empty() && all_true(leg.buy_conditions, frame, idx) {
            buy_votes.push(leg.name.to_string());
        }
        if held && !leg.sell_conditions.is_empty() && any_true(leg.sell_conditions, frame, idx) {
            sell_votes += 1;
        }
    }

    let sell_triggered = held
        && if legs.len() == 1 {
            sell_votes >= 1
        } else {
            match sell_mode {
                SellMode::Any => sell_votes >= 1,
                SellMode::Majority => sell_votes * 2 > legs.len(),
            }
        };
    let buy_triggered = buy_votes.len() >= vote_threshold.max(1);

    if sell_triggered {
        (Triggered::Sell, buy_votes)
    } else if buy_triggered {
        (Triggered::Buy, buy_votes)
    } else {
        (Triggered::None, buy_votes)
    }
}

fn alpha_score(frame: &IndicatorFrame, idx: usize) -> (f64, serde_json::Value) {
    let rsi = frame.value_at("RSI", &Params::new(), idx);
    let kdj_k = frame.value_at("KDJ_K", &Params::new(), idx);
    let macd_hist = frame.value_at("MACD_HIST", &Params::new(), idx);
    let macd_hist_prev = if idx > 0 { frame.value_at("MACD_HIST", &Params::new(), idx - 1) } else { None };
    let close = frame.value_at("close", &Params::new(), idx).unwrap_or(0.0);
    let volume = frame.value_at("volume", &Params::new(), idx).unwrap_or(0.0);

    let mut ma20_params = Params::new();
    ma20_params.insert("period".into(), ordered_float::OrderedFloat(20.0));
    let ma20 = frame.value_at("MA", &ma20_params, idx);

    let mut vol_ma5_params = Params::new();
    vol_ma5_params.insert("period".into(), ordered_float::OrderedFloat(5.0));
    let vol_ma5 = frame.value_at("volume", &vol_ma5_params, idx);

    let oversold = rsi.map_or(0.0, |v| (30.0 - v).max(0.0) / 30.0 * 15.0)
        + kdj_k.map_or(0.0, |v| (20.0 - v).max(0.0) / 20.0 * 10.0)
        + match (macd_hist, macd_hist_prev) {
            (Some(now), Some(prev)) if now > prev => 5.0,
            _ => 0.0,
        };

    let vol_component = vol_ma5
        .filter(|v| *v > 0.0)
        .map_or(0.0, |v| ((volume / v - 1.0) * 10.0).max(0.0).min(15.0));
    let price_component = ma20
        .filter(|v| *v > 0.0)
        .map_or(0.0, |v| (((v - close) / v * 100.0) * 3.0).max(0.0).min(15.0));
    let volume_price = vol_component + price_component;

    (oversold, json!({ "oversold": oversold, "volume_price": volume_price, "rsi": rsi, "kdj_k": kdj_k }))
}

pub struct ScanResult {
    pub signals: Vec<TradingSignal>,
    pub events: Vec<Event>,
}

/// Evaluate `strategies` for every `(code, bars)` at `trade_date`. `held_codes`
/// marks which codes currently have an open bot position (sell takes
/// precedence only for those). `sentiment` is the latest market sentiment
/// score, if any.
pub fn scan(
    trade_date: NaiveDate,
    universe: &[(String, Vec<crate::db::models::DailyBar>)],
    strategies: &[Strategy],
    held_codes: &std::collections::HashSet<String>,
    sentiment: Option<f64>,
) -> ScanResult {
    let mut events = vec![Event { kind: EventKind::Start { total: universe.len(), cached: 0, date: trade_date } }];
    let mut signals = Vec::new();
    let total_enabled = strategies.len().max(1);

    for (i, (code, bars)) in universe.iter().enumerate() {
        let pct = (i + 1) as f64 / universe.len().max(1) as f64 * 100.0;
        events.push(Event {
            kind: EventKind::Progress { current: i + 1, total: universe.len(), pct, code: code.clone(), name: String::new() },
        });

        if bars.len() < MIN_BARS_REQUIRED {
            continue;
        }
        let Some(idx) = bars.iter().rposition(|b| b.date == trade_date) else { continue };
        let frame = IndicatorFrame::new(bars);
        let held = held_codes.contains(code);

        let mut triggering = Vec::new();
        let mut sell_hit = false;
        let mut buy_hit = false;
        for strategy in strategies {
            let (t, names) = evaluate_strategy(strategy, &frame, idx, held);
            match t {
                Triggered::Sell => sell_hit = true,
                Triggered::Buy => {
                    buy_hit = true;
                    triggering.push((strategy.name.clone(), names));
                }
                Triggered::None => {}
            }
        }

        let action = if sell_hit {
            SignalAction::Sell
        } else if buy_hit {
            SignalAction::Buy
        } else {
            continue;
        };

        if action == SignalAction::Buy {
            if let Some(score) = sentiment {
                if score < SENTIMENT_BEARISH_THRESHOLD && triggering.len() < SENTIMENT_MIN_CORROBORATION {
                    continue;
                }
            }
        }

        let (oversold, mut component_scores) = alpha_score(&frame, idx);
        let consensus = triggering.len() as f64 / total_enabled as f64 * 40.0;
        let alpha = if action == SignalAction::Buy {
            let volume_price = component_scores.get("volume_price").and_then(|v| v.as_f64()).unwrap_or(0.0);
            (oversold + consensus + volume_price).clamp(0.0, 100.0)
        } else {
            0.0
        };
        if let Some(obj) = component_scores.as_object_mut() {
            obj.insert("consensus".into(), json!(consensus));
        }

        let strategy_names: Vec<String> = triggering.into_iter().map(|(name, _)| name).collect();
        let signal = TradingSignal {
            code: code.clone(),
            date: trade_date,
            action,
            alpha_score: alpha,
            component_scores,
            strategy_names,
        };
        events.push(Event { kind: EventKind::Signal(signal.clone()) });
        signals.push(signal);
    }

    events.push(Event { kind: EventKind::Done { total_generated: signals.len() } });
    ScanResult { signals, events }
}

/// Persist a scan's signals in commit batches, then GC stale rows for the
/// same `trade_date`. Distinct from `scan` so a caller can stream events
/// as they're produced and commit independently.
pub fn persist(
    conn: &rusqlite::Connection,
    trade_date: NaiveDate,
    universe_codes: &[String],
    signals: &[TradingSignal],
) -> CoreResult<usize> {
    for chunk in signals.chunks(COMMIT_BATCH_SIZE) {
        for signal in chunk {
            crate::db::repo::upsert_signal(conn, signal)?;
        }
    }
    let produced: Vec<String> = signals.iter().map(|s| s.code.clone()).collect();
    crate::db::repo::delete_stale_signals(conn, trade_date, universe_codes, &produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{Condition, Operator};
    use crate::db::models::{DailyBar, ExitConfig};

    fn bars(n: usize, start_close: f64) -> Vec<DailyBar> {
        (0..n)
            .map(|i| {
                let c = start_close + i as f64 * 0.1;
                DailyBar {
                    date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                    open: c,
                    high: c * 1.01,
                    low: c * 0.99,
                    close: c,
                    volume: 1_000.0,
                    amount: c * 1_000.0,
                }
            })
            .collect()
    }

    fn strategy(threshold: f64) -> Strategy {
        Strategy {
            id: 1,
            name: "s1".into(),
            description: String::new(),
            buy_conditions: vec![Condition::Value {
                field: "close".into(),
                params: Default::default(),
                operator: Operator::Gt,
                compare_value: threshold,
            }],
            sell_conditions: vec![],
            exit_config: ExitConfig::default(),
            portfolio_config: None,
            category: None,
            source_experiment_id: None,
        }
    }

    #[test]
    fn stocks_under_minimum_bars_are_skipped() {
        let universe = vec![("600000.SH".to_string(), bars(10, 10.0))];
        let date = universe[0].1.last().unwrap().date;
        let result = scan(date, &universe, &[strategy(5.0)], &Default::default(), None);
        assert!(result.signals.is_empty());
    }

    #[test]
    fn buy_signal_emitted_when_condition_holds() {
        let universe = vec![("600000.SH".to_string(), bars(70, 10.0))];
        let date = universe[0].1.last().unwrap().date;
        let result = scan(date, &universe, &[strategy(5.0)], &Default::default(), None);
        assert_eq!(result.signals.len(), 1);
        assert_eq!(result.signals[0].action, SignalAction::Buy);
    }

    #[test]
    fn bearish_sentiment_suppresses_weakly_corroborated_buy() {
        let universe = vec![("600000.SH".to_string(), bars(70, 10.0))];
        let date = universe[0].1.last().unwrap().date;
        let result = scan(date, &universe, &[strategy(5.0)], &Default::default(), Some(10.0));
        assert!(result.signals.is_empty());
    }

    #[test]
    fn persist_gc_only_touches_the_scanned_universe() {
        let pool = crate::db::Pool::open_in_memory().unwrap();
        let conn = pool.get().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        // Pre-existing row for a code that is *not* part of this run's
        // universe (e.g. it fell below the bar-count threshold). GC must not
        // touch it even though it didn't produce a signal this run.
        let untracked = TradingSignal {
            code: "600099.SH".into(),
            date,
            action: SignalAction::Buy,
            alpha_score: 10.0,
            component_scores: serde_json::json!({}),
            strategy_names: vec![],
        };
        crate::db::repo::upsert_signal(&conn, &untracked).unwrap();

        // Pre-existing row for a code that *is* scanned this run but whose
        // buy condition no longer holds (so it produces no signal this
        // scan). GC must delete it.
        let stale = TradingSignal {
            code: "600000.SH".into(),
            date,
            action: SignalAction::Buy,
            alpha_score: 10.0,
            component_scores: serde_json::json!({}),
            strategy_names: vec![],
        };
        crate::db::repo::upsert_signal(&conn, &stale).unwrap();

        // Scan universe contains only "600000.SH", whose bars no longer
        // satisfy the buy condition, so this run produces zero signals.
        let universe = vec![("600000.SH".to_string(), bars(70, 1.0))];
        let result = scan(date, &universe, &[strategy(500.0)], &Default::default(), None);
        assert!(result.signals.is_empty());

        let universe_codes: Vec<String> = universe.iter().map(|(c, _)| c.clone()).collect();
        persist(&conn, date, &universe_codes, &result.signals).unwrap();

        let remaining: Vec<String> = crate::db::repo::signals_for_date(&conn, date)
            .unwrap()
            .into_iter()
            .map(|s| s.code)
            .collect();
        assert_eq!(remaining, vec!["600099.SH".to_string()], "only the untracked code should survive");
    }
}
