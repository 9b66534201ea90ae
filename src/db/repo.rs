//! Row-level CRUD and query functions over the schema in `migrations/`.
//! Every function takes a `&Connection` (a pooled checkout from `db::Pool`)
//! rather than the pool itself, so callers control transaction boundaries.

use super::models::{
    AiReport, BacktestTrade, BotPortfolio, BotTrade, CalendarDay, DailyBar,
    Experiment, ExperimentStatus, ExperimentStrategy, ExperimentStrategyStatus, ExitConfig,
    MarketRegimeLabel, Regime, SellReason, SignalAction, SourceType, Stock, Strategy, TradeAction,
    TradePlan, TradingSignal,
};
use crate::conditions::Condition;
use crate::error::{CoreError, CoreResult};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};

fn conditions_to_json(c: &[Condition]) -> String {
    serde_json::to_string(c).unwrap_or_else(|_| "[]".into())
}

fn conditions_from_json(s: &str) -> Vec<Condition> {
    serde_json::from_str(s).unwrap_or_default()
}

fn date_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_default()
}

// ---- stock / watchlist ----------------------------------------------------

pub fn upsert_stock(conn: &Connection, stock: &Stock) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO stock (code, name, market, industry) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(code) DO UPDATE SET name = excluded.name, market = excluded.market, industry = excluded.industry",
        params![stock.code, stock.name, stock.market, stock.industry],
    )?;
    Ok(())
}

pub fn add_to_watchlist(conn: &Connection, code: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO watchlist (stock_code) VALUES (?1)",
        params![code],
    )?;
    Ok(())
}

pub fn remove_from_watchlist(conn: &Connection, code: &str) -> CoreResult<()> {
    conn.execute("DELETE FROM watchlist WHERE stock_code = ?1", params![code])?;
    Ok(())
}

pub fn watchlist_codes(conn: &Connection) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT stock_code FROM watchlist ORDER BY stock_code")?;
    let rows = stmt.query_map([], |r| r.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn is_watched(conn: &Connection, code: &str) -> CoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM watchlist WHERE stock_code = ?1",
        params![code],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

pub fn all_stock_codes(conn: &Connection) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT code FROM stock ORDER BY code")?;
    let rows = stmt.query_map([], |r| r.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

// ---- daily_price -----------------------------------------------------------

fn bar_from_row(row: &Row) -> rusqlite::Result<DailyBar> {
    let date: String = row.get(0)?;
    Ok(DailyBar {
        date: parse_date(&date),
        open: row.get(1)?,
        high: row.get(2)?,
        low: row.get(3)?,
        close: row.get(4)?,
        volume: row.get(5)?,
        amount: row.get(6)?,
    })
}

pub fn upsert_daily_bar(conn: &Connection, code: &str, bar: &DailyBar) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO daily_price (code, date, open, high, low, close, volume, amount)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(code, date) DO UPDATE SET
            open = excluded.open, high = excluded.high, low = excluded.low,
            close = excluded.close, volume = excluded.volume, amount = excluded.amount",
        params![
            code,
            date_str(bar.date),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.amount
        ],
    )?;
    Ok(())
}

pub fn daily_bars(
    conn: &Connection,
    code: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> CoreResult<Vec<DailyBar>> {
    let mut stmt = conn.prepare(
        "SELECT date, open, high, low, close, volume, amount FROM daily_price
         WHERE code = ?1 AND date BETWEEN ?2 AND ?3 ORDER BY date ASC",
    )?;
    let rows = stmt.query_map(params![code, date_str(start), date_str(end)], bar_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn trailing_window(conn: &Connection, code: &str, end: NaiveDate, n: usize) -> CoreResult<Vec<DailyBar>> {
    let mut stmt = conn.prepare(
        "SELECT date, open, high, low, close, volume, amount FROM
         (SELECT date, open, high, low, close, volume, amount FROM daily_price
          WHERE code = ?1 AND date <= ?2 ORDER BY date DESC LIMIT ?3)
         ORDER BY date ASC",
    )?;
    let rows = stmt.query_map(params![code, date_str(end), n as i64], bar_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

// ---- index_daily -----------------------------------------------------------

pub fn upsert_index_bar(conn: &Connection, code: &str, bar: &DailyBar) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO index_daily (code, date, open, high, low, close, volume, amount)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(code, date) DO UPDATE SET
            open = excluded.open, high = excluded.high, low = excluded.low,
            close = excluded.close, volume = excluded.volume, amount = excluded.amount",
        params![
            code,
            date_str(bar.date),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.amount
        ],
    )?;
    Ok(())
}

pub fn index_daily_bars(conn: &Connection, code: &str, start: NaiveDate, end: NaiveDate) -> CoreResult<Vec<DailyBar>> {
    let mut stmt = conn.prepare(
        "SELECT date, open, high, low, close, volume, amount FROM index_daily
         WHERE code = ?1 AND date BETWEEN ?2 AND ?3 ORDER BY date ASC",
    )?;
    let rows = stmt.query_map(params![code, date_str(start), date_str(end)], bar_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn latest_bar_date(conn: &Connection, code: &str) -> CoreResult<Option<NaiveDate>> {
    let v: Option<String> = conn
        .query_row(
            "SELECT max(date) FROM daily_price WHERE code = ?1",
            params![code],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok(v.map(|s| parse_date(&s)))
}

// ---- trading_calendar -------------------------------------------------------

pub fn is_trading_day(conn: &Connection, exchange: &str, date: NaiveDate) -> CoreResult<bool> {
    let is_open: Option<i64> = conn
        .query_row(
            "SELECT is_open FROM trading_calendar WHERE exchange = ?1 AND date = ?2",
            params![exchange, date_str(date)],
            |r| r.get(0),
        )
        .optional()?;
    Ok(is_open.unwrap_or(0) != 0)
}

pub fn open_dates_between(
    conn: &Connection,
    exchange: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> CoreResult<Vec<NaiveDate>> {
    let mut stmt = conn.prepare(
        "SELECT date FROM trading_calendar WHERE exchange = ?1 AND date BETWEEN ?2 AND ?3
         AND is_open = 1 ORDER BY date ASC",
    )?;
    let rows = stmt.query_map(
        params![exchange, date_str(start), date_str(end)],
        |r| r.get::<_, String>(0),
    )?;
    Ok(rows.map(|r| r.map(|s| parse_date(&s))).collect::<Result<_, _>>()?)
}

pub fn upsert_calendar_day(conn: &Connection, exchange: &str, day: CalendarDay) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO trading_calendar (exchange, date, is_open) VALUES (?1, ?2, ?3)
         ON CONFLICT(exchange, date) DO UPDATE SET is_open = excluded.is_open",
        params![exchange, date_str(day.date), day.is_open as i64],
    )?;
    Ok(())
}

// ---- strategy ----------------------------------------------------------------

fn strategy_from_row(row: &Row) -> rusqlite::Result<Strategy> {
    let buy: String = row.get(3)?;
    let sell: String = row.get(4)?;
    let exit: String = row.get(5)?;
    let portfolio: Option<String> = row.get(6)?;
    Ok(Strategy {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        buy_conditions: conditions_from_json(&buy),
        sell_conditions: conditions_from_json(&sell),
        exit_config: serde_json::from_str(&exit).unwrap_or_default(),
        portfolio_config: portfolio.and_then(|p| serde_json::from_str(&p).ok()),
        category: row.get(7)?,
        source_experiment_id: row.get(8)?,
    })
}

pub fn insert_strategy(conn: &Connection, s: &Strategy) -> CoreResult<i64> {
    conn.execute(
        "INSERT INTO strategy (name, description, buy_conditions, sell_conditions, exit_config, portfolio_config, category, source_experiment_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            s.name,
            s.description,
            conditions_to_json(&s.buy_conditions),
            conditions_to_json(&s.sell_conditions),
            serde_json::to_string(&s.exit_config).unwrap_or_default(),
            s.portfolio_config.as_ref().map(|c| serde_json::to_string(c).unwrap_or_default()),
            s.category,
            s.source_experiment_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_strategy(conn: &Connection, id: i64) -> CoreResult<Strategy> {
    conn.query_row(
        "SELECT id, name, description, buy_conditions, sell_conditions, exit_config, portfolio_config, category, source_experiment_id
         FROM strategy WHERE id = ?1 AND deleted_at IS NULL",
        params![id],
        strategy_from_row,
    )
    .optional()?
    .ok_or(CoreError::ExperimentNotFound(id))
}

pub fn list_strategies(conn: &Connection) -> CoreResult<Vec<Strategy>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, buy_conditions, sell_conditions, exit_config, portfolio_config, category, source_experiment_id
         FROM strategy WHERE deleted_at IS NULL ORDER BY id",
    )?;
    let rows = stmt.query_map([], strategy_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Each strategy's recorded score (from `backtest_summary.score`), defaulting
/// to `0.0` for a strategy with no recorded backtest — feeds the family
/// selector's grouping (spec.md §4.5 step 5).
pub fn strategy_scores(conn: &Connection) -> CoreResult<std::collections::HashMap<i64, f64>> {
    let mut stmt = conn.prepare("SELECT id, backtest_summary FROM strategy WHERE deleted_at IS NULL")?;
    let rows = stmt.query_map([], |row| {
        let id: i64 = row.get(0)?;
        let raw: Option<String> = row.get(1)?;
        Ok((id, raw))
    })?;
    let mut out = std::collections::HashMap::new();
    for row in rows {
        let (id, raw) = row?;
        let score = raw
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .and_then(|v| v.get("score").and_then(serde_json::Value::as_f64))
            .unwrap_or(0.0);
        out.insert(id, score);
    }
    Ok(out)
}

/// Soft-delete: `backtest_run` rows reference strategies only by name, so
/// historical runs stay intact after this.
pub fn soft_delete_strategy(conn: &Connection, id: i64, deleted_at: &str) -> CoreResult<()> {
    conn.execute(
        "UPDATE strategy SET deleted_at = ?2 WHERE id = ?1",
        params![id, deleted_at],
    )?;
    Ok(())
}

// ---- experiment ----------------------------------------------------------------

fn experiment_from_row(row: &Row) -> rusqlite::Result<Experiment> {
    let status: String = row.get(4)?;
    let source_type: String = row.get(2)?;
    Ok(Experiment {
        id: row.get(0)?,
        theme: row.get(1)?,
        source_type: SourceType::parse(&source_type),
        source_text: row.get(3)?,
        status: ExperimentStatus::parse(&status),
        capital: row.get(5)?,
        max_positions: row.get(6)?,
        max_position_pct: row.get(7)?,
        strategy_count: row.get(8)?,
    })
}

pub fn insert_experiment(conn: &Connection, e: &Experiment, created_at: &str) -> CoreResult<i64> {
    conn.execute(
        "INSERT INTO experiment (theme, source_type, source_text, status, capital, max_positions, max_position_pct, strategy_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            e.theme,
            e.source_type.as_str(),
            e.source_text,
            e.status.as_str(),
            e.capital,
            e.max_positions,
            e.max_position_pct,
            e.strategy_count,
            created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_experiment(conn: &Connection, id: i64) -> CoreResult<Experiment> {
    conn.query_row(
        "SELECT id, theme, source_type, source_text, status, capital, max_positions, max_position_pct, strategy_count
         FROM experiment WHERE id = ?1",
        params![id],
        experiment_from_row,
    )
    .optional()?
    .ok_or(CoreError::ExperimentNotFound(id))
}

pub fn update_experiment_status(conn: &Connection, id: i64, status: ExperimentStatus) -> CoreResult<()> {
    conn.execute(
        "UPDATE experiment SET status = ?2 WHERE id = ?1",
        params![id, status.as_str()],
    )?;
    Ok(())
}

/// Experiments still in a non-terminal status at process start are
/// candidates for orphan recovery (spec.md §4.1), partitioned by
/// `source_type` by the caller.
pub fn non_terminal_experiments(conn: &Connection) -> CoreResult<Vec<Experiment>> {
    let mut stmt = conn.prepare(
        "SELECT id, theme, source_type, source_text, status, capital, max_positions, max_position_pct, strategy_count
         FROM experiment WHERE status IN ('pending', 'generating', 'backtesting')",
    )?;
    let rows = stmt.query_map([], experiment_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Failed experiments, candidates for the bulk `/experiments/retry-pending`
/// endpoint.
pub fn failed_experiments(conn: &Connection) -> CoreResult<Vec<Experiment>> {
    let mut stmt = conn.prepare(
        "SELECT id, theme, source_type, source_text, status, capital, max_positions, max_position_pct, strategy_count
         FROM experiment WHERE status = 'failed'",
    )?;
    let rows = stmt.query_map([], experiment_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

// ---- experiment_strategy ----------------------------------------------------------------

fn experiment_strategy_from_row(row: &Row) -> rusqlite::Result<ExperimentStrategy> {
    let buy: String = row.get(2)?;
    let sell: String = row.get(3)?;
    let exit: String = row.get(4)?;
    let status: String = row.get(5)?;
    let regime_stats: Option<String> = row.get(14)?;
    let combo_config: Option<String> = row.get(15)?;
    Ok(ExperimentStrategy {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        name: row.get(16)?,
        buy_conditions: conditions_from_json(&buy),
        sell_conditions: conditions_from_json(&sell),
        exit_config: serde_json::from_str(&exit).unwrap_or_default(),
        status: ExperimentStrategyStatus::parse(&status),
        error_message: row.get(6)?,
        total_trades: row.get(7)?,
        win_rate: row.get(8)?,
        total_return_pct: row.get(9)?,
        max_drawdown_pct: row.get(10)?,
        avg_hold_days: row.get(11)?,
        avg_pnl_pct: row.get(12)?,
        score: row.get(13)?,
        regime_stats: regime_stats.and_then(|s| serde_json::from_str(&s).ok()),
        combo_config: combo_config.and_then(|s| serde_json::from_str(&s).ok()),
        backtest_run_id: row.get(17)?,
        promoted_strategy_id: row.get(18)?,
        seq: row.get(19)?,
    })
}

const EXPERIMENT_STRATEGY_COLUMNS: &str = "id, experiment_id, buy_conditions, sell_conditions, exit_config, status,
    error_message, total_trades, win_rate, total_return_pct, max_drawdown_pct, avg_hold_days, avg_pnl_pct, score,
    regime_stats, combo_config, name, backtest_run_id, promoted_strategy_id, seq";

pub fn insert_experiment_strategy(conn: &Connection, es: &ExperimentStrategy) -> CoreResult<i64> {
    conn.execute(
        "INSERT INTO experiment_strategy
            (experiment_id, name, buy_conditions, sell_conditions, exit_config, status, error_message, combo_config, seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            es.experiment_id,
            es.name,
            conditions_to_json(&es.buy_conditions),
            conditions_to_json(&es.sell_conditions),
            serde_json::to_string(&es.exit_config).unwrap_or_default(),
            es.status.as_str(),
            es.error_message,
            es.combo_config.as_ref().map(|c| serde_json::to_string(c).unwrap_or_default()),
            es.seq,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_experiment_strategy(conn: &Connection, id: i64) -> CoreResult<ExperimentStrategy> {
    conn.query_row(
        &format!("SELECT {EXPERIMENT_STRATEGY_COLUMNS} FROM experiment_strategy WHERE id = ?1"),
        params![id],
        experiment_strategy_from_row,
    )
    .optional()?
    .ok_or(CoreError::ExperimentNotFound(id))
}

pub fn list_experiment_strategies(conn: &Connection, experiment_id: i64) -> CoreResult<Vec<ExperimentStrategy>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EXPERIMENT_STRATEGY_COLUMNS} FROM experiment_strategy WHERE experiment_id = ?1 ORDER BY seq"
    ))?;
    let rows = stmt.query_map(params![experiment_id], experiment_strategy_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Strategies a `resume` worker should pick up: `pending`, `backtesting`
/// (interrupted mid-run), or `failed` with surviving buy conditions
/// (spec.md §9 open question 3 / redesign flag).
pub fn resumable_experiment_strategies(conn: &Connection, experiment_id: i64) -> CoreResult<Vec<ExperimentStrategy>> {
    Ok(list_experiment_strategies(conn, experiment_id)?
        .into_iter()
        .filter(|es| {
            matches!(
                es.status,
                ExperimentStrategyStatus::Pending | ExperimentStrategyStatus::Backtesting
            ) || (es.status == ExperimentStrategyStatus::Failed && es.is_retryable())
        })
        .collect())
}

pub fn update_experiment_strategy_status(
    conn: &Connection,
    id: i64,
    status: ExperimentStrategyStatus,
    error_message: Option<&str>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE experiment_strategy SET status = ?2, error_message = ?3 WHERE id = ?1",
        params![id, status.as_str(), error_message],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn record_backtest_result(
    conn: &Connection,
    id: i64,
    metrics: &BacktestMetricsRow,
    backtest_run_id: i64,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE experiment_strategy SET status = ?2, total_trades = ?3, win_rate = ?4, total_return_pct = ?5,
            max_drawdown_pct = ?6, avg_hold_days = ?7, avg_pnl_pct = ?8, score = ?9, regime_stats = ?10, backtest_run_id = ?11
         WHERE id = ?1",
        params![
            id,
            ExperimentStrategyStatus::Done.as_str(),
            metrics.total_trades,
            metrics.win_rate,
            metrics.total_return_pct,
            metrics.max_drawdown_pct,
            metrics.avg_hold_days,
            metrics.avg_pnl_pct,
            metrics.score,
            metrics.regime_stats.as_ref().map(|v| v.to_string()),
            backtest_run_id,
        ],
    )?;
    Ok(())
}

/// The subset of backtest metrics persisted directly on `experiment_strategy`
/// (the rest live on `backtest_run.metrics` as a JSON blob).
pub struct BacktestMetricsRow {
    pub total_trades: i64,
    pub win_rate: f64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub avg_hold_days: f64,
    pub avg_pnl_pct: f64,
    pub score: f64,
    pub regime_stats: Option<serde_json::Value>,
}

// ---- backtest_run / backtest_trade ----------------------------------------------------------------

pub fn insert_backtest_run(
    conn: &Connection,
    experiment_strategy_id: Option<i64>,
    strategy_name: &str,
    initial_capital: f64,
    final_equity: f64,
    metrics: &serde_json::Value,
    created_at: &str,
) -> CoreResult<i64> {
    conn.execute(
        "INSERT INTO backtest_run (experiment_strategy_id, strategy_name, initial_capital, final_equity, metrics, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            experiment_strategy_id,
            strategy_name,
            initial_capital,
            final_equity,
            metrics.to_string(),
            created_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_backtest_trades(conn: &Connection, run_id: i64, trades: &[BacktestTrade]) -> CoreResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO backtest_trade
            (backtest_run_id, code, strategy_name, buy_date, buy_price, sell_date, sell_price, sell_reason, pnl_pct, pnl_value, hold_days, regime)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for t in trades {
        stmt.execute(params![
            run_id,
            t.code,
            t.strategy_name,
            date_str(t.buy_date),
            t.buy_price,
            date_str(t.sell_date),
            t.sell_price,
            t.sell_reason.as_str(),
            t.pnl_pct,
            t.pnl_value,
            t.hold_days,
            t.regime,
        ])?;
    }
    Ok(())
}

pub fn backtest_trades_for_run(conn: &Connection, run_id: i64) -> CoreResult<Vec<BacktestTrade>> {
    let mut stmt = conn.prepare(
        "SELECT code, strategy_name, buy_date, buy_price, sell_date, sell_price, sell_reason, pnl_pct, pnl_value, hold_days, regime
         FROM backtest_trade WHERE backtest_run_id = ?1 ORDER BY buy_date",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        let sell_reason: String = row.get(6)?;
        Ok(BacktestTrade {
            code: row.get(0)?,
            strategy_name: row.get(1)?,
            buy_date: parse_date(&row.get::<_, String>(2)?),
            buy_price: row.get(3)?,
            sell_date: parse_date(&row.get::<_, String>(4)?),
            sell_price: row.get(5)?,
            sell_reason: match sell_reason.as_str() {
                "take_profit" => SellReason::TakeProfit,
                "max_hold" => SellReason::MaxHold,
                "signal" => SellReason::Signal,
                _ => SellReason::StopLoss,
            },
            pnl_pct: row.get(7)?,
            pnl_value: row.get(8)?,
            hold_days: row.get(9)?,
            regime: row.get(10)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

// ---- market_regime_label ----------------------------------------------------------------

pub fn upsert_regime_label(conn: &Connection, label: &MarketRegimeLabel) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO market_regime_label (week_start, week_end, regime, confidence, trend_strength, volatility, index_return_pct)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(week_start) DO UPDATE SET week_end = excluded.week_end, regime = excluded.regime,
            confidence = excluded.confidence, trend_strength = excluded.trend_strength,
            volatility = excluded.volatility, index_return_pct = excluded.index_return_pct",
        params![
            date_str(label.week_start),
            date_str(label.week_end),
            label.regime.as_str(),
            label.confidence,
            label.trend_strength,
            label.volatility,
            label.index_return_pct,
        ],
    )?;
    Ok(())
}

pub fn regime_for_date(conn: &Connection, date: NaiveDate) -> CoreResult<Option<Regime>> {
    let regime: Option<String> = conn
        .query_row(
            "SELECT regime FROM market_regime_label WHERE week_start <= ?1 AND week_end >= ?1",
            params![date_str(date)],
            |r| r.get(0),
        )
        .optional()?;
    Ok(regime.map(|s| Regime::parse(&s)))
}

// ---- trading_signal ----------------------------------------------------------------

pub fn upsert_signal(conn: &Connection, signal: &TradingSignal) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO trading_signal (code, date, action, alpha_score, component_scores, strategy_names)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(code, date) DO UPDATE SET action = excluded.action, alpha_score = excluded.alpha_score,
            component_scores = excluded.component_scores, strategy_names = excluded.strategy_names",
        params![
            signal.code,
            date_str(signal.date),
            signal.action.as_str(),
            signal.alpha_score,
            signal.component_scores.to_string(),
            serde_json::to_string(&signal.strategy_names).unwrap_or_default(),
        ],
    )?;
    Ok(())
}

/// Stale-signal GC (spec.md §4.4): delete rows for `date` whose code was
/// scanned this run (`scanned_codes`, the universe `U`) but produced no
/// signal (`produced_codes`, `S`) — i.e. `code ∈ U\S`. Codes outside `U`
/// (delisted, dropped below the bar-count threshold, or otherwise untracked
/// this run) are left untouched regardless of whether they have a row at
/// `date`.
pub fn delete_stale_signals(
    conn: &Connection,
    date: NaiveDate,
    scanned_codes: &[String],
    produced_codes: &[String],
) -> CoreResult<usize> {
    if scanned_codes.is_empty() {
        return Ok(0);
    }
    let scanned_placeholders = scanned_codes.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let date_param = date_str(date);
    let mut p: Vec<&dyn rusqlite::ToSql> = vec![&date_param];
    for c in scanned_codes {
        p.push(c);
    }

    let n = if produced_codes.is_empty() {
        let sql = format!(
            "DELETE FROM trading_signal WHERE date = ?1 AND code IN ({scanned_placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        stmt.execute(p.as_slice())?
    } else {
        let produced_placeholders = produced_codes.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "DELETE FROM trading_signal WHERE date = ?1 AND code IN ({scanned_placeholders}) AND code NOT IN ({produced_placeholders})"
        );
        for c in produced_codes {
            p.push(c);
        }
        let mut stmt = conn.prepare(&sql)?;
        stmt.execute(p.as_slice())?
    };
    Ok(n)
}

pub fn signals_for_date(conn: &Connection, date: NaiveDate) -> CoreResult<Vec<TradingSignal>> {
    let mut stmt = conn.prepare(
        "SELECT code, date, action, alpha_score, component_scores, strategy_names
         FROM trading_signal WHERE date = ?1 ORDER BY alpha_score DESC",
    )?;
    let rows = stmt.query_map(params![date_str(date)], |row| {
        let action: String = row.get(2)?;
        let component_scores: String = row.get(4)?;
        let strategy_names: String = row.get(5)?;
        Ok(TradingSignal {
            code: row.get(0)?,
            date: parse_date(&row.get::<_, String>(1)?),
            action: match action.as_str() {
                "sell" => SignalAction::Sell,
                "hold" => SignalAction::Hold,
                _ => SignalAction::Buy,
            },
            alpha_score: row.get(3)?,
            component_scores: serde_json::from_str(&component_scores).unwrap_or(serde_json::Value::Null),
            strategy_names: serde_json::from_str(&strategy_names).unwrap_or_default(),
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Most recent date with any signal rows, used by `/signals/today`'s
/// fallback-to-latest-available semantics (spec.md §6).
pub fn latest_signal_date(conn: &Connection) -> CoreResult<Option<NaiveDate>> {
    let v: Option<String> = conn
        .query_row("SELECT max(date) FROM trading_signal", [], |r| r.get(0))
        .optional()?
        .flatten();
    Ok(v.map(|s| parse_date(&s)))
}

// ---- trade_plan ----------------------------------------------------------------

use super::models::{Direction, PlanStatus};

fn trade_plan_from_row(row: &Row) -> rusqlite::Result<TradePlan> {
    let direction: String = row.get(2)?;
    let status: String = row.get(7)?;
    Ok(TradePlan {
        id: row.get(0)?,
        code: row.get(1)?,
        direction: Direction::parse(&direction),
        plan_price: row.get(3)?,
        quantity: row.get(4)?,
        sell_pct: row.get(5)?,
        plan_date: parse_date(&row.get::<_, String>(6)?),
        status: match status.as_str() {
            "executed" => PlanStatus::Executed,
            "expired" => PlanStatus::Expired,
            _ => PlanStatus::Pending,
        },
        execution_price: row.get(8)?,
    })
}

/// Enforces "at most one pending plan per `(code, direction)`" (spec.md §3)
/// via the partial unique index in `migrations/`; a violation surfaces as
/// `CoreError::Conflict`.
pub fn insert_trade_plan(conn: &Connection, plan: &TradePlan, created_at: &str) -> CoreResult<i64> {
    let result = conn.execute(
        "INSERT INTO trade_plan (code, direction, plan_price, quantity, sell_pct, plan_date, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            plan.code,
            plan.direction.as_str(),
            plan.plan_price,
            plan.quantity,
            plan.sell_pct,
            date_str(plan.plan_date),
            PlanStatus::Pending.as_str(),
            created_at,
        ],
    );
    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            Err(CoreError::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn pending_plans_for_date(conn: &Connection, date: NaiveDate) -> CoreResult<Vec<TradePlan>> {
    let mut stmt = conn.prepare(
        "SELECT id, code, direction, plan_price, quantity, sell_pct, plan_date, status, execution_price
         FROM trade_plan WHERE plan_date = ?1 AND status = 'pending'",
    )?;
    let rows = stmt.query_map(params![date_str(date)], trade_plan_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn pending_plan_exists(conn: &Connection, code: &str, direction: Direction) -> CoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM trade_plan WHERE code = ?1 AND direction = ?2 AND status = 'pending'",
        params![code, direction.as_str()],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

pub fn mark_plan_executed(conn: &Connection, id: i64, execution_price: f64) -> CoreResult<()> {
    conn.execute(
        "UPDATE trade_plan SET status = 'executed', execution_price = ?2 WHERE id = ?1",
        params![id, execution_price],
    )?;
    Ok(())
}

pub fn mark_plan_expired(conn: &Connection, id: i64) -> CoreResult<()> {
    conn.execute("UPDATE trade_plan SET status = 'expired' WHERE id = ?1", params![id])?;
    Ok(())
}

// ---- bot_portfolio / bot_trade ----------------------------------------------------------------

pub fn get_position(conn: &Connection, code: &str) -> CoreResult<Option<BotPortfolio>> {
    Ok(conn
        .query_row(
            "SELECT code, quantity, avg_cost FROM bot_portfolio WHERE code = ?1",
            params![code],
            |row| {
                Ok(BotPortfolio {
                    code: row.get(0)?,
                    quantity: row.get(1)?,
                    avg_cost: row.get(2)?,
                })
            },
        )
        .optional()?)
}

pub fn all_positions(conn: &Connection) -> CoreResult<Vec<BotPortfolio>> {
    let mut stmt = conn.prepare("SELECT code, quantity, avg_cost FROM bot_portfolio")?;
    let rows = stmt.query_map([], |row| {
        Ok(BotPortfolio {
            code: row.get(0)?,
            quantity: row.get(1)?,
            avg_cost: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn upsert_position(conn: &Connection, pos: &BotPortfolio, opened_at: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO bot_portfolio (code, quantity, avg_cost, opened_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(code) DO UPDATE SET quantity = excluded.quantity, avg_cost = excluded.avg_cost",
        params![pos.code, pos.quantity, pos.avg_cost, opened_at],
    )?;
    Ok(())
}

pub fn remove_position(conn: &Connection, code: &str) -> CoreResult<()> {
    conn.execute("DELETE FROM bot_portfolio WHERE code = ?1", params![code])?;
    Ok(())
}

pub fn insert_bot_trade(conn: &Connection, trade: &BotTrade, source: &str) -> CoreResult<i64> {
    let action = match trade.action {
        TradeAction::Buy => "buy",
        TradeAction::Sell => "sell",
        TradeAction::Hold => "hold",
    };
    conn.execute(
        "INSERT INTO bot_trade (code, action, quantity, price, amount, trade_date, source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![trade.code, action, trade.quantity, trade.price, trade.amount, date_str(trade.trade_date), source],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_bot_trade_review(conn: &Connection, review: &super::models::BotTradeReview) -> CoreResult<i64> {
    conn.execute(
        "INSERT INTO bot_trade_review (code, opened_at, closed_at, avg_cost, exit_price, pnl_pct, quantity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            review.code,
            date_str(review.opened_at),
            date_str(review.closed_at),
            review.avg_cost,
            review.exit_price,
            review.pnl_pct,
            review.quantity,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// ---- ai_report ----------------------------------------------------------------

pub fn insert_ai_report(conn: &Connection, report: &AiReport, created_at: &str) -> CoreResult<i64> {
    conn.execute(
        "INSERT INTO ai_report (report_date, report_type, market_regime, market_regime_confidence,
            thinking_process, summary, recommendations, strategy_actions, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(report_date) DO UPDATE SET report_type = excluded.report_type,
            market_regime = excluded.market_regime, market_regime_confidence = excluded.market_regime_confidence,
            thinking_process = excluded.thinking_process, summary = excluded.summary,
            recommendations = excluded.recommendations, strategy_actions = excluded.strategy_actions",
        params![
            date_str(report.report_date),
            report.report_type,
            report.market_regime,
            report.market_regime_confidence,
            report.thinking_process,
            report.summary,
            serde_json::to_string(&report.recommendations).unwrap_or_default(),
            serde_json::to_string(&report.strategy_actions).unwrap_or_default(),
            created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn ai_report_for_date(conn: &Connection, date: NaiveDate) -> CoreResult<Option<AiReport>> {
    conn.query_row(
        "SELECT id, report_date, report_type, market_regime, market_regime_confidence,
            thinking_process, summary, recommendations, strategy_actions
         FROM ai_report WHERE report_date = ?1",
        params![date_str(date)],
        |row| {
            let recs: String = row.get(7)?;
            let actions: String = row.get(8)?;
            Ok(AiReport {
                id: row.get(0)?,
                report_date: parse_date(&row.get::<_, String>(1)?),
                report_type: row.get(2)?,
                market_regime: row.get(3)?,
                market_regime_confidence: row.get(4)?,
                thinking_process: row.get(5)?,
                summary: row.get(6)?,
                recommendations: serde_json::from_str(&recs).unwrap_or_default(),
                strategy_actions: serde_json::from_str(&actions).unwrap_or_default(),
            })
        },
    )
    .optional()
    .map_err(CoreError::from)
}

// ---- market_sentiment / pipeline_state ----------------------------------------------------------------

pub fn latest_sentiment_score(conn: &Connection) -> CoreResult<Option<f64>> {
    Ok(conn
        .query_row(
            "SELECT score FROM market_sentiment ORDER BY date DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn pipeline_last_run_date(conn: &Connection) -> CoreResult<Option<NaiveDate>> {
    let v: Option<String> = conn.query_row(
        "SELECT last_run_date FROM pipeline_state WHERE id = 1",
        [],
        |r| r.get(0),
    )?;
    Ok(v.map(|s| parse_date(&s)))
}

pub fn set_pipeline_last_run_date(conn: &Connection, date: NaiveDate) -> CoreResult<()> {
    conn.execute(
        "UPDATE pipeline_state SET last_run_date = ?1 WHERE id = 1",
        params![date_str(date)],
    )?;
    Ok(())
}

pub fn set_pipeline_in_flight(conn: &Connection, in_flight: bool) -> CoreResult<()> {
    conn.execute(
        "UPDATE pipeline_state SET in_flight = ?1 WHERE id = 1",
        params![in_flight as i64],
    )?;
    Ok(())
}

pub fn pipeline_in_flight(conn: &Connection) -> CoreResult<bool> {
    let v: i64 = conn.query_row("SELECT in_flight FROM pipeline_state WHERE id = 1", [], |r| r.get(0))?;
    Ok(v != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::Operator;
    use crate::db::Pool;

    fn test_conn() -> Pool {
        Pool::open_in_memory().unwrap()
    }

    fn sample_condition() -> Condition {
        Condition::Value {
            field: "RSI".into(),
            params: Default::default(),
            operator: Operator::Lt,
            compare_value: 30.0,
        }
    }

    #[test]
    fn stock_upsert_is_idempotent() {
        let pool = test_conn();
        let conn = pool.get().unwrap();
        let s = Stock { code: "600000.SH".into(), name: "Pudong".into(), market: "SH".into(), industry: None };
        upsert_stock(&conn, &s).unwrap();
        upsert_stock(&conn, &s).unwrap();
        assert_eq!(all_stock_codes(&conn).unwrap(), vec!["600000.SH"]);
    }

    #[test]
    fn daily_bar_roundtrip() {
        let pool = test_conn();
        let conn = pool.get().unwrap();
        let s = Stock { code: "600000.SH".into(), name: "Pudong".into(), market: "SH".into(), industry: None };
        upsert_stock(&conn, &s).unwrap();
        let bar = DailyBar {
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            open: 10.0, high: 11.0, low: 9.5, close: 10.5, volume: 1000.0, amount: 10500.0,
        };
        upsert_daily_bar(&conn, "600000.SH", &bar).unwrap();
        let bars = daily_bars(&conn, "600000.SH", bar.date, bar.date).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 10.5);
    }

    fn sample_signal(code: &str, date: NaiveDate) -> TradingSignal {
        TradingSignal {
            code: code.into(),
            date,
            action: SignalAction::Buy,
            alpha_score: 50.0,
            component_scores: serde_json::json!({}),
            strategy_names: vec!["s1".into()],
        }
    }

    #[test]
    fn stale_signal_gc_spares_codes_outside_the_scanned_universe() {
        let pool = test_conn();
        let conn = pool.get().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        // "600000.SH" was scanned this run but produced no signal.
        // "600001.SH" was never part of this run's universe (e.g. delisted).
        upsert_signal(&conn, &sample_signal("600000.SH", date)).unwrap();
        upsert_signal(&conn, &sample_signal("600001.SH", date)).unwrap();
        upsert_signal(&conn, &sample_signal("600002.SH", date)).unwrap();

        let scanned = vec!["600000.SH".to_string(), "600002.SH".to_string()];
        let produced = vec!["600002.SH".to_string()];
        let deleted = delete_stale_signals(&conn, date, &scanned, &produced).unwrap();

        assert_eq!(deleted, 1);
        let remaining: Vec<String> = signals_for_date(&conn, date)
            .unwrap()
            .into_iter()
            .map(|s| s.code)
            .collect();
        assert!(remaining.contains(&"600001.SH".to_string()), "untracked code must survive GC");
        assert!(remaining.contains(&"600002.SH".to_string()), "produced code must survive GC");
        assert!(!remaining.contains(&"600000.SH".to_string()), "scanned-but-unproduced code must be deleted");
    }

    #[test]
    fn trade_plan_uniqueness_enforced() {
        let pool = test_conn();
        let conn = pool.get().unwrap();
        let plan = TradePlan {
            id: 0,
            code: "600000.SH".into(),
            direction: Direction::Buy,
            plan_price: 10.0,
            quantity: 100,
            sell_pct: None,
            plan_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            status: PlanStatus::Pending,
            execution_price: None,
        };
        insert_trade_plan(&conn, &plan, "2024-01-01T00:00:00Z").unwrap();
        let result = insert_trade_plan(&conn, &plan, "2024-01-01T00:00:00Z");
        assert!(matches!(result, Err(CoreError::Conflict)));
    }

    #[test]
    fn experiment_strategy_roundtrip_preserves_conditions() {
        let pool = test_conn();
        let conn = pool.get().unwrap();
        insert_experiment(
            &conn,
            &Experiment {
                id: 0,
                theme: "momentum".into(),
                source_type: SourceType::Template,
                source_text: String::new(),
                status: ExperimentStatus::Pending,
                capital: 100_000.0,
                max_positions: 10,
                max_position_pct: 30.0,
                strategy_count: 1,
            },
            "2024-01-01T00:00:00Z",
        )
        .unwrap();
        let es = ExperimentStrategy {
            id: 0,
            experiment_id: 1,
            name: "s1".into(),
            buy_conditions: vec![sample_condition()],
            sell_conditions: vec![],
            exit_config: ExitConfig::default().normalize(),
            status: ExperimentStrategyStatus::Pending,
            error_message: None,
            total_trades: 0,
            win_rate: 0.0,
            total_return_pct: 0.0,
            max_drawdown_pct: 0.0,
            avg_hold_days: 0.0,
            avg_pnl_pct: 0.0,
            score: 0.0,
            regime_stats: None,
            combo_config: None,
            backtest_run_id: None,
            promoted_strategy_id: None,
            seq: 0,
        };
        let id = insert_experiment_strategy(&conn, &es).unwrap();
        let loaded = get_experiment_strategy(&conn, id).unwrap();
        assert_eq!(loaded.buy_conditions.len(), 1);
        assert_eq!(loaded.name, "s1");
    }

    #[test]
    fn resumable_filters_by_status_and_retryability() {
        let pool = test_conn();
        let conn = pool.get().unwrap();
        insert_experiment(
            &conn,
            &Experiment {
                id: 0,
                theme: "x".into(),
                source_type: SourceType::Template,
                source_text: String::new(),
                status: ExperimentStatus::Backtesting,
                capital: 100_000.0,
                max_positions: 10,
                max_position_pct: 30.0,
                strategy_count: 2,
            },
            "2024-01-01T00:00:00Z",
        )
        .unwrap();
        let base = ExperimentStrategy {
            id: 0,
            experiment_id: 1,
            name: "a".into(),
            buy_conditions: vec![sample_condition()],
            sell_conditions: vec![],
            exit_config: ExitConfig::default().normalize(),
            status: ExperimentStrategyStatus::Failed,
            error_message: None,
            total_trades: 0,
            win_rate: 0.0,
            total_return_pct: 0.0,
            max_drawdown_pct: 0.0,
            avg_hold_days: 0.0,
            avg_pnl_pct: 0.0,
            score: 0.0,
            regime_stats: None,
            combo_config: None,
            backtest_run_id: None,
            promoted_strategy_id: None,
            seq: 0,
        };
        let mut empty = base.clone();
        empty.name = "b".into();
        empty.buy_conditions = vec![];
        insert_experiment_strategy(&conn, &base).unwrap();
        insert_experiment_strategy(&conn, &empty).unwrap();
        let resumable = resumable_experiment_strategies(&conn, 1).unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].name, "a");
    }
}
