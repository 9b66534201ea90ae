//! Trade Plan State Machine (spec.md §4.7): conditional next-day order
//! triggering from AI recommendations. Grounded on the original Python
//! bot-trading engine's round-lot sizing and trigger tests, reimplemented
//! against this crate's repo layer.

use crate::db::models::{
    AiRecommendation, BotPortfolio, BotTrade, BotTradeReview, DailyBar, Direction, PlanStatus, RecommendationAction,
    TradeAction, TradePlan,
};
use crate::db::repo;
use crate::error::CoreResult;
use chrono::NaiveDate;
use rusqlite::Connection;

const ROUND_LOT: i64 = 100;
const DEFAULT_BUY_BUDGET: f64 = 100_000.0;

fn round_lot(raw_shares: f64) -> i64 {
    let lots = (raw_shares / ROUND_LOT as f64).floor() as i64;
    if lots <= 0 {
        ROUND_LOT
    } else {
        lots * ROUND_LOT
    }
}

/// Create/replace pending plans from a set of AI recommendations, targeting
/// `next_trading_day`. Returns the number of plans written (hold recommendations
/// produce an informational `BotTrade` row instead of a plan).
pub fn create_plans_from_recommendations(
    conn: &Connection,
    recommendations: &[AiRecommendation],
    next_trading_day: NaiveDate,
    created_at: &str,
) -> CoreResult<usize> {
    let mut written = 0;
    for rec in recommendations {
        match rec.action {
            RecommendationAction::Buy => {
                let Some(price) = rec.entry_price else { continue };
                if price <= 0.0 {
                    continue;
                }
                let quantity = round_lot(DEFAULT_BUY_BUDGET / price);
                let plan = TradePlan {
                    id: 0,
                    code: rec.stock_code.clone(),
                    direction: Direction::Buy,
                    plan_price: price,
                    quantity,
                    sell_pct: None,
                    plan_date: next_trading_day,
                    status: PlanStatus::Pending,
                    execution_price: None,
                };
                upsert_pending(conn, &plan, created_at)?;
                written += 1;
            }
            RecommendationAction::Sell | RecommendationAction::Reduce => {
                let Some(holding) = repo::get_position(conn, &rec.stock_code)? else { continue };
                let sell_pct = if matches!(rec.action, RecommendationAction::Reduce) { 50.0 } else { 100.0 };
                let raw = holding.quantity as f64 * sell_pct / 100.0;
                let quantity = round_lot(raw).min(holding.quantity);
                if quantity <= 0 {
                    continue;
                }
                let price = rec.entry_price.unwrap_or(rec.target.unwrap_or(0.0));
                let plan = TradePlan {
                    id: 0,
                    code: rec.stock_code.clone(),
                    direction: Direction::Sell,
                    plan_price: price,
                    quantity,
                    sell_pct: Some(sell_pct),
                    plan_date: next_trading_day,
                    status: PlanStatus::Pending,
                    execution_price: None,
                };
                upsert_pending(conn, &plan, created_at)?;
                written += 1;
            }
            RecommendationAction::Hold => {
                let trade = BotTrade {
                    code: rec.stock_code.clone(),
                    action: TradeAction::Hold,
                    quantity: 0,
                    price: 0.0,
                    amount: 0.0,
                    trade_date: next_trading_day,
                };
                repo::insert_bot_trade(conn, &trade, "ai_report")?;
            }
        }
    }
    Ok(written)
}

/// Upsert on `(code, direction, pending)` — if a pending plan for the same
/// code/direction exists, replace its price/quantity rather than stacking.
fn upsert_pending(conn: &Connection, plan: &TradePlan, created_at: &str) -> CoreResult<()> {
    let existing = repo::pending_plans_for_date(conn, plan.plan_date)?
        .into_iter()
        .find(|p| p.code == plan.code && p.direction == plan.direction);
    if let Some(existing) = existing {
        conn.execute(
            "UPDATE trade_plan SET plan_price = ?2, quantity = ?3, sell_pct = ?4 WHERE id = ?1",
            rusqlite::params![existing.id, plan.plan_price, plan.quantity, plan.sell_pct],
        )?;
        return Ok(());
    }
    repo::insert_trade_plan(conn, plan, created_at)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Executed,
    Expired,
}

/// Run the execution pass for `trade_date`: load every pending plan with
/// `plan_date ≤ trade_date` and either trigger, execute, or expire it.
///
/// `bought_today` seeds the set of codes already bought earlier today by
/// some mechanism outside this call (normally empty); this call adds to it
/// as buy plans execute, within a single invocation, so a sell plan for a
/// code bought in the same invocation is refused (spec's T+0 rule). Buy
/// plans are executed before sell plans regardless of the order
/// `pending_plans_for_date` returns them in, so the refusal doesn't depend
/// on row order.
pub fn execute_pending(
    conn: &Connection,
    trade_date: NaiveDate,
    bars_today: impl Fn(&str) -> CoreResult<Option<DailyBar>>,
    bought_today: &std::collections::HashSet<String>,
) -> CoreResult<Vec<(i64, ExecutionOutcome)>> {
    let mut outcomes = Vec::new();
    let mut bought_today = bought_today.clone();

    // pending_plans_for_date is keyed on an exact plan_date; a pending plan
    // can only have been created in the recent past, so scan a bounded
    // trailing window rather than an unindexed "plan_date <= ?" query.
    let mut all_pending = Vec::new();
    let mut window = trade_date - chrono::Duration::days(14);
    while window <= trade_date {
        all_pending.extend(repo::pending_plans_for_date(conn, window)?);
        window += chrono::Duration::days(1);
    }

    // Buy plans before sell plans: a sell plan maturing in the same pass as
    // a buy plan for the same code must see that code as already bought.
    all_pending.sort_by_key(|p| match p.direction {
        Direction::Buy => 0,
        Direction::Sell => 1,
    });

    for plan in all_pending {
        if plan.plan_date < trade_date {
            repo::mark_plan_expired(conn, plan.id)?;
            outcomes.push((plan.id, ExecutionOutcome::Expired));
            continue;
        }

        let Some(bar) = bars_today(&plan.code)? else {
            repo::mark_plan_expired(conn, plan.id)?;
            outcomes.push((plan.id, ExecutionOutcome::Expired));
            continue;
        };

        let triggered = match plan.direction {
            Direction::Buy => bar.low <= plan.plan_price,
            Direction::Sell => bar.high >= plan.plan_price,
        };
        if !triggered {
            repo::mark_plan_expired(conn, plan.id)?;
            outcomes.push((plan.id, ExecutionOutcome::Expired));
            continue;
        }

        let executed = match plan.direction {
            Direction::Buy => execute_buy(conn, &plan, trade_date, &bought_today),
            Direction::Sell => execute_sell(conn, &plan, trade_date, &bought_today),
        }?;

        if executed {
            if plan.direction == Direction::Buy {
                bought_today.insert(plan.code.clone());
            }
            repo::mark_plan_executed(conn, plan.id, plan.plan_price)?;
            outcomes.push((plan.id, ExecutionOutcome::Executed));
        } else {
            repo::mark_plan_expired(conn, plan.id)?;
            outcomes.push((plan.id, ExecutionOutcome::Expired));
        }
    }
    Ok(outcomes)
}

fn execute_buy(conn: &Connection, plan: &TradePlan, trade_date: NaiveDate, bought_today: &std::collections::HashSet<String>) -> CoreResult<bool> {
    if bought_today.contains(&plan.code) {
        return Ok(false);
    }
    let amount = plan.plan_price * plan.quantity as f64;
    let trade = BotTrade {
        code: plan.code.clone(),
        action: TradeAction::Buy,
        quantity: plan.quantity,
        price: plan.plan_price,
        amount,
        trade_date,
    };
    repo::insert_bot_trade(conn, &trade, "plan")?;

    let position = match repo::get_position(conn, &plan.code)? {
        Some(existing) => {
            let total_qty = existing.quantity + plan.quantity;
            let total_cost = existing.avg_cost * existing.quantity as f64 + amount;
            BotPortfolio { code: plan.code.clone(), quantity: total_qty, avg_cost: total_cost / total_qty as f64 }
        }
        None => BotPortfolio { code: plan.code.clone(), quantity: plan.quantity, avg_cost: plan.plan_price },
    };
    repo::upsert_position(conn, &position, &trade_date.format("%Y-%m-%d").to_string())?;
    Ok(true)
}

fn execute_sell(conn: &Connection, plan: &TradePlan, trade_date: NaiveDate, bought_today: &std::collections::HashSet<String>) -> CoreResult<bool> {
    if bought_today.contains(&plan.code) {
        return Ok(false);
    }
    let Some(existing) = repo::get_position(conn, &plan.code)? else {
        return Ok(false);
    };
    let quantity = plan.quantity.min(existing.quantity);
    if quantity <= 0 {
        return Ok(false);
    }
    let amount = plan.plan_price * quantity as f64;
    let trade = BotTrade {
        code: plan.code.clone(),
        action: TradeAction::Sell,
        quantity,
        price: plan.plan_price,
        amount,
        trade_date,
    };
    repo::insert_bot_trade(conn, &trade, "plan")?;

    let remaining = existing.quantity - quantity;
    if remaining <= 0 {
        let opened_at = position_opened_at(conn, &plan.code)?.unwrap_or(trade_date);
        repo::remove_position(conn, &plan.code)?;
        let pnl_pct = (plan.plan_price - existing.avg_cost) / existing.avg_cost * 100.0;
        repo::insert_bot_trade_review(
            conn,
            &BotTradeReview {
                code: plan.code.clone(),
                opened_at,
                closed_at: trade_date,
                avg_cost: existing.avg_cost,
                exit_price: plan.plan_price,
                pnl_pct,
                quantity: existing.quantity,
            },
        )?;
    } else {
        repo::upsert_position(
            conn,
            &BotPortfolio { code: plan.code.clone(), quantity: remaining, avg_cost: existing.avg_cost },
            &trade_date.format("%Y-%m-%d").to_string(),
        )?;
    }
    Ok(true)
}

fn position_opened_at(conn: &Connection, code: &str) -> CoreResult<Option<NaiveDate>> {
    let v: Option<String> = conn
        .query_row("SELECT opened_at FROM bot_portfolio WHERE code = ?1", rusqlite::params![code], |r| r.get(0))
        .optional()?;
    Ok(v.map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").unwrap_or(chrono::Utc::now().date_naive())))
}

use rusqlite::OptionalExtension;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Pool;

    fn bar(date: NaiveDate, low: f64, high: f64) -> DailyBar {
        DailyBar { date, open: low, high, low, close: (low + high) / 2.0, volume: 100.0, amount: 1000.0 }
    }

    #[test]
    fn round_lot_defaults_to_one_lot_when_budget_too_small() {
        assert_eq!(round_lot(50.0), ROUND_LOT);
    }

    #[test]
    fn round_lot_floors_to_nearest_hundred() {
        assert_eq!(round_lot(250.0), 200);
    }

    #[test]
    fn buy_plan_created_from_recommendation() {
        let pool = Pool::open_in_memory().unwrap();
        let conn = pool.get().unwrap();
        repo::upsert_stock(&conn, &crate::db::models::Stock { code: "600000.SH".into(), name: "Test Co".into(), market: "SSE".into(), industry: None }).unwrap();
        let rec = AiRecommendation {
            stock_code: "600000.SH".into(),
            stock_name: "Test Co".into(),
            action: RecommendationAction::Buy,
            reason: "momentum".into(),
            entry_price: Some(10.0),
            stop_loss: None,
            target: None,
            alpha_score: Some(80.0),
        };
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let n = create_plans_from_recommendations(&conn, &[rec], date, "2024-01-01T00:00:00Z").unwrap();
        assert_eq!(n, 1);
        let pending = repo::pending_plans_for_date(&conn, date).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].quantity, 1000);
    }

    #[test]
    fn plan_expires_when_not_triggered() {
        let pool = Pool::open_in_memory().unwrap();
        let conn = pool.get().unwrap();
        repo::upsert_stock(&conn, &crate::db::models::Stock { code: "600000.SH".into(), name: "Test Co".into(), market: "SSE".into(), industry: None }).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let plan = TradePlan {
            id: 0,
            code: "600000.SH".into(),
            direction: Direction::Buy,
            plan_price: 5.0,
            quantity: 100,
            sell_pct: None,
            plan_date: date,
            status: PlanStatus::Pending,
            execution_price: None,
        };
        repo::insert_trade_plan(&conn, &plan, "2024-01-01T00:00:00Z").unwrap();
        let bars = |_: &str| Ok(Some(bar(date, 8.0, 9.0)));
        let outcomes = execute_pending(&conn, date, bars, &Default::default()).unwrap();
        assert_eq!(outcomes[0].1, ExecutionOutcome::Expired);
    }

    #[test]
    fn sell_is_refused_same_day_as_a_maturing_buy_for_the_same_code() {
        let pool = Pool::open_in_memory().unwrap();
        let conn = pool.get().unwrap();
        repo::upsert_stock(&conn, &crate::db::models::Stock { code: "600000.SH".into(), name: "Test Co".into(), market: "SSE".into(), industry: None }).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        let buy = TradePlan {
            id: 0,
            code: "600000.SH".into(),
            direction: Direction::Buy,
            plan_price: 10.0,
            quantity: 100,
            sell_pct: None,
            plan_date: date,
            status: PlanStatus::Pending,
            execution_price: None,
        };
        let sell = TradePlan {
            id: 0,
            code: "600000.SH".into(),
            direction: Direction::Sell,
            plan_price: 10.0,
            quantity: 100,
            sell_pct: Some(100.0),
            plan_date: date,
            status: PlanStatus::Pending,
            execution_price: None,
        };
        repo::insert_trade_plan(&conn, &buy, "2024-01-01T00:00:00Z").unwrap();
        repo::insert_trade_plan(&conn, &sell, "2024-01-01T00:00:00Z").unwrap();

        // A single bar whose range triggers both the buy (low <= 10) and the
        // sell (high >= 10).
        let bars = |_: &str| Ok(Some(bar(date, 5.0, 15.0)));
        let outcomes = execute_pending(&conn, date, bars, &Default::default()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes.iter().filter(|(_, o)| *o == ExecutionOutcome::Executed).count(), 1, "only the buy should execute");

        let position = repo::get_position(&conn, "600000.SH").unwrap().expect("buy must still hold the position");
        assert_eq!(position.quantity, 100, "same-day sell must be refused, leaving the buy's position intact");

        let pending_after = repo::pending_plans_for_date(&conn, date).unwrap();
        assert!(pending_after.is_empty(), "both plans should be resolved (executed or expired), none left pending");
    }
}
