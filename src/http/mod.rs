//! HTTP surface (spec.md §6): SSE-streaming experiment lifecycle and
//! signal-generation endpoints plus a handful of plain-JSON reads.
//! Grounded on the teacher's own request/response boundary style
//! (thin handlers delegating to a shared state, errors mapped to status
//! codes once at the edge) generalized from its MCP tool-call framing to
//! an Axum router.

use crate::app::AppState;
use crate::db::models::{Experiment, ExperimentStatus, SourceType};
use crate::error::CoreError;
use crate::runner::progress::{ProgressBus, ProgressItem};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub fn router(state: AppState) -> Router {
    // Any origin/method/header: this surface has no session cookies to
    // leak and is meant to be called from ad hoc dashboards (spec.md §6).
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/experiments", post(create_experiment))
        .route("/experiments/{id}/stream", get(stream_experiment))
        .route("/experiments/{id}/retry", post(retry_experiment))
        .route("/experiments/retry-pending", post(retry_pending))
        .route("/signals/today", get(signals_today))
        .route("/signals/generate-stream", post(generate_signals_stream))
        .route("/backtest/run", post(run_backtest))
        .layer(cors)
        .with_state(state)
}

/// Errors raised by handlers, mapped to status codes once at the edge
/// per spec.md §7's "non-streaming endpoints return 4xx/404/409/5xx" rule.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = match &e {
            CoreError::ExperimentNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict => StatusCode::CONFLICT,
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

/// Turn a `ProgressBus` subscription into an SSE body: events framed as
/// `data: <json>\n\n`, keepalives as `: keepalive\n\n` (spec.md §6).
fn sse_from_bus(bus: Arc<ProgressBus>, offset: usize) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = bus.subscribe_from(offset).map(|item| {
        let event = match item {
            ProgressItem::Event(e) => SseEvent::default().json_data(&e).unwrap_or_else(|_| SseEvent::default()),
            ProgressItem::Keepalive => SseEvent::default().comment("keepalive"),
        };
        Ok(event)
    });
    Sse::new(stream)
}

#[derive(Deserialize)]
struct CreateExperimentRequest {
    theme: String,
    #[serde(default)]
    source_type: Option<String>,
    #[serde(default)]
    source_text: Option<String>,
    #[serde(default)]
    capital: Option<f64>,
    #[serde(default)]
    max_positions: Option<u32>,
    #[serde(default)]
    max_position_pct: Option<f64>,
}

async fn create_experiment(
    State(state): State<AppState>,
    Json(req): Json<CreateExperimentRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let conn = state.pool.get().map_err(ApiError::from)?;
    let experiment = Experiment {
        id: 0,
        theme: req.theme,
        source_type: req.source_type.as_deref().map_or(SourceType::Template, SourceType::parse),
        source_text: req.source_text.unwrap_or_default(),
        status: ExperimentStatus::Pending,
        capital: req.capital.unwrap_or(state.config.risk_control.default_capital),
        max_positions: req.max_positions.unwrap_or(state.config.risk_control.max_positions),
        max_position_pct: req.max_position_pct.unwrap_or(state.config.risk_control.max_position_pct),
        strategy_count: 0,
    };
    let id = crate::db::repo::insert_experiment(&conn, &experiment, &Utc::now().to_rfc3339()).map_err(ApiError::from)?;
    drop(conn);

    let handle = state.runner.start(id).map_err(ApiError::from)?;
    Ok(sse_from_bus(Arc::clone(&handle.bus), 0))
}

async fn stream_experiment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    match state.runner.get_progress(id) {
        Some(handle) => Ok(sse_from_bus(Arc::clone(&handle.bus), 0)),
        None => {
            // Not an active worker: verify the experiment exists, then
            // reply with its terminal state as a single-event stream.
            let conn = state.pool.get().map_err(ApiError::from)?;
            let experiment = crate::db::repo::get_experiment(&conn, id).map_err(ApiError::from)?;
            let bus = Arc::new(ProgressBus::new());
            bus.push(crate::runner::progress::ProgressEventKind::ExperimentStatus { status: experiment.status.as_str().into() });
            bus.finish();
            Ok(sse_from_bus(bus, 0))
        }
    }
}

async fn retry_experiment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let handle = state.runner.resume(id).map_err(ApiError::from)?;
    Ok(sse_from_bus(Arc::clone(&handle.bus), 0))
}

async fn retry_pending(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let failed = {
        let conn = state.pool.get().map_err(ApiError::from)?;
        crate::db::repo::failed_experiments(&conn).map_err(ApiError::from)?
    };

    let bus = Arc::new(ProgressBus::new());
    for experiment in failed {
        match state.runner.resume(experiment.id) {
            Ok(_) => bus.push(crate::runner::progress::ProgressEventKind::Info {
                message: format!("resubmitted experiment {}", experiment.id),
            }),
            Err(e) => bus.push(crate::runner::progress::ProgressEventKind::Error { message: e.to_string() }),
        }
    }
    bus.finish();
    Ok(sse_from_bus(bus, 0))
}

#[derive(Deserialize)]
struct SignalsTodayQuery {
    date: Option<NaiveDate>,
}

#[derive(Serialize)]
struct SignalsTodayResponse {
    date: NaiveDate,
    signals: Vec<crate::db::models::TradingSignal>,
}

/// `GET /signals/today`: auto-fallback to the latest date carrying
/// signals when none were requested and today has none (spec.md §6).
async fn signals_today(
    State(state): State<AppState>,
    Query(query): Query<SignalsTodayQuery>,
) -> Result<Json<SignalsTodayResponse>, ApiError> {
    let conn = state.pool.get().map_err(ApiError::from)?;
    let requested = query.date;
    let target = match requested {
        Some(d) => d,
        None => Utc::now().date_naive(),
    };

    let mut signals = crate::db::repo::signals_for_date(&conn, target).map_err(ApiError::from)?;
    let mut date = target;
    if signals.is_empty() && requested.is_none() {
        if let Some(latest) = crate::db::repo::latest_signal_date(&conn).map_err(ApiError::from)? {
            date = latest;
            signals = crate::db::repo::signals_for_date(&conn, latest).map_err(ApiError::from)?;
        }
    }
    Ok(Json(SignalsTodayResponse { date, signals }))
}

#[derive(Deserialize)]
struct GenerateSignalsRequest {
    #[serde(default)]
    date: Option<NaiveDate>,
}

/// Ad hoc signal generation, outside the Scheduled Pipeline's daily
/// cadence: scans the currently-stored universe and streams the same
/// event vocabulary `signals_engine::scan` produces (spec.md §4.4).
async fn generate_signals_stream(
    State(state): State<AppState>,
    Json(req): Json<GenerateSignalsRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let date = req.date.unwrap_or_else(|| Utc::now().date_naive());
    let conn = state.pool.get().map_err(ApiError::from)?;

    let mut universe = Vec::new();
    for code in crate::db::repo::all_stock_codes(&conn).map_err(ApiError::from)? {
        let bars = crate::db::repo::trailing_window(&conn, &code, date, crate::signals_engine::TRAILING_WINDOW_DAYS as usize)
            .map_err(ApiError::from)?;
        if bars.len() >= crate::signals_engine::MIN_BARS_REQUIRED {
            universe.push((code, bars));
        }
    }
    let strategies = crate::db::repo::list_strategies(&conn).map_err(ApiError::from)?;
    let held: std::collections::HashSet<String> =
        crate::db::repo::all_positions(&conn).map_err(ApiError::from)?.into_iter().map(|p| p.code).collect();
    let sentiment = crate::db::repo::latest_sentiment_score(&conn).map_err(ApiError::from)?;
    let codes: Vec<String> = universe.iter().map(|(c, _)| c.clone()).collect();

    let result = crate::signals_engine::scan(date, &universe, &strategies, &held, sentiment);
    crate::signals_engine::persist(&conn, date, &codes, &result.signals).map_err(ApiError::from)?;

    let events: Vec<Result<SseEvent, Infallible>> = result
        .events
        .into_iter()
        .map(|e| Ok(SseEvent::default().json_data(signal_event_json(&e.kind)).unwrap_or_else(|_| SseEvent::default())))
        .collect();
    Ok(Sse::new(tokio_stream::iter(events)))
}

fn signal_event_json(kind: &crate::signals_engine::EventKind) -> serde_json::Value {
    use crate::signals_engine::EventKind;
    match kind {
        EventKind::Start { total, cached, date } => serde_json::json!({ "type": "start", "total": total, "cached": cached, "date": date }),
        EventKind::Progress { current, total, pct, code, name } => {
            serde_json::json!({ "type": "progress", "current": current, "total": total, "pct": pct, "code": code, "name": name })
        }
        EventKind::Signal(signal) => serde_json::json!({ "type": "signal", "signal": signal }),
        EventKind::Done { total_generated } => serde_json::json!({ "type": "done", "total_generated": total_generated }),
    }
}

#[derive(Deserialize)]
struct RunBacktestRequest {
    name: String,
    #[serde(default)]
    description: String,
    buy_conditions: Vec<crate::conditions::Condition>,
    sell_conditions: Vec<crate::conditions::Condition>,
    #[serde(default)]
    exit_config: crate::db::models::ExitConfig,
    #[serde(default)]
    capital: Option<f64>,
}

/// One-off backtest of an ad hoc strategy over the full stored universe,
/// outside the Experiment Runner's candidate-batch lifecycle (spec.md §6).
async fn run_backtest(
    State(state): State<AppState>,
    Json(req): Json<RunBacktestRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let today = Utc::now().date_naive();
    let window_start = today - chrono::Duration::days(365 * 3);
    let capital = req.capital.unwrap_or(state.config.risk_control.default_capital);

    let bus = Arc::new(ProgressBus::new());
    let (reachable, reason) = crate::validator::check_reachable(&req.buy_conditions);
    if !reachable {
        bus.push(crate::runner::progress::ProgressEventKind::BacktestSkip { strategy_id: 0, name: req.name.clone(), reason });
        bus.finish();
        return Ok(sse_from_bus(bus, 0));
    }

    bus.push(crate::runner::progress::ProgressEventKind::BacktestStart { strategy_id: 0, name: req.name.clone() });

    let mut bars = std::collections::HashMap::new();
    {
        let conn = state.pool.get().map_err(ApiError::from)?;
        for code in crate::db::repo::all_stock_codes(&conn).map_err(ApiError::from)? {
            let series = crate::db::repo::trailing_window(&conn, &code, today, 800).map_err(ApiError::from)?;
            if series.len() >= 60 {
                bars.insert(code, series);
            }
        }
    }
    let regimes = {
        let conn = state.pool.get().map_err(ApiError::from)?;
        crate::regime::regime_map(&conn, window_start, today).unwrap_or_default()
    };

    let strategy = crate::db::models::Strategy {
        id: 0,
        name: req.name.clone(),
        description: req.description,
        buy_conditions: req.buy_conditions,
        sell_conditions: req.sell_conditions,
        exit_config: req.exit_config,
        portfolio_config: None,
        category: None,
        source_experiment_id: None,
    };
    let inputs = crate::backtest::BacktestInputs {
        bars,
        regimes,
        initial_capital: capital,
        max_positions: state.config.risk_control.max_positions as usize,
        max_position_pct: state.config.risk_control.max_position_pct,
    };
    let cancel = tokio_util::sync::CancellationToken::new();

    let name = req.name;
    let outcome = tokio::task::spawn_blocking(move || crate::backtest::run(&strategy, &inputs, &cancel))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("backtest task panicked: {e}")))?;

    match outcome {
        Ok(outcome) => {
            let weights = crate::backtest::ScoreWeights::from(&state.config.ai_lab);
            let trades: Vec<_> = outcome.trades.iter().cloned().map(|t| t.into_model(None)).collect();
            let metrics = crate::backtest::metrics::compute(&trades, &outcome.equity_curve, capital);
            let score = crate::backtest::score(&metrics, &weights);
            bus.push(crate::runner::progress::ProgressEventKind::BacktestDone { strategy_id: 0, name: name.clone(), score });
        }
        Err(e) => {
            bus.push(crate::runner::progress::ProgressEventKind::BacktestError { strategy_id: 0, name: name.clone(), message: e.to_string() });
        }
    }
    bus.finish();
    Ok(sse_from_bus(bus, 0))
}
