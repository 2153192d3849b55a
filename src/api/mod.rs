use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::db::models::{EventId, MarketType, Pick, PickOutcome, Side};
use crate::db::Repository;
use crate::odds::OddsStore;
use crate::settlement::SettlementEngine;

type ApiResult<T> = Result<T, (StatusCode, String)>;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub odds: Arc<OddsStore>,
    pub settlement: Arc<SettlementEngine>,
    /// Limit applied to on-demand settlement runs that do not pass one
    pub default_limit: usize,
}

/// Build the ops router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/events/:id", get(event_handler))
        .route("/api/events/:id/odds", get(market_history_handler))
        .route("/api/events/:id/odds/latest", get(latest_odds_handler))
        .route("/api/picks", post(record_pick_handler))
        .route("/api/picks/:id", get(pick_handler))
        .route("/api/settlement/run", post(settlement_handler))
        .route("/api/ingestion-runs", get(ingestion_runs_handler))
        .route("/api/quarantine", get(quarantine_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg.into())
}

fn not_found(what: &str, id: i64) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("{} {} not found", what, id))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /api/events/:id
async fn event_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EventId>,
) -> ApiResult<impl IntoResponse> {
    let event = state
        .repo
        .get_event(id)
        .map_err(internal)?
        .ok_or_else(|| not_found("event", id))?;
    let result = state.repo.get_game_result(id).map_err(internal)?;
    Ok(Json(json!({ "event": event, "result": result })))
}

/// GET /api/events/:id/odds
async fn market_history_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EventId>,
) -> ApiResult<impl IntoResponse> {
    state
        .odds
        .get_market_history(id)
        .map(Json)
        .map_err(internal)
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    market: String,
    side: Option<String>,
}

/// GET /api/events/:id/odds/latest?market=SPREAD&side=HOME
async fn latest_odds_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EventId>,
    Query(query): Query<LatestQuery>,
) -> ApiResult<impl IntoResponse> {
    let market: MarketType = query.market.parse().map_err(|e| bad_request(format!("{}", e)))?;
    let side: Option<Side> = query
        .side
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|e| bad_request(format!("{}", e)))?;
    let snapshot = state
        .odds
        .get_latest_odds(id, market, side)
        .map_err(internal)?;
    Ok(Json(snapshot))
}

/// Pick submission. Either `event_id` or the matchup plus `kickoff` must be
/// given; matchup-only picks are resolved by the pick resolution job.
#[derive(Debug, Deserialize)]
pub struct PickRequest {
    pub league: String,
    pub event_id: Option<EventId>,
    #[serde(default)]
    pub home_name: String,
    #[serde(default)]
    pub away_name: String,
    pub kickoff: Option<DateTime<Utc>>,
    pub market_type: MarketType,
    pub side: Side,
    pub line: Option<f64>,
    pub price: f64,
    pub open_line: Option<f64>,
    pub open_price: Option<f64>,
}

impl PickRequest {
    fn into_pick(self, now: DateTime<Utc>) -> Result<Pick, String> {
        if !self.market_type.accepts(self.side) {
            return Err(format!("side {} is not valid for {}", self.side, self.market_type));
        }
        if self.market_type.is_line_based() && !self.line.is_some_and(f64::is_finite) {
            return Err(format!("{} pick needs a finite line", self.market_type));
        }
        if !self.price.is_finite() {
            return Err("price must be finite".into());
        }
        if self.event_id.is_none()
            && (self.home_name.trim().is_empty()
                || self.away_name.trim().is_empty()
                || self.kickoff.is_none())
        {
            return Err("event_id or home_name, away_name and kickoff are required".into());
        }
        Ok(Pick {
            id: None,
            league: self.league.trim().to_ascii_uppercase(),
            event_id: self.event_id,
            home_name: self.home_name,
            away_name: self.away_name,
            kickoff: self.kickoff,
            market_type: self.market_type,
            side: self.side,
            line: match self.market_type {
                MarketType::Moneyline => None,
                _ => self.line,
            },
            price: self.price,
            open_line: self.open_line,
            open_price: self.open_price,
            outcome: PickOutcome::Pending,
            closing_line: None,
            closing_price: None,
            clv: None,
            clv_recorded_at: None,
            placed_at: now,
            graded_at: None,
            resolution_attempts: 0,
            quarantined: false,
        })
    }
}

/// POST /api/picks
async fn record_pick_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PickRequest>,
) -> ApiResult<impl IntoResponse> {
    if let Some(event_id) = request.event_id {
        if state.repo.get_event(event_id).map_err(internal)?.is_none() {
            return Err(not_found("event", event_id));
        }
    }
    let pick = request.into_pick(Utc::now()).map_err(bad_request)?;
    let id = state.repo.insert_pick(&pick).map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// GET /api/picks/:id
async fn pick_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state
        .repo
        .get_pick(id)
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found("pick", id))
}

#[derive(Debug, Deserialize)]
struct SettlementQuery {
    league: Option<String>,
    limit: Option<usize>,
}

/// POST /api/settlement/run?league=NCAAM&limit=100
async fn settlement_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SettlementQuery>,
) -> ApiResult<impl IntoResponse> {
    let engine = state.settlement.clone();
    let league = query.league.map(|l| l.to_ascii_uppercase());
    let limit = query.limit.unwrap_or(state.default_limit);
    let report = tokio::task::spawn_blocking(move || {
        engine.run_settlement_cycle(league.as_deref(), Some(limit))
    })
    .await
    .map_err(|e| internal(e.into()))?
    .map_err(internal)?;
    Ok(Json(report))
}

/// GET /api/ingestion-runs
async fn ingestion_runs_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    state
        .repo
        .recent_ingestion_runs(100)
        .map(Json)
        .map_err(internal)
}

/// GET /api/quarantine
async fn quarantine_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    state.repo.list_unresolved(200).map(Json).map_err(internal)
}
