//! Administrative routes for runtime policy changes and traffic statistics.
//!
//! Mount these on an internal listener only; nothing here is authenticated.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::TollgateError;
use crate::ratelimit::{AdmissionEngine, Policy};
use crate::store::ActionStatistics;

/// Statistics window used when the query omits one.
pub const DEFAULT_STATS_TIMEFRAME_SECS: u64 = 3_600;

#[derive(Debug, Deserialize)]
pub struct UpdateLimit {
    pub max_requests: u64,
    pub window_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_timeframe")]
    pub timeframe: u64,
}

fn default_timeframe() -> u64 {
    DEFAULT_STATS_TIMEFRAME_SECS
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub timeframe: u64,
    pub actions: Vec<ActionStatistics>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Routes: `GET /limits`, `PUT|DELETE /limits/:action`, `GET /stats`.
pub fn router(engine: AdmissionEngine) -> Router {
    Router::new()
        .route("/limits", get(list_limits))
        .route("/limits/:action", get(get_limit).put(update_limit).delete(remove_limit))
        .route("/stats", get(statistics))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(engine)
}

async fn list_limits(State(engine): State<AdmissionEngine>) -> Json<BTreeMap<String, Policy>> {
    Json(engine.get_limits())
}

async fn get_limit(
    State(engine): State<AdmissionEngine>,
    Path(action): Path<String>,
) -> Response {
    match engine.get_limits().get(&action) {
        Some(policy) => Json(*policy).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no policy for '{}'", action)),
    }
}

async fn update_limit(
    State(engine): State<AdmissionEngine>,
    Path(action): Path<String>,
    Json(body): Json<UpdateLimit>,
) -> Response {
    match engine.update_limit(&action, body.max_requests, body.window_seconds) {
        Ok(policy) => Json(policy).into_response(),
        Err(e) => failure(e),
    }
}

async fn remove_limit(
    State(engine): State<AdmissionEngine>,
    Path(action): Path<String>,
) -> Response {
    match engine.remove_limit(&action) {
        Ok(Some(_)) => StatusCode::NO_CONTENT.into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("no policy for '{}'", action)),
        Err(e) => failure(e),
    }
}

async fn statistics(
    State(engine): State<AdmissionEngine>,
    Query(query): Query<StatsQuery>,
) -> Response {
    match engine.statistics(query.timeframe).await {
        Ok(actions) => Json(StatsResponse {
            timeframe: query.timeframe,
            actions,
        })
        .into_response(),
        Err(e) => failure(e),
    }
}

fn failure(e: TollgateError) -> Response {
    match e {
        TollgateError::InvalidPolicy(message) => error_response(StatusCode::BAD_REQUEST, message),
        other => {
            error!(error = %other, "Admin request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}
