use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{
    core::{AppState, METRICS_TEXT_CONTENT_TYPE},
    metrics::render_metrics,
};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
    pub(crate) uptime_seconds: u64,
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.uptime_seconds(),
    })
}

pub(crate) async fn metrics() -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        render_metrics(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub(crate) struct AuthError {
    pub(crate) error: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayAuthQuery {
    pub(crate) session_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    pub(crate) limit: Option<usize>,
    pub(crate) cursor: Option<u64>,
    pub(crate) room: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SessionRequest {
    pub(crate) user_id: Option<String>,
    pub(crate) display_name: String,
    pub(crate) is_privileged: Option<bool>,
    pub(crate) ttl_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SessionResponse {
    pub(crate) session_token: String,
    pub(crate) user_id: String,
    pub(crate) expires_at_unix: i64,
}
