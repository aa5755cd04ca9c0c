use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, StatusCode},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    core::{AppConfig, AppState},
    handlers::{create_session, get_history},
    realtime::{gateway_ws, spawn_bus_relay},
    types::{health, metrics},
};

/// Build the axum router with global security middleware and start the
/// process-wide bus relay. Must run inside a tokio runtime.
///
/// # Errors
/// Returns an error if configured limits are invalid.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    if config.message_rate_limit == 0 {
        return Err(anyhow!("message rate limit must be at least 1 per window"));
    }
    if config.message_rate_window.is_zero() {
        return Err(anyhow!("message rate window must be at least 1 second"));
    }
    if config.gateway_outbound_queue == 0 {
        return Err(anyhow!("gateway outbound queue must hold at least 1 event"));
    }
    if config.bus_capacity == 0 {
        return Err(anyhow!("bus capacity must hold at least 1 event"));
    }
    if config.max_gateway_event_bytes > quorum_protocol::MAX_EVENT_BYTES {
        return Err(anyhow!(
            "gateway event limit cannot exceed protocol max of {} bytes",
            quorum_protocol::MAX_EVENT_BYTES
        ));
    }

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let app_state = AppState::new(config)?;
    spawn_bus_relay(app_state.clone());
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    Ok(Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/history", get(get_history))
        .route("/auth/session", post(create_session))
        .route("/gateway/ws", get(gateway_ws))
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(governor_layer),
        ))
}
