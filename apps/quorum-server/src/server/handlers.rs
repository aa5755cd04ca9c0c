use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use quorum_core::{DisplayName, Room, UserId};
use quorum_protocol::HistoryResponsePayload;

use super::{
    auth::{authenticate, issue_session},
    core::{AppState, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT},
    errors::AuthFailure,
    pipeline::payload_from_record,
    types::{HistoryQuery, SessionRequest, SessionResponse},
};

/// Paged history read, newest first. The cursor is a plain row offset:
/// `next_cursor = cursor + limit` whenever a full page plus one more row
/// exists, `null` otherwise. Offsets can skip or repeat rows when new
/// messages land between pages; the client cache's dedup-by-id guard
/// absorbs that, which is why an id cursor was not adopted here.
pub(crate) async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponsePayload>, AuthFailure> {
    let identity = authenticate(&state, &headers).await?;

    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(AuthFailure::InvalidRequest);
    }
    let limit_u64 = u64::try_from(limit).map_err(|_| AuthFailure::InvalidRequest)?;
    let room = match query.room.as_deref() {
        None => Room::Global,
        Some(name) => {
            Room::try_from(name.to_owned()).map_err(|_| AuthFailure::InvalidRequest)?
        }
    };
    if room.is_privileged() && !identity.is_privileged {
        return Err(AuthFailure::Forbidden);
    }
    let cursor = query.cursor.unwrap_or(0);
    let offset = usize::try_from(cursor).map_err(|_| AuthFailure::InvalidRequest)?;

    let query_start = Instant::now();
    let mut rows = state
        .store
        .history(room, limit + 1, offset)
        .await
        .map_err(|_| AuthFailure::Internal)?;

    let next_cursor = if rows.len() > limit {
        rows.truncate(limit);
        Some(cursor + limit_u64)
    } else {
        None
    };

    let requester = identity.user_id.to_string();
    let items = rows
        .iter()
        .map(|record| {
            let role = if record.user_id == requester {
                "you"
            } else {
                "member"
            };
            payload_from_record(record, None, role)
        })
        .collect::<Vec<_>>();

    let duration_ms = u64::try_from(query_start.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::debug!(
        event = "history.fetched",
        user_id = %identity.user_id,
        room = %room,
        items = items.len(),
        next_cursor = next_cursor.is_some(),
        duration_ms
    );
    if duration_ms > 500 {
        tracing::warn!(event = "history.slow_query", room = %room, duration_ms);
    }

    Ok(Json(HistoryResponsePayload { items, next_cursor }))
}

/// Mint a session token for a user record. This is the stand-in for the
/// external credential issuer; when an issuer key is configured the
/// caller must present it, otherwise the endpoint is open (dev, tests).
pub(crate) async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, AuthFailure> {
    if let Some(expected) = &state.runtime.session_issuer_key {
        let provided = headers.get("x-issuer-key").and_then(|value| value.to_str().ok());
        if provided != Some(expected.as_str()) {
            return Err(AuthFailure::Unauthorized);
        }
    }

    let display_name = DisplayName::try_from(payload.display_name)
        .map_err(|_| AuthFailure::InvalidRequest)?;
    let user_id = match payload.user_id {
        Some(raw) => UserId::try_from(raw).map_err(|_| AuthFailure::InvalidRequest)?,
        None => UserId::new(),
    };
    let ttl_secs = payload.ttl_secs.unwrap_or(state.runtime.session_ttl_secs);
    if ttl_secs <= 0 || ttl_secs > state.runtime.session_ttl_secs {
        return Err(AuthFailure::InvalidRequest);
    }

    let (session_token, expires_at_unix) = issue_session(
        &state,
        user_id,
        display_name.as_str(),
        payload.is_privileged.unwrap_or(false),
        ttl_secs,
    )
    .await?;

    Ok(Json(SessionResponse {
        session_token,
        user_id: user_id.to_string(),
        expires_at_unix,
    }))
}
