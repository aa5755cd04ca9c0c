use std::sync::atomic::Ordering;

use quorum_core::UserId;
use sqlx::Row;

use super::{
    auth::now_unix,
    core::{AppState, RATE_LIMIT_SWEEP_INTERVAL_SECS},
    metrics::record_rate_limit_hit,
};

/// Shared per-user send counter for one fixed window. Lives in the
/// database when one is configured so every process increments the same
/// bucket; the in-memory form covers single-process deployments.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RateBucket {
    pub(crate) window_start_unix: i64,
    pub(crate) count: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("message rate limit exceeded")]
pub(crate) struct RateLimitExceeded;

fn window_start(now: i64, window_secs: i64) -> i64 {
    now - now.rem_euclid(window_secs)
}

/// Atomically count a send against the user's current window and reject
/// once the post-increment count exceeds the limit. The increment is
/// deliberately not rolled back on rejection: racing sends may overshoot
/// the stored count by the number of in-flight increments, which only
/// ever makes the limiter stricter.
pub(crate) async fn check_message_rate(
    state: &AppState,
    user_id: UserId,
) -> Result<u32, RateLimitExceeded> {
    let now = now_unix();
    let window_secs = state.runtime.message_rate_window_secs;
    let limit = state.runtime.message_rate_limit;
    let window = window_start(now, window_secs);
    maybe_sweep_rate_buckets(state, now).await;

    let count = if let Some(pool) = &state.db_pool {
        let _ = state.store.ensure_schema().await;
        let row = sqlx::query(
            "INSERT INTO rate_buckets (user_id, window_start_unix, count)
             VALUES ($1, $2, 1)
             ON CONFLICT (user_id, window_start_unix)
             DO UPDATE SET count = rate_buckets.count + 1
             RETURNING count",
        )
        .bind(user_id.to_string())
        .bind(window)
        .fetch_one(pool)
        .await;
        match row.and_then(|row| row.try_get::<i32, _>("count")) {
            // A limiter outage must not block sends; fail open at count 1.
            Err(_) => 1,
            Ok(count) => u32::try_from(count).unwrap_or(u32::MAX),
        }
    } else {
        let mut buckets = state.rate_buckets.write().await;
        let bucket = buckets
            .entry(user_id.to_string())
            .and_modify(|bucket| {
                if bucket.window_start_unix != window {
                    bucket.window_start_unix = window;
                    bucket.count = 0;
                }
            })
            .or_insert(RateBucket {
                window_start_unix: window,
                count: 0,
            });
        bucket.count = bucket.count.saturating_add(1);
        bucket.count
    };

    if count > limit {
        record_rate_limit_hit("gateway", "message_send");
        tracing::warn!(
            event = "message.rate_limit",
            user_id = %user_id,
            count,
            limit
        );
        return Err(RateLimitExceeded);
    }
    Ok(count)
}

/// Opportunistic TTL expiry for stale buckets, gated behind an atomic
/// timestamp so concurrent senders do not stampede the sweep.
pub(crate) async fn maybe_sweep_rate_buckets(state: &AppState, now: i64) {
    let last = state.rate_limit_last_sweep_unix.load(Ordering::Relaxed);
    if now.saturating_sub(last) < RATE_LIMIT_SWEEP_INTERVAL_SECS {
        return;
    }
    if state
        .rate_limit_last_sweep_unix
        .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    let window_secs = state.runtime.message_rate_window_secs;
    let expiry_floor = now.saturating_sub(window_secs);
    if let Some(pool) = &state.db_pool {
        let _ = sqlx::query("DELETE FROM rate_buckets WHERE window_start_unix < $1")
            .bind(expiry_floor)
            .execute(pool)
            .await;
        return;
    }

    let mut buckets = state.rate_buckets.write().await;
    buckets.retain(|_, bucket| bucket.window_start_unix >= expiry_floor);
}
