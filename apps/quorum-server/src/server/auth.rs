use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use quorum_core::UserId;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use sqlx::Row;
use ulid::Ulid;

use super::{
    core::{AppState, Identity, SessionRecord},
    errors::AuthFailure,
};

/// Resolve the handshake credential from request headers.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, AuthFailure> {
    let token = bearer_token(headers).ok_or(AuthFailure::Unauthorized)?;
    authenticate_with_token(state, token).await
}

/// Validate a `{session_id}.{secret}` token against the session store and
/// return the identity it belongs to. Expired or unknown sessions fail
/// with `Unauthorized`; there is no retry and no refresh here — issuing
/// credentials is the external collaborator's job.
pub(crate) async fn authenticate_with_token(
    state: &AppState,
    token: &str,
) -> Result<Identity, AuthFailure> {
    if token.is_empty() || token.len() > 512 {
        return Err(AuthFailure::Unauthorized);
    }
    let session_id = token
        .split('.')
        .next()
        .ok_or(AuthFailure::Unauthorized)?
        .to_owned();
    let token_hash = hash_session_token(token);
    let now = now_unix();

    if let Some(pool) = &state.db_pool {
        state
            .store
            .ensure_schema()
            .await
            .map_err(|_| AuthFailure::Internal)?;
        let row = sqlx::query(
            "SELECT s.user_id, s.token_hash, s.expires_at_unix, u.display_name, u.is_privileged
             FROM sessions s
             JOIN users u ON u.user_id = s.user_id
             WHERE s.session_id = $1",
        )
        .bind(&session_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| AuthFailure::Internal)?;
        let row = row.ok_or(AuthFailure::Unauthorized)?;

        let stored_hash: String = row.try_get("token_hash").map_err(|_| AuthFailure::Internal)?;
        let expires_at_unix: i64 = row
            .try_get("expires_at_unix")
            .map_err(|_| AuthFailure::Internal)?;
        if stored_hash != encode_hash(token_hash) || expires_at_unix < now {
            return Err(AuthFailure::Unauthorized);
        }

        let user_id: String = row.try_get("user_id").map_err(|_| AuthFailure::Internal)?;
        let display_name: String = row
            .try_get("display_name")
            .map_err(|_| AuthFailure::Internal)?;
        let is_privileged: bool = row
            .try_get("is_privileged")
            .map_err(|_| AuthFailure::Internal)?;
        return Ok(Identity {
            user_id: UserId::try_from(user_id).map_err(|_| AuthFailure::Unauthorized)?,
            display_name,
            is_privileged,
        });
    }

    let sessions = state.sessions.read().await;
    let session = sessions.get(&session_id).ok_or(AuthFailure::Unauthorized)?;
    if session.token_hash != token_hash || session.expires_at_unix < now {
        return Err(AuthFailure::Unauthorized);
    }
    Ok(Identity {
        user_id: session.user_id,
        display_name: session.display_name.clone(),
        is_privileged: session.is_privileged,
    })
}

/// Mint a session for a user record, upserting the user row. Stand-in
/// for the external credential issuer; only the hash of the token is
/// kept at rest.
pub(crate) async fn issue_session(
    state: &AppState,
    user_id: UserId,
    display_name: &str,
    is_privileged: bool,
    ttl_secs: i64,
) -> Result<(String, i64), AuthFailure> {
    let session_id = Ulid::new().to_string();
    let mut secret = [0_u8; 32];
    OsRng.fill_bytes(&mut secret);
    let secret = URL_SAFE_NO_PAD.encode(secret);
    let token = format!("{session_id}.{secret}");
    let token_hash = hash_session_token(&token);
    let expires_at_unix = now_unix().saturating_add(ttl_secs);

    if let Some(pool) = &state.db_pool {
        state
            .store
            .ensure_schema()
            .await
            .map_err(|_| AuthFailure::Internal)?;
        sqlx::query(
            "INSERT INTO users (user_id, display_name, is_privileged)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id)
             DO UPDATE SET display_name = $2, is_privileged = $3",
        )
        .bind(user_id.to_string())
        .bind(display_name)
        .bind(is_privileged)
        .execute(pool)
        .await
        .map_err(|_| AuthFailure::Internal)?;
        sqlx::query(
            "INSERT INTO sessions (session_id, user_id, token_hash, expires_at_unix)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&session_id)
        .bind(user_id.to_string())
        .bind(encode_hash(token_hash))
        .bind(expires_at_unix)
        .execute(pool)
        .await
        .map_err(|_| AuthFailure::Internal)?;
        return Ok((token, expires_at_unix));
    }

    state.sessions.write().await.insert(
        session_id,
        SessionRecord {
            user_id,
            display_name: display_name.to_owned(),
            is_privileged,
            token_hash,
            expires_at_unix,
        },
    );
    Ok((token, expires_at_unix))
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn hash_session_token(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn encode_hash(hash: [u8; 32]) -> String {
    URL_SAFE_NO_PAD.encode(hash)
}

pub(crate) fn now_unix() -> i64 {
    let now = SystemTime::now();
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}
