use quorum_core::{MessageContent, MessageKind, Room};
use quorum_protocol::MessageBroadcastPayload;
use ulid::Ulid;

use super::{
    auth::now_unix,
    core::{AppState, Identity},
    gateway_events,
    rate_limit::check_message_rate,
    realtime::publish_room_event,
    store::StoredMessage,
};

/// Why a send was refused. Every rejection short-circuits the pipeline:
/// validation and rate failures leave no persisted row, a persistence
/// failure publishes nothing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum SendRejection {
    #[error("message content failed validation")]
    InvalidContent,
    #[error("message rate limit exceeded")]
    RateLimited,
    #[error("message could not be persisted")]
    Persistence,
}

impl SendRejection {
    /// User-facing text carried on `message:error`.
    pub(crate) fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidContent => "Invalid message",
            Self::RateLimited => "Rate limit exceeded. Slow down.",
            Self::Persistence => "Failed to send message",
        }
    }
}

/// Ingest one user message: validate, count against the sender's rate
/// window, persist, then fan out the canonical payload to the room. The
/// sender's own connection receives the broadcast too and reconciles by
/// `client_message_id` rather than suppressing self-delivery.
pub(crate) async fn submit_message(
    state: &AppState,
    identity: &Identity,
    room: Room,
    content: String,
    client_message_id: Option<String>,
) -> Result<MessageBroadcastPayload, SendRejection> {
    let content =
        MessageContent::try_from(content).map_err(|_| SendRejection::InvalidContent)?;

    check_message_rate(state, identity.user_id)
        .await
        .map_err(|_| SendRejection::RateLimited)?;

    let record = state
        .store
        .append(
            identity.user_id,
            &identity.display_name,
            room,
            content.as_str(),
            MessageKind::User,
            now_unix(),
        )
        .await
        .map_err(|error| {
            tracing::error!(event = "message.persist_failed", error = %error);
            SendRejection::Persistence
        })?;

    let payload = payload_from_record(&record, client_message_id, broadcast_role(identity));
    let event = gateway_events::message_new(room, &payload);
    publish_room_event(state, room, &event).await;
    tracing::debug!(
        event = "message.accepted",
        user_id = %identity.user_id,
        room = %room,
        message_id = %payload.id
    );
    Ok(payload)
}

/// Fan out a transient system notice (join announcements and the like).
/// Same payload shape as `message:new` with `kind = "system"` and a
/// fresh id; never persisted, so history stays user messages only.
pub(crate) async fn broadcast_system_notice(
    state: &AppState,
    room: Room,
    subject: &Identity,
    text: &str,
) {
    let created_at_unix = now_unix();
    let payload = MessageBroadcastPayload {
        id: Ulid::new().to_string(),
        user_id: subject.user_id.to_string(),
        client_message_id: None,
        user: subject.display_name.clone(),
        role: String::from("system"),
        message: text.to_owned(),
        created_at_unix,
        time: format_clock_time(created_at_unix),
        kind: MessageKind::System.as_str().to_owned(),
    };
    let event = gateway_events::message_system(room, &payload);
    publish_room_event(state, room, &event).await;
}

pub(crate) fn payload_from_record(
    record: &StoredMessage,
    client_message_id: Option<String>,
    role: &str,
) -> MessageBroadcastPayload {
    MessageBroadcastPayload {
        id: record.id.clone(),
        user_id: record.user_id.clone(),
        client_message_id,
        user: record.author_name.clone(),
        role: role.to_owned(),
        message: record.content.clone(),
        created_at_unix: record.created_at_unix,
        time: format_clock_time(record.created_at_unix),
        kind: record.kind.as_str().to_owned(),
    }
}

pub(crate) fn broadcast_role(identity: &Identity) -> &'static str {
    if identity.is_privileged {
        "member"
    } else {
        "guest"
    }
}

/// HH:MM display clock (UTC) for a unix timestamp.
pub(crate) fn format_clock_time(unix: i64) -> String {
    let seconds_of_day = unix.rem_euclid(24 * 60 * 60);
    let hours = seconds_of_day / 3600;
    let minutes = (seconds_of_day % 3600) / 60;
    format!("{hours:02}:{minutes:02}")
}
