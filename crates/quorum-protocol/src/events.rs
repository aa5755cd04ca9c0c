use std::{collections::BTreeSet, sync::OnceLock};

use serde::{Deserialize, Serialize};

use crate::{validate_event_type, Envelope, ProtocolError};

const GATEWAY_EVENT_MANIFEST_JSON: &str = include_str!("events/gateway_events_manifest.json");

pub const MESSAGE_SEND_EVENT: &str = "message:send";
pub const MESSAGE_ACK_EVENT: &str = "message:ack";
pub const MESSAGE_NEW_EVENT: &str = "message:new";
pub const MESSAGE_SYSTEM_EVENT: &str = "message:system";
pub const MESSAGE_ERROR_EVENT: &str = "message:error";
pub const TYPING_START_EVENT: &str = "typing:start";
pub const TYPING_STOP_EVENT: &str = "typing:stop";
pub const USER_ONLINE_EVENT: &str = "user:online";
pub const USER_OFFLINE_EVENT: &str = "user:offline";
pub const PRESENCE_SYNC_EVENT: &str = "presence:sync";

pub const PRIVATE_MESSAGE_NEW_EVENT: &str = "private:message:new";
pub const PRIVATE_MESSAGE_SYSTEM_EVENT: &str = "private:message:system";
pub const PRIVATE_TYPING_START_EVENT: &str = "private:typing:start";
pub const PRIVATE_TYPING_STOP_EVENT: &str = "private:typing:stop";
pub const PRIVATE_USER_ONLINE_EVENT: &str = "private:user:online";
pub const PRIVATE_USER_OFFLINE_EVENT: &str = "private:user:offline";
pub const PRIVATE_PRESENCE_SYNC_EVENT: &str = "private:presence:sync";

const PRIVATE_EVENT_PREFIX: &str = "private:";

/// Client request to post a message. `room` defaults to the global room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageSendPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// Client-side typing signal. The server fills in the sender identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypingSignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

/// Canonical confirmed-message shape, used for `message:new`,
/// `message:system`, and history items alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageBroadcastPayload {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
    pub user: String,
    pub role: String,
    pub message: String,
    pub created_at_unix: i64,
    pub time: String,
    pub kind: String,
}

/// Explicit delivery outcome for a `message:send`, correlated by
/// `client_message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageAckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypingEventPayload {
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceDeltaPayload {
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceEntryPayload {
    pub user_id: String,
    pub name: String,
    pub is_privileged: bool,
}

/// Paged history response returned by the history query service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryResponsePayload {
    pub items: Vec<MessageBroadcastPayload>,
    pub next_cursor: Option<u64>,
}

/// Closed set of events a client may send to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    MessageSend(MessageSendPayload),
    TypingStart(TypingSignalPayload),
    TypingStop(TypingSignalPayload),
}

/// Closed set of events the server emits to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    MessageNew(MessageBroadcastPayload),
    MessageSystem(MessageBroadcastPayload),
    MessageAck(MessageAckPayload),
    MessageError(MessageErrorPayload),
    TypingStart(TypingEventPayload),
    TypingStop(TypingEventPayload),
    UserOnline(PresenceDeltaPayload),
    UserOffline(PresenceDeltaPayload),
    PresenceSync(Vec<PresenceEntryPayload>),
}

/// Which room's event stream a server event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRoomScope {
    Global,
    Members,
}

fn decode<T: serde::de::DeserializeOwned>(
    event_type: &str,
    value: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value)
        .map_err(|_| ProtocolError::InvalidEventPayload(event_type.to_owned()))
}

/// Resolve an ingress envelope into the typed client-event set.
///
/// # Errors
/// Returns [`ProtocolError::UnknownEventType`] for event names outside the
/// contract and [`ProtocolError::InvalidEventPayload`] when the `d` field
/// does not match the event's schema.
pub fn parse_client_event(
    envelope: Envelope<serde_json::Value>,
) -> Result<ClientEvent, ProtocolError> {
    let event_type = envelope.t.as_str().to_owned();
    match event_type.as_str() {
        MESSAGE_SEND_EVENT => Ok(ClientEvent::MessageSend(decode(&event_type, envelope.d)?)),
        TYPING_START_EVENT => Ok(ClientEvent::TypingStart(decode(&event_type, envelope.d)?)),
        TYPING_STOP_EVENT => Ok(ClientEvent::TypingStop(decode(&event_type, envelope.d)?)),
        _ => Err(ProtocolError::UnknownEventType(event_type)),
    }
}

/// Resolve an egress envelope into the typed server-event set plus the
/// room scope it was emitted for (`private:`-prefixed names map to the
/// members room).
///
/// # Errors
/// Returns [`ProtocolError::UnknownEventType`] for event names outside the
/// contract and [`ProtocolError::InvalidEventPayload`] on schema mismatch.
pub fn parse_server_event(
    envelope: Envelope<serde_json::Value>,
) -> Result<(EventRoomScope, ServerEvent), ProtocolError> {
    let full = envelope.t.as_str().to_owned();
    let (scope, base) = match full.strip_prefix(PRIVATE_EVENT_PREFIX) {
        Some(base) => (EventRoomScope::Members, base),
        None => (EventRoomScope::Global, full.as_str()),
    };

    let event = match base {
        MESSAGE_NEW_EVENT => ServerEvent::MessageNew(decode(&full, envelope.d)?),
        MESSAGE_SYSTEM_EVENT => ServerEvent::MessageSystem(decode(&full, envelope.d)?),
        MESSAGE_ACK_EVENT => ServerEvent::MessageAck(decode(&full, envelope.d)?),
        MESSAGE_ERROR_EVENT => ServerEvent::MessageError(decode(&full, envelope.d)?),
        TYPING_START_EVENT => ServerEvent::TypingStart(decode(&full, envelope.d)?),
        TYPING_STOP_EVENT => ServerEvent::TypingStop(decode(&full, envelope.d)?),
        USER_ONLINE_EVENT => ServerEvent::UserOnline(decode(&full, envelope.d)?),
        USER_OFFLINE_EVENT => ServerEvent::UserOffline(decode(&full, envelope.d)?),
        PRESENCE_SYNC_EVENT => ServerEvent::PresenceSync(decode(&full, envelope.d)?),
        _ => return Err(ProtocolError::UnknownEventType(full)),
    };
    Ok((scope, event))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventScope {
    Connection,
    Room,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayEventManifestEntry {
    pub event_type: String,
    pub schema_version: u16,
    pub scope: GatewayEventScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayEventManifest {
    pub events: Vec<GatewayEventManifestEntry>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GatewayEventManifestError {
    #[error("invalid manifest json")]
    InvalidJson,
    #[error("gateway event type `{0}` failed identifier validation")]
    InvalidEventType(String),
    #[error("duplicate gateway event type `{0}` in manifest")]
    DuplicateEventType(String),
    #[error("gateway event `{event_type}` has invalid schema version {schema_version}")]
    InvalidSchemaVersion {
        event_type: String,
        schema_version: u16,
    },
}

impl From<serde_json::Error> for GatewayEventManifestError {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}

/// Parse and validate the machine-readable gateway event manifest.
///
/// # Errors
/// Returns [`GatewayEventManifestError`] when JSON is invalid or when
/// manifest invariants fail (identifier format, duplicates, schema version).
pub fn parse_gateway_event_manifest(
    json: &str,
) -> Result<GatewayEventManifest, GatewayEventManifestError> {
    let manifest: GatewayEventManifest = serde_json::from_str(json)?;
    validate_gateway_event_manifest(&manifest)?;
    Ok(manifest)
}

/// Return the embedded protocol gateway event manifest.
///
/// # Panics
/// Panics if the embedded manifest file is invalid. This is a startup-time
/// invariant and should be prevented by tests.
#[must_use]
pub fn gateway_event_manifest() -> &'static GatewayEventManifest {
    static MANIFEST: OnceLock<GatewayEventManifest> = OnceLock::new();
    MANIFEST.get_or_init(|| {
        parse_gateway_event_manifest(GATEWAY_EVENT_MANIFEST_JSON)
            .expect("gateway event manifest must parse and validate")
    })
}

fn validate_gateway_event_manifest(
    manifest: &GatewayEventManifest,
) -> Result<(), GatewayEventManifestError> {
    let mut seen = BTreeSet::new();

    for entry in &manifest.events {
        validate_event_type(&entry.event_type)
            .map_err(|_| GatewayEventManifestError::InvalidEventType(entry.event_type.clone()))?;

        if entry.schema_version == 0 {
            return Err(GatewayEventManifestError::InvalidSchemaVersion {
                event_type: entry.event_type.clone(),
                schema_version: entry.schema_version,
            });
        }

        if !seen.insert(entry.event_type.clone()) {
            return Err(GatewayEventManifestError::DuplicateEventType(
                entry.event_type.clone(),
            ));
        }
    }

    Ok(())
}
