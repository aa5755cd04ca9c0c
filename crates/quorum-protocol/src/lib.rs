#![forbid(unsafe_code)]

mod events;

use serde::{Deserialize, Serialize};

pub use events::{
    gateway_event_manifest, parse_client_event, parse_gateway_event_manifest, parse_server_event,
    ClientEvent, EventRoomScope, GatewayEventManifest, GatewayEventManifestEntry,
    GatewayEventManifestError, GatewayEventScope, HistoryResponsePayload, MessageAckPayload,
    MessageBroadcastPayload, MessageErrorPayload, MessageSendPayload, PresenceDeltaPayload,
    PresenceEntryPayload, ServerEvent, TypingEventPayload, TypingSignalPayload,
    MESSAGE_ACK_EVENT, MESSAGE_ERROR_EVENT, MESSAGE_NEW_EVENT, MESSAGE_SEND_EVENT,
    MESSAGE_SYSTEM_EVENT, PRESENCE_SYNC_EVENT, PRIVATE_MESSAGE_NEW_EVENT,
    PRIVATE_MESSAGE_SYSTEM_EVENT, PRIVATE_PRESENCE_SYNC_EVENT, PRIVATE_TYPING_START_EVENT,
    PRIVATE_TYPING_STOP_EVENT, PRIVATE_USER_OFFLINE_EVENT, PRIVATE_USER_ONLINE_EVENT,
    TYPING_START_EVENT, TYPING_STOP_EVENT, USER_OFFLINE_EVENT, USER_ONLINE_EVENT,
};

/// Current gateway envelope version.
pub const PROTOCOL_VERSION: u16 = 1;
/// Maximum allowed gateway payload bytes.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

/// Versioned gateway envelope. All events use `{ v, t, d }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    pub v: u16,
    pub t: EventType,
    pub d: T,
}

/// Event type identifier with a strict character allowlist. Names are
/// colon-separated segments (`message:new`, `private:user:online`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventType {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_event_type(&value)?;
        Ok(Self(value))
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// Parse and validate an incoming envelope at the network boundary.
///
/// # Errors
/// Returns [`ProtocolError`] if the payload exceeds limits, is malformed JSON,
/// contains an unsupported version, or has an invalid event type.
pub fn parse_envelope(input: &[u8]) -> Result<Envelope<serde_json::Value>, ProtocolError> {
    if input.len() > MAX_EVENT_BYTES {
        return Err(ProtocolError::OversizedPayload {
            max: MAX_EVENT_BYTES,
            actual: input.len(),
        });
    }

    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(input)?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            actual: envelope.v,
        });
    }

    Ok(envelope)
}

pub(crate) fn validate_event_type(value: &str) -> Result<(), ProtocolError> {
    const MAX_LEN: usize = 64;

    if value.is_empty() || value.len() > MAX_LEN {
        return Err(ProtocolError::InvalidEventType);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == ':')
    {
        return Ok(());
    }

    Err(ProtocolError::InvalidEventType)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload exceeds max size: max={max} bytes actual={actual} bytes")]
    OversizedPayload { max: usize, actual: usize },
    #[error("unsupported envelope version: expected={expected} actual={actual}")]
    UnsupportedVersion { expected: u16, actual: u16 },
    #[error("invalid event type")]
    InvalidEventType,
    #[error("unknown event type `{0}`")]
    UnknownEventType(String),
    #[error("invalid event payload for `{0}`")]
    InvalidEventPayload(String),
    #[error("invalid json payload")]
    InvalidJson,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_envelope, EventType, ProtocolError, PROTOCOL_VERSION};

    #[test]
    fn event_type_accepts_colon_separated_identifier() {
        let event_type = EventType::try_from(String::from("message:new")).unwrap();
        assert_eq!(event_type.as_str(), "message:new");
    }

    #[test]
    fn event_type_rejects_invalid_identifier() {
        let error = EventType::try_from(String::from("Message New")).unwrap_err();
        assert_eq!(error, ProtocolError::InvalidEventType);
    }

    #[test]
    fn parse_rejects_unsupported_version() {
        let payload = br#"{"v":99,"t":"presence:sync","d":[]}"#;
        let error = parse_envelope(payload).unwrap_err();
        assert_eq!(
            error,
            ProtocolError::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                actual: 99,
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let payload = br#"{"v":1,"t":"message:send","d":{},"extra":1}"#;
        let error = parse_envelope(payload).unwrap_err();
        assert_eq!(error, ProtocolError::InvalidJson);
    }

    #[test]
    fn parse_accepts_valid_payload() {
        let payload = br#"{"v":1,"t":"message:send","d":{"content":"hi"}}"#;
        let envelope = parse_envelope(payload).unwrap();

        assert_eq!(envelope.v, 1);
        assert_eq!(envelope.t.as_str(), "message:send");
        assert_eq!(envelope.d["content"], "hi");
    }

    #[test]
    fn parse_rejects_oversized_input() {
        let mut payload = Vec::from(&br#"{"v":1,"t":"message:send","d":""#[..]);
        payload.extend(std::iter::repeat_n(b'x', super::MAX_EVENT_BYTES));
        payload.extend(br#""}"#);
        let error = parse_envelope(&payload).unwrap_err();
        assert!(matches!(error, ProtocolError::OversizedPayload { .. }));
    }
}
