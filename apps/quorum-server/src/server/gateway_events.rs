use quorum_core::Room;
use quorum_protocol::{
    Envelope, EventType, MessageAckPayload, MessageBroadcastPayload, MessageErrorPayload,
    PresenceDeltaPayload, PresenceEntryPayload, TypingEventPayload, MESSAGE_ACK_EVENT,
    MESSAGE_ERROR_EVENT, MESSAGE_NEW_EVENT, MESSAGE_SYSTEM_EVENT, PRESENCE_SYNC_EVENT,
    PRIVATE_MESSAGE_NEW_EVENT, PRIVATE_MESSAGE_SYSTEM_EVENT, PRIVATE_PRESENCE_SYNC_EVENT,
    PRIVATE_TYPING_START_EVENT, PRIVATE_TYPING_STOP_EVENT, PRIVATE_USER_OFFLINE_EVENT,
    PRIVATE_USER_ONLINE_EVENT, PROTOCOL_VERSION, TYPING_START_EVENT, TYPING_STOP_EVENT,
    USER_OFFLINE_EVENT, USER_ONLINE_EVENT,
};
use serde::Serialize;

/// One serialized outbound event: the exact envelope text handed to the
/// bus and to sockets.
#[derive(Debug, Clone)]
pub(crate) struct GatewayEvent {
    pub(crate) event_type: &'static str,
    pub(crate) payload: String,
}

fn build_event<T: Serialize>(event_type: &'static str, payload: T) -> GatewayEvent {
    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        t: EventType::try_from(event_type.to_owned()).unwrap_or_else(|_| {
            EventType::try_from(String::from(MESSAGE_ERROR_EVENT)).expect("valid event type")
        }),
        d: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
    };

    GatewayEvent {
        event_type,
        payload: serde_json::to_string(&envelope)
            .unwrap_or_else(|_| String::from(r#"{"v":1,"t":"message:error","d":null}"#)),
    }
}

pub(crate) fn message_new(room: Room, message: &MessageBroadcastPayload) -> GatewayEvent {
    let event_type = match room {
        Room::Global => MESSAGE_NEW_EVENT,
        Room::Members => PRIVATE_MESSAGE_NEW_EVENT,
    };
    build_event(event_type, message)
}

pub(crate) fn message_system(room: Room, message: &MessageBroadcastPayload) -> GatewayEvent {
    let event_type = match room {
        Room::Global => MESSAGE_SYSTEM_EVENT,
        Room::Members => PRIVATE_MESSAGE_SYSTEM_EVENT,
    };
    build_event(event_type, message)
}

pub(crate) fn message_ack(client_message_id: Option<&str>, success: bool) -> GatewayEvent {
    build_event(
        MESSAGE_ACK_EVENT,
        MessageAckPayload {
            client_message_id: client_message_id.map(ToOwned::to_owned),
            success,
        },
    )
}

pub(crate) fn message_error(message: &str) -> GatewayEvent {
    build_event(
        MESSAGE_ERROR_EVENT,
        MessageErrorPayload {
            message: message.to_owned(),
            errors: None,
        },
    )
}

pub(crate) fn typing_start(room: Room, user_id: &str, name: &str) -> GatewayEvent {
    let event_type = match room {
        Room::Global => TYPING_START_EVENT,
        Room::Members => PRIVATE_TYPING_START_EVENT,
    };
    build_event(
        event_type,
        TypingEventPayload {
            user_id: user_id.to_owned(),
            name: name.to_owned(),
        },
    )
}

pub(crate) fn typing_stop(room: Room, user_id: &str, name: &str) -> GatewayEvent {
    let event_type = match room {
        Room::Global => TYPING_STOP_EVENT,
        Room::Members => PRIVATE_TYPING_STOP_EVENT,
    };
    build_event(
        event_type,
        TypingEventPayload {
            user_id: user_id.to_owned(),
            name: name.to_owned(),
        },
    )
}

pub(crate) fn user_online(room: Room, user_id: &str, name: &str) -> GatewayEvent {
    let event_type = match room {
        Room::Global => USER_ONLINE_EVENT,
        Room::Members => PRIVATE_USER_ONLINE_EVENT,
    };
    build_event(
        event_type,
        PresenceDeltaPayload {
            user_id: user_id.to_owned(),
            name: name.to_owned(),
        },
    )
}

pub(crate) fn user_offline(room: Room, user_id: &str, name: &str) -> GatewayEvent {
    let event_type = match room {
        Room::Global => USER_OFFLINE_EVENT,
        Room::Members => PRIVATE_USER_OFFLINE_EVENT,
    };
    build_event(
        event_type,
        PresenceDeltaPayload {
            user_id: user_id.to_owned(),
            name: name.to_owned(),
        },
    )
}

pub(crate) fn presence_sync(room: Room, entries: Vec<PresenceEntryPayload>) -> GatewayEvent {
    let event_type = match room {
        Room::Global => PRESENCE_SYNC_EVENT,
        Room::Members => PRIVATE_PRESENCE_SYNC_EVENT,
    };
    build_event(event_type, entries)
}
