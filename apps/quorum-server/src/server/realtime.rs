use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use quorum_core::Room;
use quorum_protocol::{parse_client_event, parse_envelope, ClientEvent};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use super::{
    auth::{authenticate_with_token, bearer_token, now_unix},
    bus::BusUnavailable,
    core::{AppState, ConnectionControl, Identity, RoomListeners},
    errors::AuthFailure,
    gateway_events::{self, GatewayEvent},
    metrics::{
        record_bus_publish_failure, record_gateway_event_dropped, record_gateway_event_emitted,
        record_gateway_event_parse_rejected, record_rate_limit_hit, record_ws_disconnect,
    },
    pipeline::{broadcast_system_notice, submit_message},
    types::GatewayAuthQuery,
};

pub(crate) async fn gateway_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayAuthQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthFailure> {
    let token = query
        .session_token
        .or_else(|| bearer_token(&headers).map(ToOwned::to_owned))
        .ok_or(AuthFailure::Unauthorized)?;
    let identity = authenticate_with_token(&state, &token).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        handle_gateway_connection(state, socket, identity).await;
    }))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn handle_gateway_connection(
    state: AppState,
    socket: WebSocket,
    identity: Identity,
) {
    let connection_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let slow_consumer_disconnect = Arc::new(AtomicBool::new(false));

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.gateway_outbound_queue);
    let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);
    state
        .connection_controls
        .write()
        .await
        .insert(connection_id, control_tx);

    let joined_rooms = identity.joined_rooms();
    for room in &joined_rooms {
        add_subscription(&state, connection_id, room.topic(), outbound_tx.clone()).await;
    }

    let first_connection = state
        .presence
        .connect(connection_id, &identity, now_unix())
        .await;

    let sync_event =
        gateway_events::presence_sync(Room::Global, state.presence.snapshot(false).await);
    send_connection_event(&outbound_tx, &sync_event);
    if identity.is_privileged {
        let members_sync =
            gateway_events::presence_sync(Room::Members, state.presence.snapshot(true).await);
        send_connection_event(&outbound_tx, &members_sync);
    }

    if first_connection {
        let user_id = identity.user_id.to_string();
        for room in &joined_rooms {
            let online = gateway_events::user_online(*room, &user_id, &identity.display_name);
            publish_room_event(&state, *room, &online).await;
        }
        broadcast_system_notice(
            &state,
            Room::Global,
            &identity,
            &format!("{} joined the chat", identity.display_name),
        )
        .await;
    }

    let slow_consumer_disconnect_send = Arc::clone(&slow_consumer_disconnect);
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                control_change = control_rx.changed() => {
                    if control_change.is_ok() && *control_rx.borrow() == ConnectionControl::Close {
                        slow_consumer_disconnect_send.store(true, Ordering::Relaxed);
                        record_ws_disconnect("slow_consumer");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    // Inbound events are handled one at a time: the next frame is not read
    // until the current handler completes, which serializes per-sender
    // processing and keeps persistence order equal to arrival order.
    let mut ingress = VecDeque::new();
    let mut disconnect_reason = "connection_closed";
    while let Some(incoming) = stream.next().await {
        let Ok(message) = incoming else {
            disconnect_reason = "socket_error";
            break;
        };

        let payload: Vec<u8> = match message {
            Message::Text(text) => {
                if text.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                text.as_bytes().to_vec()
            }
            Message::Binary(bytes) => {
                if bytes.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                bytes.to_vec()
            }
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !allow_gateway_ingress(
            &mut ingress,
            state.runtime.gateway_ingress_events_per_window,
            state.runtime.gateway_ingress_window,
        ) {
            record_rate_limit_hit("gateway", "ingress_flood");
            disconnect_reason = "ingress_rate_limited";
            break;
        }

        let envelope = match parse_envelope(&payload) {
            Ok(envelope) => envelope,
            Err(_) => {
                record_gateway_event_parse_rejected("ingress", "invalid_envelope");
                send_connection_event(&outbound_tx, &gateway_events::message_error("Invalid message"));
                continue;
            }
        };
        let event = match parse_client_event(envelope) {
            Ok(event) => event,
            Err(_) => {
                record_gateway_event_parse_rejected("ingress", "unknown_or_invalid_event");
                send_connection_event(&outbound_tx, &gateway_events::message_error("Invalid message"));
                continue;
            }
        };

        match event {
            ClientEvent::MessageSend(send) => {
                let client_message_id = send.client_message_id.clone();
                let Some(room) = resolve_room(&identity, send.room.as_deref()) else {
                    send_connection_event(
                        &outbound_tx,
                        &gateway_events::message_error("Invalid message"),
                    );
                    send_connection_event(
                        &outbound_tx,
                        &gateway_events::message_ack(client_message_id.as_deref(), false),
                    );
                    continue;
                };

                match submit_message(&state, &identity, room, send.content, client_message_id.clone())
                    .await
                {
                    Ok(_) => {
                        send_connection_event(
                            &outbound_tx,
                            &gateway_events::message_ack(client_message_id.as_deref(), true),
                        );
                    }
                    Err(rejection) => {
                        send_connection_event(
                            &outbound_tx,
                            &gateway_events::message_error(rejection.user_message()),
                        );
                        send_connection_event(
                            &outbound_tx,
                            &gateway_events::message_ack(client_message_id.as_deref(), false),
                        );
                    }
                }
            }
            ClientEvent::TypingStart(signal) => {
                let Some(room) = resolve_room(&identity, signal.room.as_deref()) else {
                    send_connection_event(
                        &outbound_tx,
                        &gateway_events::message_error("Invalid message"),
                    );
                    continue;
                };
                let event = gateway_events::typing_start(
                    room,
                    &identity.user_id.to_string(),
                    &identity.display_name,
                );
                publish_room_event(&state, room, &event).await;
            }
            ClientEvent::TypingStop(signal) => {
                let Some(room) = resolve_room(&identity, signal.room.as_deref()) else {
                    send_connection_event(
                        &outbound_tx,
                        &gateway_events::message_error("Invalid message"),
                    );
                    continue;
                };
                let event = gateway_events::typing_stop(
                    room,
                    &identity.user_id.to_string(),
                    &identity.display_name,
                );
                publish_room_event(&state, room, &event).await;
            }
        }
    }

    if !slow_consumer_disconnect.load(Ordering::Relaxed) {
        record_ws_disconnect(disconnect_reason);
    }
    remove_connection(&state, connection_id).await;
    send_task.abort();
}

/// Resolve the room named on an inbound event, defaulting to the global
/// room. Unknown names and rooms the identity has not joined yield `None`.
fn resolve_room(identity: &Identity, room: Option<&str>) -> Option<Room> {
    let room = match room {
        None => Room::Global,
        Some(name) => Room::try_from(name.to_owned()).ok()?,
    };
    if room.is_privileged() && !identity.is_privileged {
        return None;
    }
    Some(room)
}

/// Publish to the room topic, or fall back to same-process delivery when
/// the bus is down. Cross-process subscribers simply miss the event in
/// that case; nothing is replayed once the bus recovers.
pub(crate) async fn publish_room_event(state: &AppState, room: Room, event: &GatewayEvent) {
    match state.bus.publish(room.topic(), event) {
        Ok(_) => {}
        Err(BusUnavailable) => {
            record_bus_publish_failure(room.topic());
            tracing::warn!(
                event = "bus.publish_failed",
                topic = room.topic(),
                event_type = event.event_type,
                "fan-out degraded to local delivery"
            );
            deliver_room_event(state, room.topic(), event.event_type, &event.payload).await;
        }
    }
}

/// Per-process relay: forwards every bus message to the sockets
/// subscribed to its room. One relay runs for the lifetime of the
/// process; lagged messages are dropped, consistent with the bus's
/// no-replay contract.
pub(crate) fn spawn_bus_relay(state: AppState) -> tokio::task::JoinHandle<()> {
    let mut rx = state.bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    deliver_room_event(&state, message.topic, message.event_type, &message.payload)
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(event = "bus.relay_lagged", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

pub(crate) async fn deliver_room_event(
    state: &AppState,
    topic: &str,
    event_type: &'static str,
    payload: &str,
) {
    let mut slow_connections = Vec::new();
    let mut delivered = 0_usize;
    let mut subscriptions = state.subscriptions.write().await;
    if let Some(listeners) = subscriptions.get_mut(topic) {
        delivered =
            dispatch_gateway_payload(listeners, payload, event_type, "room", &mut slow_connections);
        if listeners.is_empty() {
            subscriptions.remove(topic);
        }
    }
    drop(subscriptions);

    close_slow_connections(state, slow_connections).await;
    if delivered > 0 {
        tracing::debug!(
            event = "gateway.event.emit",
            scope = "room",
            topic,
            event_type,
            delivered
        );
        for _ in 0..delivered {
            record_gateway_event_emitted("room", event_type);
        }
    }
}

fn dispatch_gateway_payload(
    listeners: &mut RoomListeners,
    payload: &str,
    event_type: &'static str,
    scope: &'static str,
    slow_connections: &mut Vec<Uuid>,
) -> usize {
    let mut delivered = 0_usize;
    listeners.retain(
        |connection_id, sender| match sender.try_send(payload.to_owned()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped(scope, event_type, "closed");
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped(scope, event_type, "full_queue");
                slow_connections.push(*connection_id);
                false
            }
        },
    );
    delivered
}

async fn close_slow_connections(state: &AppState, slow_connections: Vec<Uuid>) {
    if slow_connections.is_empty() {
        return;
    }

    let controls = state.connection_controls.read().await;
    for connection_id in slow_connections {
        if let Some(control) = controls.get(&connection_id) {
            let _ = control.send(ConnectionControl::Close);
        }
    }
}

fn send_connection_event(outbound_tx: &mpsc::Sender<String>, event: &GatewayEvent) {
    match outbound_tx.try_send(event.payload.clone()) {
        Ok(()) => record_gateway_event_emitted("connection", event.event_type),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            record_gateway_event_dropped("connection", event.event_type, "closed");
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            record_gateway_event_dropped("connection", event.event_type, "full_queue");
        }
    }
}

pub(crate) async fn add_subscription(
    state: &AppState,
    connection_id: Uuid,
    topic: &'static str,
    outbound_tx: mpsc::Sender<String>,
) {
    let mut subscriptions = state.subscriptions.write().await;
    subscriptions
        .entry(topic)
        .or_default()
        .insert(connection_id, outbound_tx);
}

pub(crate) async fn remove_connection(state: &AppState, connection_id: Uuid) {
    state
        .connection_controls
        .write()
        .await
        .remove(&connection_id);

    let mut subscriptions = state.subscriptions.write().await;
    subscriptions.retain(|_, listeners| {
        listeners.remove(&connection_id);
        !listeners.is_empty()
    });
    drop(subscriptions);

    let Some((removed, was_last)) = state.presence.disconnect(connection_id).await else {
        return;
    };
    if !was_last {
        return;
    }

    let identity = Identity {
        user_id: removed.user_id,
        display_name: removed.display_name,
        is_privileged: removed.is_privileged,
    };
    let user_id = identity.user_id.to_string();
    for room in identity.joined_rooms() {
        let offline = gateway_events::user_offline(room, &user_id, &identity.display_name);
        publish_room_event(state, room, &offline).await;
    }
}

/// Connection-level flood guard over a sliding window. Distinct from the
/// per-user message rate limit: this caps raw inbound frames so one
/// socket cannot monopolize the gateway loop.
pub(crate) fn allow_gateway_ingress(
    ingress: &mut VecDeque<Instant>,
    limit: u32,
    window: Duration,
) -> bool {
    let now = Instant::now();
    while ingress
        .front()
        .is_some_and(|oldest| now.duration_since(*oldest) > window)
    {
        let _ = ingress.pop_front();
    }

    if ingress.len() >= limit as usize {
        return false;
    }

    ingress.push_back(now);
    true
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use quorum_core::{Room, UserId};

    use super::{allow_gateway_ingress, resolve_room};
    use crate::server::core::Identity;

    fn guest() -> Identity {
        Identity {
            user_id: UserId::new(),
            display_name: String::from("Guest"),
            is_privileged: false,
        }
    }

    fn member() -> Identity {
        Identity {
            user_id: UserId::new(),
            display_name: String::from("Member"),
            is_privileged: true,
        }
    }

    #[test]
    fn ingress_guard_allows_up_to_limit_within_window() {
        let mut ingress = VecDeque::new();
        let window = Duration::from_secs(10);
        for _ in 0..3 {
            assert!(allow_gateway_ingress(&mut ingress, 3, window));
        }
        assert!(!allow_gateway_ingress(&mut ingress, 3, window));
    }

    #[test]
    fn room_resolution_defaults_to_global() {
        assert_eq!(resolve_room(&guest(), None), Some(Room::Global));
        assert_eq!(resolve_room(&guest(), Some("global")), Some(Room::Global));
    }

    #[test]
    fn members_room_requires_privilege() {
        assert_eq!(resolve_room(&guest(), Some("members")), None);
        assert_eq!(resolve_room(&member(), Some("members")), Some(Room::Members));
    }

    #[test]
    fn unknown_rooms_are_rejected() {
        assert_eq!(resolve_room(&member(), Some("lobby")), None);
    }
}
