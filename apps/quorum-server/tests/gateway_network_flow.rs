use std::{net::SocketAddr, time::Duration};

use axum::{body::Body, http::Request, http::StatusCode};
use futures_util::{SinkExt, StreamExt};
use quorum_server::{build_router, AppConfig};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn test_config() -> AppConfig {
    AppConfig {
        rate_limit_requests_per_minute: 10_000,
        ..AppConfig::default()
    }
}

async fn start_server(config: &AppConfig) -> (axum::Router, SocketAddr) {
    let app = build_router(config).expect("router should build");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener has an address");
    let serve_app = app.clone();
    tokio::spawn(async move {
        axum::serve(
            listener,
            serve_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("server should run");
    });
    (app, addr)
}

async fn parse_json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    serde_json::from_slice(&body).expect("response body should be valid json")
}

async fn mint_session(app: &axum::Router, name: &str, privileged: bool) -> (String, String) {
    let request = Request::builder()
        .method("POST")
        .uri("/auth/session")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.10")
        .body(Body::from(
            json!({"display_name": name, "is_privileged": privileged}).to_string(),
        ))
        .expect("session request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("session request should execute");
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_json_body(response).await;
    (
        body["session_token"]
            .as_str()
            .expect("session token should exist")
            .to_owned(),
        body["user_id"]
            .as_str()
            .expect("user id should exist")
            .to_owned(),
    )
}

async fn connect_gateway(addr: SocketAddr, token: &str) -> WsClient {
    let (socket, _response) =
        connect_async(format!("ws://{addr}/gateway/ws?session_token={token}"))
            .await
            .expect("gateway connection should upgrade");
    socket
}

async fn next_event(socket: &mut WsClient) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("event should arrive before timeout")
            .expect("socket should stay open")
            .expect("socket read should succeed");
        match message {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("event should be json")
            }
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn next_event_of_type(socket: &mut WsClient, event_type: &str) -> Value {
    loop {
        let event = next_event(socket).await;
        if event["t"] == event_type {
            return event;
        }
    }
}

async fn send_message(socket: &mut WsClient, content: &str, client_message_id: &str) {
    let envelope = json!({
        "v": 1,
        "t": "message:send",
        "d": {"content": content, "client_message_id": client_message_id}
    });
    socket
        .send(Message::Text(envelope.to_string().into()))
        .await
        .expect("send should reach the gateway");
}

#[tokio::test]
async fn handshake_without_credentials_is_refused() {
    let (_app, addr) = start_server(&test_config()).await;
    let result = connect_async(format!("ws://{addr}/gateway/ws")).await;
    assert!(result.is_err(), "upgrade should be rejected outright");
}

#[tokio::test]
async fn connect_receives_presence_snapshot_including_earlier_users() {
    let (app, addr) = start_server(&test_config()).await;
    let (token_a, user_a) = mint_session(&app, "Alice", false).await;
    let (token_b, _user_b) = mint_session(&app, "Bob", false).await;

    let mut alice = connect_gateway(addr, &token_a).await;
    let first_sync = next_event_of_type(&mut alice, "presence:sync").await;
    assert_eq!(first_sync["d"].as_array().map(Vec::len), Some(1));

    let mut bob = connect_gateway(addr, &token_b).await;
    let sync = next_event_of_type(&mut bob, "presence:sync").await;
    let entries = sync["d"].as_array().expect("snapshot is a list");
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .any(|entry| entry["user_id"] == Value::from(user_a.as_str())));
}

#[tokio::test]
async fn rapid_sends_broadcast_to_other_members_in_order() {
    let (app, addr) = start_server(&test_config()).await;
    let (token_a, user_a) = mint_session(&app, "Alice", false).await;
    let (token_b, _) = mint_session(&app, "Bob", false).await;

    let mut alice = connect_gateway(addr, &token_a).await;
    next_event_of_type(&mut alice, "presence:sync").await;
    let mut bob = connect_gateway(addr, &token_b).await;
    next_event_of_type(&mut bob, "presence:sync").await;

    send_message(&mut alice, "m1", "t1").await;
    send_message(&mut alice, "m2", "t2").await;
    send_message(&mut alice, "m3", "t3").await;

    let mut observed = Vec::new();
    while observed.len() < 3 {
        let event = next_event_of_type(&mut bob, "message:new").await;
        observed.push(event["d"]["message"].as_str().unwrap().to_owned());
        assert_eq!(event["d"]["user_id"], Value::from(user_a.as_str()));
        assert_eq!(event["d"]["kind"], Value::from("user"));
    }
    assert_eq!(observed, vec!["m1", "m2", "m3"]);

    // The persisted log matches what was observed, newest first, with
    // non-decreasing timestamps in send order.
    let history = Request::builder()
        .method("GET")
        .uri("/history")
        .header("authorization", format!("Bearer {token_b}"))
        .header("x-forwarded-for", "203.0.113.11")
        .body(Body::empty())
        .expect("history request should build");
    let response = app
        .clone()
        .oneshot(history)
        .await
        .expect("history request should execute");
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_json_body(response).await;
    let items = body["items"].as_array().expect("items should be a list");
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["message"], Value::from("m3"));
    assert_eq!(items[2]["message"], Value::from("m1"));
    let oldest_first: Vec<i64> = items
        .iter()
        .rev()
        .map(|item| item["created_at_unix"].as_i64().unwrap())
        .collect();
    assert!(oldest_first.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn sender_echo_reconciles_with_the_client_cache() {
    let (app, addr) = start_server(&test_config()).await;
    let (token, user_id) = mint_session(&app, "Alice", false).await;
    let mut alice = connect_gateway(addr, &token).await;
    next_event_of_type(&mut alice, "presence:sync").await;

    let mut cache = quorum_client::MessageCache::new();
    cache
        .push_pending(quorum_client::PendingSend {
            temp_id: String::from("temp-A-1000"),
            author_id: user_id.clone(),
            content: String::from("hello"),
            sent_at_unix: 0,
        })
        .expect("pending insert should succeed");
    send_message(&mut alice, "hello", "temp-A-1000").await;

    // The echoed broadcast (through the bus relay) and the direct ack can
    // arrive in either order; gather both.
    let mut broadcast = None;
    let mut ack = None;
    while broadcast.is_none() || ack.is_none() {
        let event = next_event(&mut alice).await;
        if event["t"] == "message:new" {
            broadcast = Some(event["d"].clone());
        } else if event["t"] == "message:ack" {
            ack = Some(event["d"].clone());
        }
    }
    let broadcast = broadcast.expect("broadcast should arrive");
    assert_eq!(broadcast["client_message_id"], Value::from("temp-A-1000"));
    assert_eq!(ack.expect("ack should arrive")["success"], Value::from(true));

    let payload: quorum_protocol::MessageBroadcastPayload =
        serde_json::from_value(broadcast).expect("payload should deserialize");
    let confirmed_id = payload.id.clone();
    cache.apply_broadcast(payload);

    // Exactly one entry for the logical message: the confirmed one.
    assert_eq!(cache.len(), 1);
    assert!(cache.contains(&confirmed_id));
    assert!(!cache.contains("temp-A-1000"));
}

#[tokio::test]
async fn sixth_send_in_window_is_rejected_and_rolled_back_client_side() {
    let (app, addr) = start_server(&test_config()).await;
    let (token, _) = mint_session(&app, "Chatty", false).await;
    let mut socket = connect_gateway(addr, &token).await;
    next_event_of_type(&mut socket, "presence:sync").await;

    for index in 1..=6 {
        send_message(&mut socket, &format!("m{index}"), &format!("t{index}")).await;
    }

    let mut acks = Vec::new();
    let mut error_text = None;
    while acks.len() < 6 {
        let event = next_event(&mut socket).await;
        if event["t"] == "message:ack" {
            acks.push(event["d"]["success"].as_bool().unwrap());
        } else if event["t"] == "message:error" {
            error_text = event["d"]["message"].as_str().map(ToOwned::to_owned);
        }
    }
    assert_eq!(acks, vec![true, true, true, true, true, false]);
    assert_eq!(error_text.as_deref(), Some("Rate limit exceeded. Slow down."));

    // Only the five accepted sends were persisted.
    let history = Request::builder()
        .method("GET")
        .uri("/history")
        .header("authorization", format!("Bearer {token}"))
        .header("x-forwarded-for", "203.0.113.12")
        .body(Body::empty())
        .expect("history request should build");
    let response = app.clone().oneshot(history).await.unwrap();
    let body = parse_json_body(response).await;
    assert_eq!(body["items"].as_array().map(Vec::len), Some(5));
}

#[tokio::test]
async fn disconnect_broadcasts_offline_to_remaining_members() {
    let (app, addr) = start_server(&test_config()).await;
    let (token_a, user_a) = mint_session(&app, "Alice", false).await;
    let (token_b, _) = mint_session(&app, "Bob", false).await;

    let mut alice = connect_gateway(addr, &token_a).await;
    next_event_of_type(&mut alice, "presence:sync").await;
    let mut bob = connect_gateway(addr, &token_b).await;
    next_event_of_type(&mut bob, "presence:sync").await;

    alice
        .close(None)
        .await
        .expect("close handshake should start");
    drop(alice);

    let offline = next_event_of_type(&mut bob, "user:offline").await;
    assert_eq!(offline["d"]["user_id"], Value::from(user_a.as_str()));
}

#[tokio::test]
async fn members_room_events_reach_privileged_connections_only() {
    let (app, addr) = start_server(&test_config()).await;
    let (member_token, member_id) = mint_session(&app, "Mentor", true).await;
    let (guest_token, _) = mint_session(&app, "Guest", false).await;

    let mut member = connect_gateway(addr, &member_token).await;
    next_event_of_type(&mut member, "private:presence:sync").await;
    let mut guest = connect_gateway(addr, &guest_token).await;
    next_event_of_type(&mut guest, "presence:sync").await;

    // A guest cannot post into the members room.
    let envelope = json!({
        "v": 1,
        "t": "message:send",
        "d": {"room": "members", "content": "sneak", "client_message_id": "g1"}
    });
    guest
        .send(Message::Text(envelope.to_string().into()))
        .await
        .unwrap();
    let error = next_event_of_type(&mut guest, "message:error").await;
    assert_eq!(error["d"]["message"], Value::from("Invalid message"));
    let ack = next_event_of_type(&mut guest, "message:ack").await;
    assert_eq!(ack["d"]["success"], Value::from(false));

    // A privileged send lands in the private stream for members.
    let envelope = json!({
        "v": 1,
        "t": "message:send",
        "d": {"room": "members", "content": "members only", "client_message_id": "p1"}
    });
    member
        .send(Message::Text(envelope.to_string().into()))
        .await
        .unwrap();
    let private = next_event_of_type(&mut member, "private:message:new").await;
    assert_eq!(private["d"]["message"], Value::from("members only"));
    assert_eq!(private["d"]["user_id"], Value::from(member_id.as_str()));
}

#[tokio::test]
async fn typing_signals_fan_out_without_persisting() {
    let (app, addr) = start_server(&test_config()).await;
    let (token_a, user_a) = mint_session(&app, "Alice", false).await;
    let (token_b, _) = mint_session(&app, "Bob", false).await;

    let mut alice = connect_gateway(addr, &token_a).await;
    next_event_of_type(&mut alice, "presence:sync").await;
    let mut bob = connect_gateway(addr, &token_b).await;
    next_event_of_type(&mut bob, "presence:sync").await;

    let start = json!({"v": 1, "t": "typing:start", "d": {}});
    alice
        .send(Message::Text(start.to_string().into()))
        .await
        .unwrap();
    let observed = next_event_of_type(&mut bob, "typing:start").await;
    assert_eq!(observed["d"]["user_id"], Value::from(user_a.as_str()));
    assert_eq!(observed["d"]["name"], Value::from("Alice"));

    let stop = json!({"v": 1, "t": "typing:stop", "d": {}});
    alice
        .send(Message::Text(stop.to_string().into()))
        .await
        .unwrap();
    next_event_of_type(&mut bob, "typing:stop").await;

    // Typing traffic never reaches the durable log.
    let history = Request::builder()
        .method("GET")
        .uri("/history")
        .header("authorization", format!("Bearer {token_b}"))
        .header("x-forwarded-for", "203.0.113.13")
        .body(Body::empty())
        .expect("history request should build");
    let response = app.clone().oneshot(history).await.unwrap();
    let body = parse_json_body(response).await;
    assert_eq!(body["items"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn malformed_events_produce_errors_without_closing_the_connection() {
    let (app, addr) = start_server(&test_config()).await;
    let (token, _) = mint_session(&app, "Alice", false).await;
    let mut socket = connect_gateway(addr, &token).await;
    next_event_of_type(&mut socket, "presence:sync").await;

    socket
        .send(Message::Text(String::from("not json").into()))
        .await
        .unwrap();
    next_event_of_type(&mut socket, "message:error").await;

    let unknown = json!({"v": 1, "t": "message:new", "d": {}});
    socket
        .send(Message::Text(unknown.to_string().into()))
        .await
        .unwrap();
    next_event_of_type(&mut socket, "message:error").await;

    // The connection is still serviceable afterwards.
    send_message(&mut socket, "still alive", "t1").await;
    let ack = next_event_of_type(&mut socket, "message:ack").await;
    assert_eq!(ack["d"]["success"], Value::from(true));
}

#[tokio::test]
async fn health_reports_ok_with_uptime() {
    let (app, _addr) = start_server(&test_config()).await;
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header("x-forwarded-for", "203.0.113.14")
        .body(Body::empty())
        .expect("health request should build");
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_json_body(response).await;
    assert_eq!(body["status"], Value::from("ok"));
    assert!(body["uptime_seconds"].as_u64().is_some());
}
