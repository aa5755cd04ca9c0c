use std::{
    collections::HashMap,
    sync::{atomic::AtomicI64, Arc},
    time::{Duration, Instant},
};

use anyhow::anyhow;
use quorum_core::{Room, UserId};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

use super::{
    bus::FanoutBus, presence::PresenceRegistry, rate_limit::RateBucket, store::MessageStore,
};

pub(crate) type RoomListeners = HashMap<Uuid, mpsc::Sender<String>>;
pub(crate) type RoomSubscriptions = HashMap<&'static str, RoomListeners>;

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 60;
pub const DEFAULT_MESSAGE_RATE_LIMIT: u32 = 5;
pub const DEFAULT_MESSAGE_RATE_WINDOW_SECS: u64 = 10;
pub const DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW: u32 = 60;
pub const DEFAULT_GATEWAY_INGRESS_WINDOW_SECS: u64 = 10;
pub const DEFAULT_GATEWAY_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_GATEWAY_EVENT_BYTES: usize = quorum_protocol::MAX_EVENT_BYTES;
pub const DEFAULT_BUS_CAPACITY: usize = 1024;
pub const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 60 * 60;
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub(crate) const MAX_HISTORY_LIMIT: usize = 100;
pub(crate) const RATE_LIMIT_SWEEP_INTERVAL_SECS: i64 = 60;
pub(crate) const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub message_rate_limit: u32,
    pub message_rate_window: Duration,
    pub gateway_ingress_events_per_window: u32,
    pub gateway_ingress_window: Duration,
    pub gateway_outbound_queue: usize,
    pub max_gateway_event_bytes: usize,
    pub bus_capacity: usize,
    pub session_ttl: Duration,
    pub session_issuer_key: Option<String>,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            message_rate_limit: DEFAULT_MESSAGE_RATE_LIMIT,
            message_rate_window: Duration::from_secs(DEFAULT_MESSAGE_RATE_WINDOW_SECS),
            gateway_ingress_events_per_window: DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW,
            gateway_ingress_window: Duration::from_secs(DEFAULT_GATEWAY_INGRESS_WINDOW_SECS),
            gateway_outbound_queue: DEFAULT_GATEWAY_OUTBOUND_QUEUE,
            max_gateway_event_bytes: DEFAULT_MAX_GATEWAY_EVENT_BYTES,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            session_ttl: Duration::from_secs(u64::try_from(DEFAULT_SESSION_TTL_SECS).unwrap_or(0)),
            session_issuer_key: None,
            database_url: None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) message_rate_limit: u32,
    pub(crate) message_rate_window_secs: i64,
    pub(crate) gateway_ingress_events_per_window: u32,
    pub(crate) gateway_ingress_window: Duration,
    pub(crate) gateway_outbound_queue: usize,
    pub(crate) max_gateway_event_bytes: usize,
    pub(crate) session_ttl_secs: i64,
    pub(crate) session_issuer_key: Option<String>,
}

/// Authenticated identity resolved from a session token. The gateway and
/// handlers only ever validate credentials; issuing them belongs to the
/// external identity collaborator (stubbed by `POST /auth/session`).
#[derive(Debug, Clone)]
pub(crate) struct Identity {
    pub(crate) user_id: UserId,
    pub(crate) display_name: String,
    pub(crate) is_privileged: bool,
}

impl Identity {
    /// Rooms this identity joins on connect.
    pub(crate) fn joined_rooms(&self) -> Vec<Room> {
        if self.is_privileged {
            vec![Room::Global, Room::Members]
        } else {
            vec![Room::Global]
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SessionRecord {
    pub(crate) user_id: UserId,
    pub(crate) display_name: String,
    pub(crate) is_privileged: bool,
    pub(crate) token_hash: [u8; 32],
    pub(crate) expires_at_unix: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionControl {
    Open,
    Close,
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) db_pool: Option<PgPool>,
    pub(crate) started_at: Instant,
    pub(crate) store: MessageStore,
    pub(crate) bus: FanoutBus,
    pub(crate) presence: PresenceRegistry,
    pub(crate) sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    pub(crate) subscriptions: Arc<RwLock<RoomSubscriptions>>,
    pub(crate) connection_controls: Arc<RwLock<HashMap<Uuid, watch::Sender<ConnectionControl>>>>,
    pub(crate) rate_buckets: Arc<RwLock<HashMap<String, RateBucket>>>,
    pub(crate) rate_limit_last_sweep_unix: Arc<AtomicI64>,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let db_pool = if let Some(database_url) = &config.database_url {
            Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            None
        };

        let session_ttl_secs = i64::try_from(config.session_ttl.as_secs())
            .map_err(|_| anyhow!("session ttl out of range"))?;
        let message_rate_window_secs = i64::try_from(config.message_rate_window.as_secs())
            .map_err(|_| anyhow!("message rate window out of range"))?;

        Ok(Self {
            db_pool: db_pool.clone(),
            started_at: Instant::now(),
            store: MessageStore::new(db_pool),
            bus: FanoutBus::new(config.bus_capacity),
            presence: PresenceRegistry::new(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connection_controls: Arc::new(RwLock::new(HashMap::new())),
            rate_buckets: Arc::new(RwLock::new(HashMap::new())),
            rate_limit_last_sweep_unix: Arc::new(AtomicI64::new(0)),
            runtime: Arc::new(RuntimeConfig {
                message_rate_limit: config.message_rate_limit,
                message_rate_window_secs,
                gateway_ingress_events_per_window: config.gateway_ingress_events_per_window,
                gateway_ingress_window: config.gateway_ingress_window,
                gateway_outbound_queue: config.gateway_outbound_queue,
                max_gateway_event_bytes: config.max_gateway_event_bytes,
                session_ttl_secs,
                session_issuer_key: config.session_issuer_key.clone(),
            }),
        })
    }

    #[must_use]
    pub(crate) fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
