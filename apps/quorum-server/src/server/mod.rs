pub(crate) mod auth;
pub(crate) mod bus;
pub(crate) mod core;
pub(crate) mod errors;
pub(crate) mod gateway_events;
pub(crate) mod handlers;
pub(crate) mod metrics;
pub(crate) mod pipeline;
pub(crate) mod presence;
pub(crate) mod rate_limit;
pub(crate) mod realtime;
pub(crate) mod router;
pub(crate) mod store;
pub(crate) mod types;

pub use self::core::AppConfig;
pub use self::errors::init_tracing;
pub use self::router::build_router;
pub use self::store::verify_store;
