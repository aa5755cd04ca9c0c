#![forbid(unsafe_code)]

use std::net::SocketAddr;

use quorum_server::{build_router, init_tracing, verify_store, AppConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let message_rate_limit = std::env::var("QUORUM_MESSAGE_RATE_LIMIT").map_or_else(
        |_| Ok(AppConfig::default().message_rate_limit),
        |value| {
            value.parse::<u32>().map_err(|e| {
                anyhow::anyhow!("invalid QUORUM_MESSAGE_RATE_LIMIT value {value:?}: {e}")
            })
        },
    )?;
    let config = AppConfig {
        database_url: std::env::var("QUORUM_DATABASE_URL").ok(),
        session_issuer_key: std::env::var("QUORUM_SESSION_ISSUER_KEY").ok(),
        message_rate_limit,
        ..AppConfig::default()
    };

    // Store connectivity is the one fatal startup condition.
    verify_store(&config).await?;

    let app = build_router(&config)?;
    let addr = std::env::var("QUORUM_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:4000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid QUORUM_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "quorum-server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
