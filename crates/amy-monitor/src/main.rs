//! AMY data-flow monitor — collector and WebSocket broadcaster for the
//! processing event stream.

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use amy_monitor::config::MonitorConfig;
use amy_monitor::routes::build_router;
use amy_monitor::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "amy-monitor starting");

    let config = MonitorConfig::from_env();
    let state = AppState::new(config.ring_buffer_size, config.replay_count);
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
