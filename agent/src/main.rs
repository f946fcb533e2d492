//! FrameLink agent: runs a capture engine against the configured inference
//! service and exposes its status and controls over HTTP.

mod api;
mod config;
mod synthetic;
mod ws;

use api::AppState;
use axum::http::{HeaderValue, Method, header};
use config::AgentConfig;
use framelink_core::encoder::JpegFrameEncoder;
use framelink_core::{EngineCommand, LiveEngine};
use synthetic::SyntheticCapability;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ws::WsTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "framelink_core=info,framelink_agent=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::from_env();
    tracing::info!(
        endpoint = %config.client.endpoint,
        target_fps = config.client.policy.target_rate_hz,
        backpressure = ?config.client.backpressure,
        drop_stale_results = config.client.drop_stale_results,
        synthetic_cameras = config.synthetic_cameras,
        "configuration loaded"
    );

    let mut engine = LiveEngine::new(
        SyntheticCapability::new(config.synthetic_cameras),
        JpegFrameEncoder,
        config.client.clone(),
    )?;
    let (commands, command_rx) = mpsc::channel(32);

    // Restrict CORS to the configured web origin.
    let cors = CorsLayer::new()
        .allow_origin(config.web_origin.parse::<HeaderValue>()?)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);
    let app = api::router(AppState {
        status: engine.subscribe(),
        commands: commands.clone(),
    })
    .layer(cors);

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "http server stopped");
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = commands.send(EngineCommand::Shutdown).await;
        }
    });

    engine.start(WsTransport::new()).await;
    engine.run(command_rx).await;
    tracing::info!("engine stopped, exiting");
    Ok(())
}
