use anyhow::Context;
use meshcall_client::config::{AppConfig, config_dir};
use meshcall_client::error::LogErrExt;
use meshcall_client::room::{Room, RoomEvent, RoomOptions};
use meshcall_media::synthetic::SyntheticBackend;
use meshcall_signaling::transport::tokio::TokioTransport;
use meshcall_webrtc::WebrtcEngine;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}=debug,meshcall_signaling=debug,meshcall_webrtc=debug,meshcall_media=info",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::parse(&config_dir()).context("Failed to load config")?;
    let room_id = std::env::args()
        .nth(1)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let url = config.signaling.resolve_url();
    tracing::info!(?room_id, ?url, "Joining room");

    let room = Room::join(
        TokioTransport::new(&url),
        Arc::new(WebrtcEngine::new()),
        Arc::new(SyntheticBackend::new()),
        RoomOptions::from_config(&room_id, &config),
    )
    .await
    .log_err()?;
    let mut events = room.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received interrupt, leaving room");
                break;
            }
            event = events.recv() => match event {
                Ok(RoomEvent::SignalingDisconnected) => {
                    tracing::error!("Lost connection to signaling server");
                    break;
                }
                Ok(event) => tracing::info!(?event, "Room event"),
                Err(RecvError::Lagged(n)) => tracing::warn!(?n, "Room events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    room.leave().await;
    Ok(())
}
