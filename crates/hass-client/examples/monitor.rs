//! Live event monitor.
//!
//! Connects to a Home Assistant instance and prints every event the server
//! fires until interrupted:
//!
//! ```sh
//! HASS_URL=http://homeassistant.local:8123 HASS_TOKEN=... \
//!     cargo run --example monitor
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use hass_client::{ClientConfig, ConnectionParameters, HassClient, Topic};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let url = std::env::var("HASS_URL").context("HASS_URL is not set")?;
    let token = std::env::var("HASS_TOKEN").context("HASS_TOKEN is not set")?;
    let params = ConnectionParameters::from_base_url(&url, token)?;

    let client = HassClient::new(ClientConfig {
        retry_interval: Duration::from_secs(3),
        ..ClientConfig::default()
    });

    // Log connection state transitions in the background.
    let mut states = client.subscribe_state_changes();
    drop(tokio::spawn(async move {
        while let Ok(state) = states.recv().await {
            tracing::info!(?state, "connection state");
        }
    }));

    client
        .connect(params)
        .await
        .context("initial connect failed")?;
    tracing::info!(version = ?client.ha_version(), "connected");

    let cancel = CancellationToken::new();
    let _all = client
        .add_event_listener(
            Topic::Any,
            |event| tracing::info!(event_type = %event.event_type, data = %event.data, "event"),
            &cancel,
        )
        .await?;
    let _state_changes = client
        .add_event_listener(
            Topic::Event("state_changed".into()),
            |event| {
                let entity = event.data["entity_id"].as_str().unwrap_or("<unknown>");
                tracing::info!(entity, "state changed");
            },
            &cancel,
        )
        .await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down...");
    client.close().await?;
    Ok(())
}
