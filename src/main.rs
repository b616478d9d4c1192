use std::env;
use std::sync::Arc;

use sparrow_tracking::{
    ClientConfig, ClientSession, SparrowError, SparrowResult,
    models::delivery::DeliveryPhase,
    services::events::{ChannelEvent, EventKind},
    services::location_tracking::UnavailableSensor,
    utils::geo,
};
use tracing_subscriber::EnvFilter;

fn required_id(key: &str) -> SparrowResult<i64> {
    let raw = env::var(key)
        .map_err(|_| SparrowError::InvalidConfiguration(format!("{} is not set", key)))?;
    raw.trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| SparrowError::invalid_field(key, raw.trim(), e.to_string()))
}

#[tokio::main]
async fn main() -> SparrowResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::from_env()?;
    let user_id = required_id("SPARROW_USER_ID")?;
    let auth_token = env::var("SPARROW_AUTH_TOKEN").unwrap_or_default();

    let session = ClientSession::connect_to_services(
        config,
        user_id,
        auth_token,
        Arc::new(UnavailableSensor),
    )?;

    let _connected = session.events.subscribe(EventKind::Connected, |event| {
        if let ChannelEvent::Connected { user_id } = event {
            tracing::info!("Live updates enabled for user {}", user_id);
        }
    });
    let _failed = session.events.subscribe(EventKind::ReconnectFailed, |event| {
        if let ChannelEvent::ReconnectFailed { attempts } = event {
            tracing::error!("Giving up on the push channel after {} attempts", attempts);
        }
    });

    let mut alerts = session.router.alerts();
    tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            let action = alert
                .action
                .map(|a| format!(" [{} -> {}]", a.label, a.target.path()))
                .unwrap_or_default();
            tracing::info!("[{:?}] {}: {}{}", alert.level, alert.title, alert.description, action);
        }
    });

    if let Err(e) = session.start().await {
        tracing::warn!("Starting without a push channel: {}", e);
    }
    tracing::info!(
        "{} notifications loaded, {} unread",
        session.store.len(),
        session.store.unread_count()
    );

    let _poller = match env::var("SPARROW_TRACK_DELIVERY") {
        Ok(_) => {
            let delivery_id = required_id("SPARROW_TRACK_DELIVERY")?;
            Some(session.track_delivery(delivery_id, DeliveryPhase::Unknown, None, |update| {
                let distance = update
                    .distance
                    .map(|d| geo::format_distance(d.kilometers))
                    .unwrap_or_else(|| "-".to_string());
                let eta = update
                    .eta
                    .map(|e| geo::format_eta(e.minutes))
                    .unwrap_or_else(|| "-".to_string());
                tracing::info!(
                    "Delivery {} ({:?}): courier {:.5}, {:.5}, {} away, ETA {}",
                    update.delivery_id,
                    update.phase,
                    update.agent.latitude,
                    update.agent.longitude,
                    distance,
                    eta
                );
            })?)
        }
        Err(_) => None,
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    session.shutdown().await;
    Ok(())
}
