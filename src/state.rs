// src/state.rs
use std::sync::Arc;

use tracing;

use crate::{
    config::ClientConfig,
    errors::{SparrowError as AppError, SparrowResult},
    models::delivery::{Coordinate, DeliveryPhase, TrackingUpdate},
    services::backend::{DeliveryApi, HttpBackend, NotificationApi},
    services::channel::{ChannelConnectionManager, PushTransport, ReconnectPolicy},
    services::delivery_poller::{DeliveryPositionPoller, PollSettings},
    services::events::EventBus,
    services::location_tracking::{LocationTrackingSession, PositionSensor},
    services::notification_store::NotificationStore,
    services::router::NotificationEventRouter,
    services::stomp::StompTransport,
};

/// External systems a session talks to.
pub struct Collaborators {
    pub transport: Arc<dyn PushTransport>,
    pub notifications: Arc<dyn NotificationApi>,
    pub deliveries: Arc<dyn DeliveryApi>,
    pub sensor: Arc<dyn PositionSensor>,
}

/// Everything bound to one authenticated user, built once at login and torn
/// down with [`ClientSession::shutdown`].
pub struct ClientSession {
    pub config: ClientConfig,
    pub events: EventBus,
    pub store: Arc<NotificationStore>,
    pub router: Arc<NotificationEventRouter>,
    pub channel: ChannelConnectionManager,
    pub tracker: LocationTrackingSession,
    deliveries: Arc<dyn DeliveryApi>,
    user_id: i64,
    auth_token: String,
}

impl ClientSession {
    pub fn new(config: ClientConfig, user_id: i64, auth_token: impl Into<String>, collaborators: Collaborators) -> Self {
        let events = EventBus::new();
        let store = Arc::new(NotificationStore::new(
            collaborators.notifications,
            config.store_capacity,
        ));
        let router = Arc::new(NotificationEventRouter::new(store.clone(), events.clone()));
        let channel = ChannelConnectionManager::new(
            collaborators.transport,
            ReconnectPolicy::from(&config),
            events.clone(),
        );
        router.attach(&channel);

        let tracker = LocationTrackingSession::new(
            collaborators.sensor,
            collaborators.deliveries.clone(),
            config.location_timeout,
        );

        Self {
            config,
            events,
            store,
            router,
            channel,
            tracker,
            deliveries: collaborators.deliveries,
            user_id,
            auth_token: auth_token.into(),
        }
    }

    /// Session against the real services: STOMP push channel plus REST backend.
    pub fn connect_to_services(
        config: ClientConfig,
        user_id: i64,
        auth_token: impl Into<String>,
        sensor: Arc<dyn PositionSensor>,
    ) -> SparrowResult<Self> {
        config.validate()?;
        let auth_token = auth_token.into();
        let backend = Arc::new(HttpBackend::new(&config, user_id, auth_token.clone())?);
        let collaborators = Collaborators {
            transport: Arc::new(StompTransport::new(config.push_url.clone())),
            notifications: backend.clone(),
            deliveries: backend,
            sensor,
        };
        Ok(Self::new(config, user_id, auth_token, collaborators))
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Open the push channel and load the first page of history side by side.
    /// A failed history load is logged; the connect result is returned.
    pub async fn start(&self) -> SparrowResult<()> {
        let user_id = self.user_id.to_string();
        let (connected, refreshed) = tokio::join!(
            self.channel.connect(&user_id, &self.auth_token),
            self.refresh(0)
        );

        match refreshed {
            Ok(added) => tracing::info!("Loaded {} notifications for user {}", added, self.user_id),
            Err(e) => tracing::warn!("Failed to load notifications for user {}: {}", self.user_id, e),
        }
        if let Err(e) = &connected {
            tracing::warn!("Push channel not connected yet: {}", e);
        }
        connected
    }

    pub async fn refresh(&self, page: u32) -> SparrowResult<usize> {
        self.store.refresh(self.user_id, page, self.config.page_size).await
    }

    pub async fn mark_all_read(&self) -> SparrowResult<()> {
        self.store.mark_all_read(self.user_id).await
    }

    pub async fn backend_unread_count(&self) -> SparrowResult<u64> {
        self.store.backend_unread_count(self.user_id).await
    }

    /// Start polling a delivery's courier position.
    pub fn track_delivery<F>(
        &self,
        delivery_id: i64,
        phase: DeliveryPhase,
        destination: Option<Coordinate>,
        on_update: F,
    ) -> SparrowResult<DeliveryPositionPoller>
    where
        F: Fn(&TrackingUpdate) + Send + Sync + 'static,
    {
        if delivery_id <= 0 {
            return Err(AppError::invalid_field("delivery_id", delivery_id, "must be positive"));
        }
        Ok(DeliveryPositionPoller::start(
            self.deliveries.clone(),
            delivery_id,
            phase,
            destination,
            PollSettings {
                interval: self.config.poll_interval,
                avg_speed_kmh: self.config.avg_speed_kmh,
            },
            on_update,
        ))
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down session for user {}", self.user_id);
        self.tracker.stop_all();
        self.channel.disconnect().await;
    }
}
