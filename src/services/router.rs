// src/services/router.rs
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing;

use crate::{
    errors::SparrowResult,
    models::notification::{NavigationTarget, Notification, NotificationCategory},
    services::channel::{ChannelConnectionManager, PushMessage, TopicKind},
    services::events::{ChannelEvent, EventBus},
    services::notification_store::NotificationStore,
};

/// How long an alert should stay on screen.
pub const ALERT_DISPLAY: Duration = Duration::from_secs(5);

const ALERT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertAction {
    pub label: String,
    pub target: NavigationTarget,
}

/// Ephemeral surface for a freshly pushed notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub notification_id: i64,
    pub level: NotificationCategory,
    pub title: String,
    pub description: String,
    pub action: Option<AlertAction>,
    pub display_for: Duration,
}

impl Alert {
    pub fn for_notification(notification: &Notification) -> Self {
        let action = notification
            .related_entity()
            .and_then(|entity| entity.navigation_target())
            .map(|target| AlertAction {
                label: "View".to_string(),
                target,
            });

        Self {
            notification_id: notification.id,
            level: notification.category,
            title: notification.title.clone(),
            description: notification.message.clone(),
            action,
            display_for: ALERT_DISPLAY,
        }
    }
}

pub struct NotificationEventRouter {
    store: Arc<NotificationStore>,
    events: EventBus,
    alerts: broadcast::Sender<Alert>,
}

impl NotificationEventRouter {
    pub fn new(store: Arc<NotificationStore>, events: EventBus) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_BUFFER);
        Self {
            store,
            events,
            alerts,
        }
    }

    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Install this router as the handler for every standard topic.
    pub fn attach(self: &Arc<Self>, manager: &ChannelConnectionManager) {
        for kind in TopicKind::ALL {
            let router = Arc::clone(self);
            manager.set_topic_route(
                kind,
                Arc::new(move |message: &PushMessage| {
                    router.route(kind, message);
                }),
            );
        }
    }

    /// Handle one inbound frame. Malformed payloads are logged and dropped.
    pub fn route(&self, kind: TopicKind, message: &PushMessage) -> Option<Notification> {
        match self.handle_payload(kind, &message.body) {
            Ok(notification) => Some(notification),
            Err(e) => {
                tracing::warn!("Dropping push on {}: {}", message.destination, e);
                None
            }
        }
    }

    pub fn handle_payload(&self, kind: TopicKind, body: &str) -> SparrowResult<Notification> {
        let notification = Notification::from_payload(body)?;
        tracing::info!(
            "Received {} push {}: {}",
            kind.queue(),
            notification.id,
            notification.title
        );

        if self.store.prepend(notification.clone()) {
            // no receivers is fine
            let _ = self.alerts.send(Alert::for_notification(&notification));
        }

        let event = match kind {
            TopicKind::Notifications => ChannelEvent::NotificationReceived(notification.clone()),
            TopicKind::Orders => ChannelEvent::OrderUpdate(notification.clone()),
            TopicKind::Payments => ChannelEvent::PaymentUpdate(notification.clone()),
            TopicKind::Deliveries => ChannelEvent::DeliveryUpdate(notification.clone()),
        };
        self.events.publish(event);

        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SparrowError;
    use crate::models::notification::NotificationPage;
    use crate::services::backend::NotificationApi;
    use crate::services::events::EventKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopApi;

    #[async_trait]
    impl NotificationApi for NoopApi {
        async fn fetch_page(&self, _: i64, _: u32, _: u32) -> SparrowResult<NotificationPage> {
            Ok(NotificationPage::default())
        }
        async fn unread_count(&self, _: i64) -> SparrowResult<u64> {
            Ok(0)
        }
        async fn mark_read(&self, _: i64) -> SparrowResult<()> {
            Ok(())
        }
        async fn mark_all_read(&self, _: i64) -> SparrowResult<()> {
            Ok(())
        }
        async fn delete(&self, _: i64) -> SparrowResult<()> {
            Ok(())
        }
    }

    fn router() -> (NotificationEventRouter, Arc<NotificationStore>, EventBus) {
        let store = Arc::new(NotificationStore::new(Arc::new(NoopApi), 10));
        let events = EventBus::new();
        (NotificationEventRouter::new(store.clone(), events.clone()), store, events)
    }

    const ORDER_PUSH: &str = r#"{
        "id": 1234, "userId": 4, "type": "ORDER", "category": "SUCCESS",
        "title": "Order Confirmed", "message": "Your order is being prepared",
        "relatedEntityType": "ORDER", "relatedEntityId": 55,
        "isRead": false, "createdAt": "2024-05-01T12:30:00", "priority": "HIGH"
    }"#;

    #[test]
    fn test_valid_push_reaches_store_alert_and_event() {
        let (router, store, events) = router();
        let mut alerts = router.alerts();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _listener = events.subscribe(EventKind::OrderUpdate, move |event| {
            assert_eq!(event.notification().map(|n| n.id), Some(1234));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let routed = router.handle_payload(TopicKind::Orders, ORDER_PUSH).unwrap();
        assert_eq!(routed.id, 1234);
        assert_eq!(store.unread_count(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.level, NotificationCategory::Success);
        assert_eq!(alert.display_for, Duration::from_secs(5));
        let action = alert.action.unwrap();
        assert_eq!(action.label, "View");
        assert_eq!(action.target.path(), "/order-tracking/55");
    }

    #[test]
    fn test_malformed_push_is_dropped() {
        let (router, store, _events) = router();
        let message = PushMessage {
            destination: "/user/4/queue/notifications".to_string(),
            subscription: None,
            body: "{not json".to_string(),
        };

        assert!(router.route(TopicKind::Notifications, &message).is_none());
        assert!(matches!(
            router.handle_payload(TopicKind::Notifications, "{\"id\": 1}"),
            Err(SparrowError::MalformedPayload(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_payment_entity_has_no_action() {
        let (router, _store, _events) = router();
        let mut alerts = router.alerts();
        let body = ORDER_PUSH
            .replace("\"relatedEntityType\": \"ORDER\"", "\"relatedEntityType\": \"PAYMENT\"")
            .replace("\"category\": \"SUCCESS\",", "");

        router.handle_payload(TopicKind::Payments, &body).unwrap();
        let alert = alerts.try_recv().unwrap();
        assert!(alert.action.is_none());
        assert_eq!(alert.level, NotificationCategory::Info);
    }

    #[test]
    fn test_duplicate_push_is_not_realerted() {
        let (router, store, _events) = router();
        let mut alerts = router.alerts();

        router.handle_payload(TopicKind::Notifications, ORDER_PUSH).unwrap();
        router.handle_payload(TopicKind::Notifications, ORDER_PUSH).unwrap();

        assert_eq!(store.len(), 1);
        assert!(alerts.try_recv().is_ok());
        assert!(alerts.try_recv().is_err());
    }
}
