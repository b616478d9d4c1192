mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::oneshot;

use common::{FakeDeliveryApi, FakeNotificationApi, FakeSensor, FakeTransport, notification, push_payload, settle};
use sparrow_tracking::{
    ClientConfig, ClientSession, Collaborators, SparrowError,
    services::channel::TopicKind,
    services::events::{EventBus, EventKind},
    services::notification_store::NotificationStore,
    services::router::NotificationEventRouter,
};

fn store_with(api: Arc<FakeNotificationApi>, entries: &[(i64, bool)]) -> NotificationStore {
    let store = NotificationStore::new(api, 100);
    for (id, is_read) in entries {
        store.prepend(notification(*id, *is_read));
    }
    store
}

fn unread_entries(store: &NotificationStore) -> usize {
    store.snapshot().iter().filter(|n| !n.is_read).count()
}

#[tokio::test]
async fn mark_all_read_confirms_before_mutating() {
    let entries = [(1, false), (2, true), (3, false), (4, true), (5, false)];

    let api = Arc::new(FakeNotificationApi::default());
    let store = store_with(api.clone(), &entries);
    assert_eq!(store.unread_count(), 3);

    store.mark_all_read(4).await.unwrap();
    assert_eq!(store.unread_count(), 0);
    assert!(store.snapshot().iter().all(|n| n.is_read));
    assert_eq!(api.mark_all_calls.load(Ordering::SeqCst), 1);

    let api = Arc::new(FakeNotificationApi::default());
    let store = store_with(api.clone(), &entries);
    api.reject.store(true, Ordering::SeqCst);

    let err = store.mark_all_read(4).await.unwrap_err();
    assert!(matches!(err, SparrowError::BackendRejection { status: 500, .. }));
    assert_eq!(store.unread_count(), 3);
    assert_eq!(unread_entries(&store), 3);
}

#[tokio::test]
async fn mark_all_read_spares_notifications_pushed_while_in_flight() {
    let api = Arc::new(FakeNotificationApi::default());
    let (release, gate) = oneshot::channel();
    *api.mark_all_gate.lock() = Some(gate);
    let store = Arc::new(store_with(api.clone(), &[(1, false), (2, true), (3, false)]));

    let pending = tokio::spawn({
        let store = store.clone();
        async move { store.mark_all_read(4).await }
    });
    while api.mark_all_calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    // arrives while the backend call is still open
    assert!(store.prepend(notification(99, false)));
    assert_eq!(store.unread_count(), 3);

    release.send(()).unwrap();
    pending.await.unwrap().unwrap();

    assert!(!store.get(99).unwrap().is_read);
    assert!(store.get(1).unwrap().is_read);
    assert!(store.get(3).unwrap().is_read);
    assert_eq!(store.unread_count(), 1);
    assert_eq!(unread_entries(&store), 1);
}

#[tokio::test]
async fn unread_counter_tracks_entries_through_mixed_operations() {
    let api = Arc::new(FakeNotificationApi::default());
    let store = store_with(api.clone(), &[(1, false), (2, false), (3, true), (4, false)]);

    let script: [(&str, i64); 9] = [
        ("read", 1),
        ("read", 1),
        ("delete", 2),
        ("read", 3),
        ("read", 42),
        ("delete", 3),
        ("read", 4),
        ("delete", 4),
        ("read", 4),
    ];
    for (op, id) in script {
        match op {
            "read" => {
                store.mark_read(id).await.unwrap();
            }
            _ => {
                store.delete(id).await.unwrap();
            }
        }
        assert_eq!(store.unread_count(), unread_entries(&store), "after {} {}", op, id);
    }

    assert_eq!(store.unread_count(), 0);
    assert_eq!(store.len(), 1);
    assert_eq!(*api.deleted.lock(), vec![2, 3, 4]);
}

#[tokio::test]
async fn refresh_does_not_duplicate_pushed_notification() {
    let api = Arc::new(FakeNotificationApi::default());
    let store = Arc::new(NotificationStore::new(api.clone(), 100));
    let router = NotificationEventRouter::new(store.clone(), EventBus::new());

    router
        .handle_payload(TopicKind::Notifications, &push_payload(1234))
        .unwrap();

    // the page carries the same notification plus older history
    *api.page.lock() = vec![notification(1234, false), notification(1200, true), notification(1100, false)];
    let added = store.refresh(4, 0, 20).await.unwrap();

    assert_eq!(added, 2);
    let ids: Vec<i64> = store.snapshot().iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![1234, 1200, 1100]);
    assert_eq!(store.snapshot().iter().filter(|n| n.id == 1234).count(), 1);
    assert_eq!(store.unread_count(), 2);

    // refreshing again changes nothing
    assert_eq!(store.refresh(4, 0, 20).await.unwrap(), 0);
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn refresh_failure_leaves_store_untouched() {
    let api = Arc::new(FakeNotificationApi::default());
    let store = store_with(api.clone(), &[(1, false)]);
    api.reject.store(true, Ordering::SeqCst);

    assert!(store.refresh(4, 0, 20).await.is_err());
    assert_eq!(store.len(), 1);
    assert_eq!(store.unread_count(), 1);
}

#[tokio::test]
async fn backend_unread_count_does_not_overwrite_local_counter() {
    let api = Arc::new(FakeNotificationApi::default());
    let store = store_with(api.clone(), &[(1, false)]);
    *api.backend_unread.lock() = 17;

    assert_eq!(store.backend_unread_count(4).await.unwrap(), 17);
    assert_eq!(store.unread_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn session_routes_pushes_into_store_and_events() {
    let transport = FakeTransport::new(false);
    let notifications = Arc::new(FakeNotificationApi::default());
    *notifications.page.lock() = vec![notification(10, true), notification(11, false)];

    let session = ClientSession::new(
        ClientConfig::default(),
        4,
        "token",
        Collaborators {
            transport: transport.clone(),
            notifications: notifications.clone(),
            deliveries: Arc::new(FakeDeliveryApi::default()),
            sensor: FakeSensor::new(false),
        },
    );

    let deliveries = Arc::new(AtomicUsize::new(0));
    let hits = deliveries.clone();
    let _listener = session.events.subscribe(EventKind::DeliveryUpdate, move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    let mut alerts = session.router.alerts();

    session.start().await.unwrap();
    assert!(session.channel.is_connected());
    assert_eq!(session.store.len(), 2);
    assert_eq!(session.channel.subscribed_topics().len(), 4);

    transport
        .push("/user/4/queue/deliveries", &push_payload(12))
        .await;
    transport
        .push("/user/4/queue/notifications", "not a notification")
        .await;
    settle().await;

    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    assert_eq!(session.store.snapshot()[0].id, 12);
    assert_eq!(session.store.unread_count(), 2);
    assert_eq!(alerts.try_recv().unwrap().notification_id, 12);
    assert!(session.channel.is_connected());

    session.mark_all_read().await.unwrap();
    assert_eq!(session.store.unread_count(), 0);

    session.shutdown().await;
    assert!(!session.channel.is_connected());
}
