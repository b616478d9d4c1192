// Shared fakes for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use sparrow_tracking::{
    SparrowError, SparrowResult,
    models::delivery::{DeliveryLocation, LocationSample, LocationUpdateRequest},
    models::notification::{Notification, NotificationCategory, NotificationPage, NotificationType},
    services::backend::{DeliveryApi, NotificationApi},
    services::channel::{PushLink, PushMessage, PushSession, PushTransport},
    services::location_tracking::{PositionSensor, SensorError, SensorWatch, WatchOptions},
};

pub fn notification(id: i64, is_read: bool) -> Notification {
    Notification {
        id,
        user_id: Some(4),
        user_role: Some("CUSTOMER".to_string()),
        notification_type: NotificationType::Order,
        category: NotificationCategory::Info,
        title: format!("Notification {}", id),
        message: format!("Body of {}", id),
        related_entity_type: None,
        related_entity_id: None,
        is_read,
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(id),
        read_at: None,
        priority: None,
    }
}

pub fn push_payload(id: i64) -> String {
    serde_json::to_string(&notification(id, false)).unwrap()
}

/// Let spawned tasks run (and, with a paused clock, let timers fire).
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Push transport

pub enum OpenBehavior {
    Fail,
    Succeed,
    WaitThenSucceed(oneshot::Receiver<()>),
}

#[derive(Default)]
pub struct FakeLink {
    next_id: AtomicUsize,
    pub subscriptions: Mutex<Vec<(String, String)>>,  // (id, destination)
    pub unsubscribed: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    /// Holds the next subscribe until released. The flag says whether it then
    /// reports the link as closed or succeeds.
    subscribe_stall: Mutex<Option<(oneshot::Receiver<()>, bool)>>,
}

#[async_trait]
impl PushLink for FakeLink {
    async fn subscribe(&self, destination: &str) -> SparrowResult<String> {
        let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions
            .lock()
            .push((id.clone(), destination.to_string()));
        let stall = self.subscribe_stall.lock().take();
        if let Some((gate, fail)) = stall {
            let _ = gate.await;
            if fail {
                return Err(SparrowError::ChannelClosed);
            }
        }
        Ok(id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> SparrowResult<()> {
        self.unsubscribed.lock().push(subscription_id.to_string());
        Ok(())
    }

    async fn close(&self) -> SparrowResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeTransport {
    opens: AtomicUsize,
    script: Mutex<VecDeque<OpenBehavior>>,
    fail_when_unscripted: bool,
    pub links: Mutex<Vec<Arc<FakeLink>>>,
    inbound: Mutex<Vec<mpsc::Sender<PushMessage>>>,
    next_subscribe_stall: Mutex<Option<(oneshot::Receiver<()>, bool)>>,
}

impl FakeTransport {
    pub fn new(fail_when_unscripted: bool) -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            fail_when_unscripted,
            links: Mutex::new(Vec::new()),
            inbound: Mutex::new(Vec::new()),
            next_subscribe_stall: Mutex::new(None),
        })
    }

    pub fn script(&self, behavior: OpenBehavior) {
        self.script.lock().push_back(behavior);
    }

    /// The next opened link stalls its first subscribe on `gate`, then fails
    /// it with a closed link when `fail` is set.
    pub fn stall_next_subscribe(&self, gate: oneshot::Receiver<()>, fail: bool) {
        *self.next_subscribe_stall.lock() = Some((gate, fail));
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn last_link(&self) -> Option<Arc<FakeLink>> {
        self.links.lock().last().cloned()
    }

    /// Deliver a frame on the most recent session.
    pub async fn push(&self, destination: &str, body: &str) -> bool {
        let sender = self.inbound.lock().last().cloned();
        match sender {
            Some(sender) => sender
                .send(PushMessage {
                    destination: destination.to_string(),
                    subscription: None,
                    body: body.to_string(),
                })
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Simulate the server going away on every open session.
    pub fn drop_sessions(&self) {
        self.inbound.lock().clear();
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn open(&self, _user_id: &str, _auth_token: &str) -> SparrowResult<PushSession> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let behavior = self.script.lock().pop_front();
        let behavior = behavior.unwrap_or(if self.fail_when_unscripted {
            OpenBehavior::Fail
        } else {
            OpenBehavior::Succeed
        });

        match behavior {
            OpenBehavior::Fail => {
                return Err(SparrowError::ChannelConnect("connection refused".to_string()));
            }
            OpenBehavior::Succeed => {}
            OpenBehavior::WaitThenSucceed(gate) => {
                let _ = gate.await;
            }
        }

        let link = Arc::new(FakeLink::default());
        let stall = self.next_subscribe_stall.lock().take();
        *link.subscribe_stall.lock() = stall;
        let (tx, rx) = mpsc::channel(16);
        self.links.lock().push(link.clone());
        self.inbound.lock().push(tx);
        Ok(PushSession { link, inbound: rx })
    }
}

// ---------------------------------------------------------------------------
// Notification backend

#[derive(Default)]
pub struct FakeNotificationApi {
    pub reject: AtomicBool,
    pub page: Mutex<Vec<Notification>>,
    pub backend_unread: Mutex<u64>,
    pub mark_all_calls: AtomicUsize,
    pub mark_read_calls: AtomicUsize,
    pub deleted: Mutex<Vec<i64>>,
    /// When set, the next mark-all-read call waits for this before answering.
    pub mark_all_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeNotificationApi {
    fn check(&self) -> SparrowResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            Err(SparrowError::rejected(500, "notification service unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NotificationApi for FakeNotificationApi {
    async fn fetch_page(&self, _user_id: i64, _page: u32, _size: u32) -> SparrowResult<NotificationPage> {
        self.check()?;
        let content = self.page.lock().clone();
        Ok(NotificationPage {
            total_elements: Some(content.len() as u64),
            content,
            ..NotificationPage::default()
        })
    }

    async fn unread_count(&self, _user_id: i64) -> SparrowResult<u64> {
        self.check()?;
        Ok(*self.backend_unread.lock())
    }

    async fn mark_read(&self, _notification_id: i64) -> SparrowResult<()> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    async fn mark_all_read(&self, _user_id: i64) -> SparrowResult<()> {
        self.mark_all_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.mark_all_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.check()
    }

    async fn delete(&self, notification_id: i64) -> SparrowResult<()> {
        self.check()?;
        self.deleted.lock().push(notification_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delivery backend

#[derive(Default)]
pub struct FakeDeliveryApi {
    pub fail_pushes: AtomicBool,
    pub pushed: Mutex<Vec<(i64, LocationUpdateRequest)>>,
    pub responses: Mutex<VecDeque<SparrowResult<DeliveryLocation>>>,
    pub fetches: AtomicUsize,
}

impl FakeDeliveryApi {
    pub fn respond(&self, response: SparrowResult<DeliveryLocation>) {
        self.responses.lock().push_back(response);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryApi for FakeDeliveryApi {
    async fn push_location(&self, delivery_id: i64, update: LocationUpdateRequest) -> SparrowResult<()> {
        self.pushed.lock().push((delivery_id, update));
        if self.fail_pushes.load(Ordering::SeqCst) {
            Err(SparrowError::NetworkConnection("offline".to_string()))
        } else {
            Ok(())
        }
    }

    async fn fetch_location(&self, delivery_id: i64) -> SparrowResult<DeliveryLocation> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().pop_front();
        next.unwrap_or_else(|| Err(SparrowError::not_found(format!("delivery {}", delivery_id))))
    }
}

// ---------------------------------------------------------------------------
// Position sensor

pub enum OneShot {
    Fix(LocationSample),
    Fail(SensorError),
    Hang,
}

pub struct FakeSensor {
    available: bool,
    next_watch: AtomicUsize,
    pub feeds: Mutex<Vec<(u64, mpsc::Sender<Result<LocationSample, SensorError>>)>>,
    pub cleared: Mutex<Vec<u64>>,
    pub one_shot: Mutex<Option<OneShot>>,
    pub last_options: Mutex<Option<WatchOptions>>,
}

impl FakeSensor {
    pub fn new(available: bool) -> Arc<Self> {
        Arc::new(Self {
            available,
            next_watch: AtomicUsize::new(1),
            feeds: Mutex::new(Vec::new()),
            cleared: Mutex::new(Vec::new()),
            one_shot: Mutex::new(None),
            last_options: Mutex::new(None),
        })
    }

    pub async fn emit(&self, watch_id: u64, fix: Result<LocationSample, SensorError>) -> bool {
        let sender = self
            .feeds
            .lock()
            .iter()
            .find(|(id, _)| *id == watch_id)
            .map(|(_, tx)| tx.clone());
        match sender {
            Some(tx) => tx.send(fix).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl PositionSensor for FakeSensor {
    fn is_available(&self) -> bool {
        self.available
    }

    fn watch(&self, options: WatchOptions) -> Result<SensorWatch, SensorError> {
        if !self.available {
            return Err(SensorError::Unsupported);
        }
        *self.last_options.lock() = Some(options);
        let id = self.next_watch.fetch_add(1, Ordering::SeqCst) as u64;
        let (tx, rx) = mpsc::channel(16);
        self.feeds.lock().push((id, tx));
        Ok(SensorWatch { id, fixes: rx })
    }

    fn clear_watch(&self, watch_id: u64) {
        self.cleared.lock().push(watch_id);
        self.feeds.lock().retain(|(id, _)| *id != watch_id);
    }

    async fn current_position(&self, _options: WatchOptions) -> Result<LocationSample, SensorError> {
        let behavior = self.one_shot.lock().take();
        match behavior {
            Some(OneShot::Fix(sample)) => Ok(sample),
            Some(OneShot::Fail(e)) => Err(e),
            Some(OneShot::Hang) | None => std::future::pending().await,
        }
    }
}

pub fn sample(latitude: f64, longitude: f64) -> LocationSample {
    LocationSample {
        latitude,
        longitude,
        accuracy: 8.0,
        timestamp: Utc::now(),
    }
}
