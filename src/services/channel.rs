// src/services/channel.rs
//! Push channel lifecycle: connect, per-user topic subscriptions, fixed-delay
//! reconnection and teardown.
//!
//! Every user-initiated [`ChannelConnectionManager::connect`] and every
//! [`ChannelConnectionManager::disconnect`] bumps a generation counter.
//! Background work (reconnect timers, the inbound dispatch loop, an open call
//! that is still resolving) captures the generation it was started under and
//! discards itself once the counter has moved on, so a torn-down channel is
//! never brought back by a late callback.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing;

use crate::{
    config::ClientConfig,
    errors::{SparrowError as AppError, SparrowResult},
    services::events::{ChannelEvent, EventBus},
};

/// A frame delivered on one of our subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub destination: String,
    pub subscription: Option<String>,
    pub body: String,
}

pub type MessageHandler = Arc<dyn Fn(&PushMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Notifications,
    Orders,
    Payments,
    Deliveries,
}

impl TopicKind {
    pub const ALL: [TopicKind; 4] = [
        TopicKind::Notifications,
        TopicKind::Orders,
        TopicKind::Payments,
        TopicKind::Deliveries,
    ];

    pub fn queue(&self) -> &'static str {
        match self {
            TopicKind::Notifications => "notifications",
            TopicKind::Orders => "orders",
            TopicKind::Payments => "payments",
            TopicKind::Deliveries => "deliveries",
        }
    }

    pub fn destination(&self, user_id: &str) -> String {
        format!("/user/{}/queue/{}", user_id, self.queue())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// An established channel: the control half plus the stream of inbound frames.
/// The stream ending means the server side went away.
pub struct PushSession {
    pub link: Arc<dyn PushLink>,
    pub inbound: mpsc::Receiver<PushMessage>,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self, user_id: &str, auth_token: &str) -> SparrowResult<PushSession>;
}

#[async_trait]
pub trait PushLink: Send + Sync {
    /// Returns the subscription id used on the wire.
    async fn subscribe(&self, destination: &str) -> SparrowResult<String>;
    async fn unsubscribe(&self, subscription_id: &str) -> SparrowResult<()>;
    async fn close(&self) -> SparrowResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: 5,
        }
    }
}

impl From<&ClientConfig> for ReconnectPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            delay: config.reconnect_delay,
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

struct Credentials {
    user_id: String,
    auth_token: String,
}

struct ActiveSubscription {
    subscription_id: String,
    handler: MessageHandler,
}

struct ChannelState {
    status: ConnectionStatus,
    attempt_count: u32,
    generation: u64,
    credentials: Option<Credentials>,
    link: Option<Arc<dyn PushLink>>,
    subscriptions: HashMap<String, ActiveSubscription>,
    routes: HashMap<TopicKind, MessageHandler>,
    reconnect_task: Option<JoinHandle<()>>,
    dispatch_task: Option<JoinHandle<()>>,
}

struct ChannelInner {
    transport: Arc<dyn PushTransport>,
    policy: ReconnectPolicy,
    events: EventBus,
    state: Mutex<ChannelState>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        if let Some(task) = state.dispatch_task.take() {
            task.abort();
        }
    }
}

enum FailureOutcome {
    Stale,
    Retry(u32),
    Exhausted(u32),
}

#[derive(Clone)]
pub struct ChannelConnectionManager {
    inner: Arc<ChannelInner>,
}

impl ChannelConnectionManager {
    pub fn new(transport: Arc<dyn PushTransport>, policy: ReconnectPolicy, events: EventBus) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                policy,
                events,
                state: Mutex::new(ChannelState {
                    status: ConnectionStatus::Disconnected,
                    attempt_count: 0,
                    generation: 0,
                    credentials: None,
                    link: None,
                    subscriptions: HashMap::new(),
                    routes: HashMap::new(),
                    reconnect_task: None,
                    dispatch_task: None,
                }),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn attempt_count(&self) -> u32 {
        self.inner.state.lock().attempt_count
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.state.lock().subscriptions.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Install the handler used for a standard per-user topic. Routes are
    /// (re)subscribed on every successful connect.
    pub fn set_topic_route(&self, kind: TopicKind, handler: MessageHandler) {
        self.inner.state.lock().routes.insert(kind, handler);
    }

    pub async fn connect(&self, user_id: &str, auth_token: &str) -> SparrowResult<()> {
        let generation = {
            let mut state = self.inner.state.lock();
            match state.status {
                ConnectionStatus::Connected => {
                    tracing::debug!("Push channel already connected");
                    return Ok(());
                }
                ConnectionStatus::Connecting => {
                    tracing::debug!("Push channel connect already in flight");
                    return Ok(());
                }
                ConnectionStatus::Disconnected | ConnectionStatus::Error => {}
            }

            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            state.generation += 1;
            state.attempt_count = 0;
            state.status = ConnectionStatus::Connecting;
            state.credentials = Some(Credentials {
                user_id: user_id.to_string(),
                auth_token: auth_token.to_string(),
            });
            state.generation
        };

        tracing::info!("Connecting push channel for user: {}", user_id);

        match self.attempt(generation).await {
            Ok(()) => Ok(()),
            Err(AppError::ConnectionSuperseded) => Err(AppError::ConnectionSuperseded),
            Err(err) => {
                self.handle_failure(generation, &err);
                Err(err)
            }
        }
    }

    /// Register `handler` for `topic`. Only valid while connected; a second
    /// registration for the same topic replaces the handler and keeps the
    /// existing wire subscription.
    pub async fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> SparrowResult<()>
    where
        F: Fn(&PushMessage) + Send + Sync + 'static,
    {
        self.subscribe_handler(topic.into(), Arc::new(handler), None).await
    }

    pub async fn disconnect(&self) {
        let (link, subscriptions) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            if let Some(task) = state.dispatch_task.take() {
                task.abort();
            }
            let subscriptions: Vec<(String, String)> = state
                .subscriptions
                .drain()
                .map(|(topic, sub)| (topic, sub.subscription_id))
                .collect();
            state.status = ConnectionStatus::Disconnected;
            state.attempt_count = 0;
            state.credentials = None;
            (state.link.take(), subscriptions)
        };

        let Some(link) = link else {
            tracing::debug!("Push channel already disconnected");
            return;
        };

        tracing::info!("Disconnecting push channel...");
        for (topic, subscription_id) in subscriptions {
            match link.unsubscribe(&subscription_id).await {
                Ok(()) => tracing::debug!("Unsubscribed from: {}", topic),
                Err(e) => tracing::warn!("Error unsubscribing from {}: {}", topic, e),
            }
        }
        if let Err(e) = link.close().await {
            tracing::warn!("Error closing push channel: {}", e);
        }
        tracing::info!("Push channel disconnected");
    }

    async fn attempt(&self, generation: u64) -> SparrowResult<()> {
        let (user_id, auth_token) = {
            let state = self.inner.state.lock();
            match (&state.credentials, state.generation == generation) {
                (Some(creds), true) => (creds.user_id.clone(), creds.auth_token.clone()),
                _ => return Err(AppError::ConnectionSuperseded),
            }
        };

        let PushSession { link, inbound } = self.inner.transport.open(&user_id, &auth_token).await?;

        let current = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                false
            } else {
                state.status = ConnectionStatus::Connected;
                state.attempt_count = 0;
                state.link = Some(link.clone());
                state.subscriptions.clear();
                let weak = Arc::downgrade(&self.inner);
                state.dispatch_task = Some(tokio::spawn(dispatch(weak, generation, inbound)));
                true
            }
        };

        if !current {
            tracing::debug!("Discarding push channel opened for a torn-down session");
            if let Err(e) = link.close().await {
                tracing::debug!("Error closing superseded channel: {}", e);
            }
            return Err(AppError::ConnectionSuperseded);
        }

        tracing::info!("Push channel connected for user: {}", user_id);

        let routes: Vec<(TopicKind, MessageHandler)> = {
            let state = self.inner.state.lock();
            state.routes.iter().map(|(kind, h)| (*kind, h.clone())).collect()
        };
        for (kind, handler) in routes {
            let destination = kind.destination(&user_id);
            match self.subscribe_handler(destination.clone(), handler, Some(generation)).await {
                Ok(()) => {}
                Err(AppError::ConnectionSuperseded) => return Err(AppError::ConnectionSuperseded),
                Err(e) => tracing::error!("Failed to subscribe to {}: {}", destination, e),
            }
        }

        let still_current = {
            let state = self.inner.state.lock();
            state.generation == generation && state.status == ConnectionStatus::Connected
        };
        if !still_current {
            tracing::debug!("Push channel went away while subscribing topics");
            return Err(AppError::ConnectionSuperseded);
        }

        self.inner.events.publish(ChannelEvent::Connected { user_id });
        Ok(())
    }

    async fn subscribe_handler(
        &self,
        topic: String,
        handler: MessageHandler,
        expected_generation: Option<u64>,
    ) -> SparrowResult<()> {
        let (link, generation) = {
            let mut state = self.inner.state.lock();
            if expected_generation.is_some_and(|g| g != state.generation) {
                return Err(AppError::ConnectionSuperseded);
            }
            if state.status != ConnectionStatus::Connected {
                return Err(AppError::NotConnected);
            }
            if let Some(existing) = state.subscriptions.get_mut(&topic) {
                tracing::debug!("Replacing handler for: {}", topic);
                existing.handler = handler;
                return Ok(());
            }
            match state.link.clone() {
                Some(link) => (link, state.generation),
                None => return Err(AppError::NotConnected),
            }
        };

        let subscription_id = link.subscribe(&topic).await?;

        let outcome = {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.status != ConnectionStatus::Connected {
                Err(AppError::ConnectionSuperseded)
            } else if state.subscriptions.contains_key(&topic) {
                // a concurrent subscribe for the same topic got there first
                Ok(false)
            } else {
                state.subscriptions.insert(
                    topic.clone(),
                    ActiveSubscription {
                        subscription_id: subscription_id.clone(),
                        handler,
                    },
                );
                Ok(true)
            }
        };

        match outcome {
            Ok(true) => {
                tracing::info!("Subscribed to: {}", topic);
                Ok(())
            }
            Ok(false) => {
                if let Err(e) = link.unsubscribe(&subscription_id).await {
                    tracing::debug!("Error releasing duplicate subscription to {}: {}", topic, e);
                }
                Ok(())
            }
            Err(err) => {
                if let Err(e) = link.unsubscribe(&subscription_id).await {
                    tracing::debug!("Error releasing stale subscription to {}: {}", topic, e);
                }
                Err(err)
            }
        }
    }

    fn handle_failure(&self, generation: u64, err: &AppError) {
        let outcome = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                FailureOutcome::Stale
            } else {
                state.status = ConnectionStatus::Error;
                state.link = None;
                state.subscriptions.clear();
                state.attempt_count += 1;
                if state.attempt_count >= self.inner.policy.max_attempts {
                    FailureOutcome::Exhausted(state.attempt_count)
                } else {
                    FailureOutcome::Retry(state.attempt_count)
                }
            }
        };

        let attempt = match outcome {
            FailureOutcome::Stale => {
                tracing::debug!("Ignoring failure from a superseded connect: {}", err);
                return;
            }
            FailureOutcome::Retry(attempt) | FailureOutcome::Exhausted(attempt) => attempt,
        };

        tracing::error!("Push channel connection error: {}", err);
        self.inner.events.publish(ChannelEvent::Error {
            message: err.to_string(),
            attempt,
        });

        match outcome {
            FailureOutcome::Retry(attempt) => self.schedule_reconnect(generation, attempt),
            FailureOutcome::Exhausted(attempts) => {
                tracing::error!("Max reconnection attempts reached ({})", attempts);
                self.inner
                    .events
                    .publish(ChannelEvent::ReconnectFailed { attempts });
            }
            FailureOutcome::Stale => {}
        }
    }

    fn schedule_reconnect(&self, generation: u64, attempt: u32) {
        let delay = self.inner.policy.delay;
        tracing::info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt,
            self.inner.policy.max_attempts
        );

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            ChannelConnectionManager { inner }.reconnect(generation).await;
        });

        let mut state = self.inner.state.lock();
        if state.generation == generation {
            if let Some(previous) = state.reconnect_task.replace(task) {
                previous.abort();
            }
        } else {
            task.abort();
        }
    }

    async fn reconnect(&self, generation: u64) {
        let proceed = {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.status != ConnectionStatus::Error {
                false
            } else {
                state.status = ConnectionStatus::Connecting;
                state.reconnect_task = None;
                true
            }
        };

        if !proceed {
            tracing::debug!("Discarding stale reconnect timer");
            return;
        }

        match self.attempt(generation).await {
            Ok(()) | Err(AppError::ConnectionSuperseded) => {}
            Err(err) => self.handle_failure(generation, &err),
        }
    }

    fn connection_lost(&self, generation: u64) {
        let lost = {
            let mut state = self.inner.state.lock();
            if state.generation == generation && state.status == ConnectionStatus::Connected {
                // this runs on the dispatch task itself, so just forget the handle
                state.dispatch_task = None;
                true
            } else {
                false
            }
        };

        if lost {
            tracing::warn!("Push channel closed by the server");
            self.handle_failure(generation, &AppError::ChannelClosed);
        }
    }
}

async fn dispatch(inner: Weak<ChannelInner>, generation: u64, mut inbound: mpsc::Receiver<PushMessage>) {
    while let Some(message) = inbound.recv().await {
        let Some(strong) = inner.upgrade() else {
            return;
        };

        let handler = {
            let state = strong.state.lock();
            if state.generation != generation {
                return;
            }
            let by_id = message.subscription.as_deref().and_then(|id| {
                state
                    .subscriptions
                    .values()
                    .find(|sub| sub.subscription_id == id)
            });
            by_id
                .or_else(|| state.subscriptions.get(&message.destination))
                .map(|sub| sub.handler.clone())
        };

        match handler {
            Some(handler) => handler(&message),
            None => tracing::debug!("No subscription for message on: {}", message.destination),
        }
    }

    if let Some(strong) = inner.upgrade() {
        ChannelConnectionManager { inner: strong }.connection_lost(generation);
    }
}
