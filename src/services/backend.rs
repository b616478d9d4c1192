// src/services/backend.rs
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing;

use crate::{
    config::ClientConfig,
    errors::{SparrowError as AppError, SparrowResult},
    models::delivery::{ApiEnvelope, DeliveryLocation, LocationUpdateRequest},
    models::notification::{NotificationPage, UnreadCount},
};

/// Durable notification history.
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn fetch_page(&self, user_id: i64, page: u32, size: u32) -> SparrowResult<NotificationPage>;
    async fn unread_count(&self, user_id: i64) -> SparrowResult<u64>;
    async fn mark_read(&self, notification_id: i64) -> SparrowResult<()>;
    async fn mark_all_read(&self, user_id: i64) -> SparrowResult<()>;
    async fn delete(&self, notification_id: i64) -> SparrowResult<()>;
}

#[async_trait]
pub trait DeliveryApi: Send + Sync {
    async fn push_location(&self, delivery_id: i64, update: LocationUpdateRequest) -> SparrowResult<()>;
    async fn fetch_location(&self, delivery_id: i64) -> SparrowResult<DeliveryLocation>;
}

/// REST client for the notification and delivery services.
pub struct HttpBackend {
    client: reqwest::Client,
    notifications_url: String,
    delivery_url: String,
    user_id: i64,
    auth_token: String,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig, user_id: i64, auth_token: impl Into<String>) -> SparrowResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            notifications_url: config.notifications_url.trim_end_matches('/').to_string(),
            delivery_url: config.delivery_url.trim_end_matches('/').to_string(),
            user_id,
            auth_token: auth_token.into(),
        })
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("X-User-Id", self.user_id.to_string());
        if self.auth_token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.auth_token)
        }
    }

    async fn send(&self, builder: RequestBuilder) -> SparrowResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        let message = rejection_message(&error_text).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });
        tracing::error!("Backend request failed ({}): {}", status.as_u16(), message);

        if status == reqwest::StatusCode::NOT_FOUND {
            Err(AppError::not_found(message))
        } else {
            Err(AppError::rejected(status.as_u16(), message))
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> SparrowResult<T> {
        let response = self.send(builder).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Unwrap a `{success, data, message}` envelope, treating `success: false`
    /// as a rejection even on a 2xx status.
    async fn send_envelope<T: DeserializeOwned>(&self, builder: RequestBuilder) -> SparrowResult<Option<T>> {
        let envelope: ApiEnvelope<T> = self.send_json(builder).await?;
        if !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "request was not successful".to_string());
            return Err(AppError::rejected(200, message));
        }
        Ok(envelope.data)
    }
}

/// Pull a human-readable message out of an error body, if it has one.
fn rejection_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => ["message", "error"]
            .iter()
            .find_map(|key| json.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        Err(_) => Some(trimmed.to_string()),
    }
}

#[async_trait]
impl NotificationApi for HttpBackend {
    async fn fetch_page(&self, user_id: i64, page: u32, size: u32) -> SparrowResult<NotificationPage> {
        tracing::debug!("Fetching notifications page {} (size {}) for user {}", page, size, user_id);
        let builder = self
            .request(Method::GET, self.notifications_url.clone())
            .query(&[
                ("userId", user_id.to_string()),
                ("page", page.to_string()),
                ("size", size.to_string()),
            ]);
        self.send_json(builder).await
    }

    async fn unread_count(&self, user_id: i64) -> SparrowResult<u64> {
        let builder = self
            .request(Method::GET, format!("{}/count", self.notifications_url))
            .query(&[("userId", user_id.to_string())]);
        let count: UnreadCount = self.send_json(builder).await?;
        Ok(count.unread_count)
    }

    async fn mark_read(&self, notification_id: i64) -> SparrowResult<()> {
        tracing::debug!("Marking notification {} as read", notification_id);
        let url = format!("{}/{}/read", self.notifications_url, notification_id);
        self.send(self.request(Method::PUT, url)).await?;
        Ok(())
    }

    async fn mark_all_read(&self, user_id: i64) -> SparrowResult<()> {
        tracing::debug!("Marking all notifications as read for user {}", user_id);
        let builder = self
            .request(Method::PUT, format!("{}/read-all", self.notifications_url))
            .query(&[("userId", user_id.to_string())]);
        self.send(builder).await?;
        Ok(())
    }

    async fn delete(&self, notification_id: i64) -> SparrowResult<()> {
        tracing::debug!("Deleting notification {}", notification_id);
        let url = format!("{}/{}", self.notifications_url, notification_id);
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryApi for HttpBackend {
    async fn push_location(&self, delivery_id: i64, update: LocationUpdateRequest) -> SparrowResult<()> {
        let url = format!("{}/{}/location", self.delivery_url, delivery_id);
        let builder = self.request(Method::POST, url).json(&update);
        let _: Option<Value> = self.send_envelope(builder).await?;
        tracing::debug!(
            "Pushed location for delivery {}: {}, {}",
            delivery_id,
            update.latitude,
            update.longitude
        );
        Ok(())
    }

    async fn fetch_location(&self, delivery_id: i64) -> SparrowResult<DeliveryLocation> {
        let url = format!("{}/{}/location", self.delivery_url, delivery_id);
        self.send_envelope(self.request(Method::GET, url))
            .await?
            .ok_or_else(|| AppError::not_found(format!("location for delivery {}", delivery_id)))
    }
}
