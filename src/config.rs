// src/config.rs
use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{debug, warn};

use crate::errors::{SparrowError, SparrowResult};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// STOMP-over-WebSocket endpoint of the notification service
    pub push_url: String,
    /// Base of the notification REST API (`.../api/notifications`)
    pub notifications_url: String,
    /// Base of the delivery REST API (`.../api/deliveries`)
    pub delivery_url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub poll_interval: Duration,
    pub location_timeout: Duration,
    pub store_capacity: usize,
    pub page_size: u32,
    pub avg_speed_kmh: f64,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            push_url: "ws://localhost:8086/ws/notifications/websocket".to_string(),
            notifications_url: "http://localhost:8086/api/notifications".to_string(),
            delivery_url: "http://localhost:8080/api/deliveries".to_string(),
            reconnect_delay: Duration::from_millis(3_000),
            max_reconnect_attempts: 5,
            poll_interval: Duration::from_secs(15),
            location_timeout: Duration::from_secs(10),
            store_capacity: 100,
            page_size: 20,
            avg_speed_kmh: 30.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Load from `SPARROW_*` environment variables, falling back to defaults.
    pub fn from_env() -> SparrowResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> SparrowResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            push_url: lookup("SPARROW_PUSH_URL").unwrap_or(defaults.push_url),
            notifications_url: lookup("SPARROW_NOTIFICATIONS_URL")
                .unwrap_or(defaults.notifications_url),
            delivery_url: lookup("SPARROW_DELIVERY_URL").unwrap_or(defaults.delivery_url),
            reconnect_delay: Duration::from_millis(try_load(
                &lookup,
                "SPARROW_RECONNECT_DELAY_MS",
                defaults.reconnect_delay.as_millis() as u64,
            )?),
            max_reconnect_attempts: try_load(
                &lookup,
                "SPARROW_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            poll_interval: Duration::from_secs(try_load(
                &lookup,
                "SPARROW_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            location_timeout: Duration::from_secs(try_load(
                &lookup,
                "SPARROW_LOCATION_TIMEOUT_SECS",
                defaults.location_timeout.as_secs(),
            )?),
            store_capacity: try_load(&lookup, "SPARROW_STORE_CAPACITY", defaults.store_capacity)?,
            page_size: try_load(&lookup, "SPARROW_PAGE_SIZE", defaults.page_size)?,
            avg_speed_kmh: try_load(&lookup, "SPARROW_AVG_SPEED_KMH", defaults.avg_speed_kmh)?,
            request_timeout: defaults.request_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SparrowResult<()> {
        if !(self.push_url.starts_with("ws://") || self.push_url.starts_with("wss://")) {
            return Err(SparrowError::invalid_field(
                "push_url",
                &self.push_url,
                "must be a ws:// or wss:// URL",
            ));
        }
        for (field, url) in [
            ("notifications_url", &self.notifications_url),
            ("delivery_url", &self.delivery_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SparrowError::invalid_field(field, url, "must be an http(s) URL"));
            }
        }
        if self.max_reconnect_attempts == 0 {
            return Err(SparrowError::invalid_field(
                "max_reconnect_attempts",
                self.max_reconnect_attempts,
                "must allow at least one attempt",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SparrowError::invalid_field("poll_interval", 0, "must be positive"));
        }
        if self.location_timeout.is_zero() {
            return Err(SparrowError::invalid_field("location_timeout", 0, "must be positive"));
        }
        if self.store_capacity == 0 {
            return Err(SparrowError::invalid_field("store_capacity", 0, "must be positive"));
        }
        if !(self.avg_speed_kmh.is_finite() && self.avg_speed_kmh > 0.0) {
            return Err(SparrowError::invalid_field(
                "avg_speed_kmh",
                self.avg_speed_kmh,
                "must be a positive speed",
            ));
        }
        Ok(())
    }
}

fn try_load<T, F>(lookup: &F, key: &str, default: T) -> SparrowResult<T>
where
    T: FromStr + Display,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            SparrowError::invalid_field(key, raw.trim(), e.to_string())
        }),
        None => {
            debug!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}
