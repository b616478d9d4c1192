// src/models/notification.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{SparrowError, SparrowResult};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Order,
    Payment,
    Delivery,
    System,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationCategory {
    Success,
    Error,
    Warning,
    #[default]
    Info,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelatedEntityType {
    Order,
    Payment,
    Delivery,
}

/// Weak pointer from a notification to the entity it talks about.
/// Only used to build a navigation target, never to own or load the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelatedEntity {
    pub entity_type: RelatedEntityType,
    pub entity_id: i64,
}

/// Where the presentation layer should go when the user acts on a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationTarget {
    OrderTracking { order_id: i64 },
}

impl NavigationTarget {
    pub fn path(&self) -> String {
        match self {
            NavigationTarget::OrderTracking { order_id } => format!("/order-tracking/{}", order_id),
        }
    }
}

impl RelatedEntity {
    pub fn navigation_target(&self) -> Option<NavigationTarget> {
        match self.entity_type {
            RelatedEntityType::Order => Some(NavigationTarget::OrderTracking {
                order_id: self.entity_id,
            }),
            RelatedEntityType::Payment | RelatedEntityType::Delivery => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub user_role: Option<String>,  // CUSTOMER, AGENT, OWNER, ADMIN
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(default, deserialize_with = "category_or_default")]
    pub category: NotificationCategory,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub related_entity_type: Option<RelatedEntityType>,
    #[serde(default)]
    pub related_entity_id: Option<i64>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(with = "wire_time")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "wire_time::option", skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Option<NotificationPriority>,
}

impl Notification {
    /// Parse a raw push payload. Anything that does not describe a complete
    /// notification is reported as a malformed payload.
    pub fn from_payload(body: &str) -> SparrowResult<Self> {
        let notification: Notification =
            serde_json::from_str(body).map_err(|e| SparrowError::malformed(e.to_string()))?;

        if notification.title.trim().is_empty() {
            return Err(SparrowError::malformed("notification title is empty"));
        }

        Ok(notification)
    }

    pub fn related_entity(&self) -> Option<RelatedEntity> {
        match (self.related_entity_type, self.related_entity_id) {
            (Some(entity_type), Some(entity_id)) => Some(RelatedEntity {
                entity_type,
                entity_id,
            }),
            _ => None,
        }
    }

    pub fn mark_read_at(&mut self, when: DateTime<Utc>) -> bool {
        if self.is_read {
            return false;
        }
        self.is_read = true;
        self.read_at = Some(when);
        true
    }
}

fn category_or_default<'de, D>(deserializer: D) -> Result<NotificationCategory, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<NotificationCategory>::deserialize(deserializer)?.unwrap_or_default())
}

/// A page of the durable notification log (`GET notifications`).
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    #[serde(default)]
    pub content: Vec<Notification>,
    #[serde(default)]
    pub total_elements: Option<u64>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub number: Option<u32>,
    #[serde(default)]
    pub last: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub unread_count: u64,
}

/// Timestamps arrive either as RFC 3339 or as a zone-less local date time
/// (`2024-05-01T12:30:00.123`), which is taken to be UTC.
pub(crate) mod wire_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw))),
                None => Ok(None),
            }
        }
    }
}
