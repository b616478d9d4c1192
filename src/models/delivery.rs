// src/models/delivery.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::notification::wire_time;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// One reading from the device position sensor.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,  // Accuracy in meters
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryPhase {
    Pending,     // Created, no agent yet
    Assigned,    // Agent assigned
    Accepted,    // Agent accepted the job
    PickedUp,    // Food collected from the restaurant
    InTransit,   // On the way to the customer
    Delivered,
    Cancelled,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl DeliveryPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryPhase::Delivered | DeliveryPhase::Cancelled | DeliveryPhase::Failed
        )
    }

    /// An agent is attached and moving, so its position is worth fetching.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DeliveryPhase::Assigned
                | DeliveryPhase::Accepted
                | DeliveryPhase::PickedUp
                | DeliveryPhase::InTransit
                | DeliveryPhase::Unknown
        )
    }
}

/// Body of `POST delivery/{id}/location`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct LocationUpdateRequest {
    pub latitude: f64,
    pub longitude: f64,
}

/// Delivery position as returned by `GET delivery/{id}/location`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLocation {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub status: Option<DeliveryPhase>,
    #[serde(default)]
    pub agent_latitude: Option<f64>,
    #[serde(default)]
    pub agent_longitude: Option<f64>,
    #[serde(default)]
    pub delivery_latitude: Option<f64>,
    #[serde(default)]
    pub delivery_longitude: Option<f64>,
    #[serde(default)]
    pub estimated_distance_km: Option<f64>,
    #[serde(default)]
    pub estimated_time_minutes: Option<u32>,
    #[serde(default, with = "wire_time::option")]
    pub last_location_update: Option<DateTime<Utc>>,
}

impl DeliveryLocation {
    pub fn agent_position(&self) -> Option<Coordinate> {
        match (self.agent_latitude, self.agent_longitude) {
            (Some(lat), Some(lng)) => Some(Coordinate::new(lat, lng)),
            _ => None,
        }
    }

    pub fn destination(&self) -> Option<Coordinate> {
        match (self.delivery_latitude, self.delivery_longitude) {
            (Some(lat), Some(lng)) => Some(Coordinate::new(lat, lng)),
            _ => None,
        }
    }
}

/// `{success, data, message, timestamp}` wrapper used by the delivery service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    Backend,
    Computed,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct DistanceEstimate {
    pub kilometers: f64,
    pub source: EstimateSource,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct EtaEstimate {
    pub minutes: u32,
    pub source: EstimateSource,
}

/// Result of one successful position poll.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TrackingUpdate {
    pub delivery_id: i64,
    pub agent: Coordinate,
    pub phase: DeliveryPhase,
    pub distance: Option<DistanceEstimate>,
    pub eta: Option<EtaEstimate>,
    pub fetched_at: DateTime<Utc>,
}
