use std::fmt;

use crate::services::location_tracking::SensorError;
use crate::services::stomp::FrameError;

/// Main error type for the sparrow-tracking client
#[derive(Debug)]
pub enum SparrowError {
    // Backend (REST collaborator) errors
    NotFound(String),
    BackendRejection { status: u16, message: String },

    // Network and HTTP client errors
    NetworkTimeout,
    NetworkConnection(String),
    HttpClient(String),
    InvalidUrl(String),

    // Serialization and parsing errors
    JsonParsing(String),
    JsonSerialization(String),
    MalformedPayload(String),

    // Push channel errors
    ChannelConnect(String),
    WebSocketConnection(String),
    WebSocketMessage(String),
    ChannelClosed,
    NotConnected,
    ConnectionSuperseded,

    // Device location errors
    CapabilityUnavailable,
    PermissionDenied(String),
    LocationTimeout,
    PositionUnavailable(String),
    AlreadyTracking(i64),

    // Configuration errors
    InvalidConfiguration(String),
    InvalidFieldValue { field: String, value: String, reason: String },
}

impl fmt::Display for SparrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SparrowError::NotFound(msg) => write!(f, "Not found: {}", msg),
            SparrowError::BackendRejection { status, message } => {
                write!(f, "Backend rejected request ({}): {}", status, message)
            }

            SparrowError::NetworkTimeout => write!(f, "Network request timed out"),
            SparrowError::NetworkConnection(msg) => write!(f, "Network connection error: {}", msg),
            SparrowError::HttpClient(msg) => write!(f, "HTTP client error: {}", msg),
            SparrowError::InvalidUrl(msg) => write!(f, "Invalid URL: {}", msg),

            SparrowError::JsonParsing(msg) => write!(f, "JSON parsing error: {}", msg),
            SparrowError::JsonSerialization(msg) => write!(f, "JSON serialization error: {}", msg),
            SparrowError::MalformedPayload(msg) => write!(f, "Malformed push payload: {}", msg),

            SparrowError::ChannelConnect(msg) => write!(f, "Push channel connect failed: {}", msg),
            SparrowError::WebSocketConnection(msg) => write!(f, "WebSocket connection error: {}", msg),
            SparrowError::WebSocketMessage(msg) => write!(f, "WebSocket message error: {}", msg),
            SparrowError::ChannelClosed => write!(f, "Communication channel closed"),
            SparrowError::NotConnected => write!(f, "Push channel is not connected"),
            SparrowError::ConnectionSuperseded => {
                write!(f, "Connect attempt was superseded by a disconnect")
            }

            SparrowError::CapabilityUnavailable => {
                write!(f, "Geolocation is not supported on this platform")
            }
            SparrowError::PermissionDenied(msg) => write!(f, "Location permission denied: {}", msg),
            SparrowError::LocationTimeout => write!(f, "Timed out waiting for a position fix"),
            SparrowError::PositionUnavailable(msg) => write!(f, "Position unavailable: {}", msg),
            SparrowError::AlreadyTracking(id) => {
                write!(f, "Location tracking already active for delivery {}", id)
            }

            SparrowError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            SparrowError::InvalidFieldValue { field, value, reason } => {
                write!(f, "Invalid value '{}' for field '{}': {}", value, field, reason)
            }
        }
    }
}

impl std::error::Error for SparrowError {}

// Convenience type alias for Results
pub type SparrowResult<T> = Result<T, SparrowError>;

impl From<reqwest::Error> for SparrowError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SparrowError::NetworkTimeout
        } else if err.is_connect() {
            SparrowError::NetworkConnection(err.to_string())
        } else if err.is_decode() {
            SparrowError::JsonParsing(err.to_string())
        } else if let Some(status) = err.status() {
            SparrowError::BackendRejection {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SparrowError::HttpClient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SparrowError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            SparrowError::JsonParsing(err.to_string())
        } else {
            SparrowError::JsonSerialization(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SparrowError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SparrowError::ChannelClosed,
            WsError::Url(e) => SparrowError::InvalidUrl(e.to_string()),
            WsError::Io(e) => SparrowError::WebSocketConnection(e.to_string()),
            other => SparrowError::WebSocketMessage(other.to_string()),
        }
    }
}

impl From<SensorError> for SparrowError {
    fn from(err: SensorError) -> Self {
        match err {
            SensorError::PermissionDenied(msg) => SparrowError::PermissionDenied(msg),
            SensorError::PositionUnavailable(msg) => SparrowError::PositionUnavailable(msg),
            SensorError::Timeout => SparrowError::LocationTimeout,
            SensorError::Unsupported => SparrowError::CapabilityUnavailable,
        }
    }
}

impl From<FrameError> for SparrowError {
    fn from(err: FrameError) -> Self {
        SparrowError::WebSocketMessage(err.to_string())
    }
}

// Helper functions for creating common errors
impl SparrowError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        SparrowError::NotFound(resource.into())
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        SparrowError::BackendRejection {
            status,
            message: message.into(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        SparrowError::MalformedPayload(msg.into())
    }

    pub fn invalid_field(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        SparrowError::InvalidFieldValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Failures that the next natural cycle (poll tick, sample, reconnect) may clear.
    pub fn is_transient(&self) -> bool {
        match self {
            SparrowError::NetworkTimeout
            | SparrowError::NetworkConnection(_)
            | SparrowError::HttpClient(_)
            | SparrowError::ChannelClosed
            | SparrowError::ChannelConnect(_)
            | SparrowError::WebSocketConnection(_) => true,
            SparrowError::BackendRejection { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
