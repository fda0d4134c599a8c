use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::ride::{ActorRole, RideStatus};

/// Main error type for the dispatch service
#[derive(Debug)]
pub enum DispatchError {
    // Validation errors
    ValidationFailed(Vec<ValidationError>),
    MissingRequiredField(String),
    InvalidFieldValue { field: String, value: String, reason: String },

    // Lookup errors
    RideNotFound(String),
    UserNotFound(String),

    // Lifecycle errors
    Forbidden { actor: ActorRole, reason: String },
    InvalidTransition { from: RideStatus, action: String },
    PreconditionFailed(String),
    Conflict(String),
    ActiveRideExists { party: ActorRole, user_id: String, ride_id: Option<String> },

    // Routing and geocoding provider errors
    RouteNotFound(String),
    ProviderRateLimited,
    ProviderRejected(String),
    ProviderUnavailable(String),
    InvalidPolyline(String),

    // Store errors
    RedisConnection(String),
    RedisQuery(String),

    // Serialization and parsing errors
    JsonParsing(String),
    JsonSerialization(String),
    InvalidFormat(String),

    // Configuration and setup errors
    InvalidConfiguration(String),

    InternalServer(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::ValidationFailed(errors) => {
                let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
                write!(f, "Validation failed for: {}", fields.join(", "))
            }
            DispatchError::MissingRequiredField(field) => write!(f, "Missing required field: {}", field),
            DispatchError::InvalidFieldValue { field, value, reason } => {
                write!(f, "Invalid value '{}' for field '{}': {}", value, field, reason)
            }

            DispatchError::RideNotFound(id) => write!(f, "Ride not found: {}", id),
            DispatchError::UserNotFound(id) => write!(f, "User not found: {}", id),

            DispatchError::Forbidden { actor, reason } => write!(f, "Not allowed for {}: {}", actor, reason),
            DispatchError::InvalidTransition { from, action } => {
                write!(f, "Cannot {} a ride that is {}", action, from)
            }
            DispatchError::PreconditionFailed(msg) => write!(f, "Precondition failed: {}", msg),
            DispatchError::Conflict(msg) => write!(f, "Ride was changed by someone else: {}", msg),
            DispatchError::ActiveRideExists { party, user_id, ride_id } => match ride_id {
                Some(ride_id) => write!(f, "The {} {} already has an active ride: {}", party, user_id, ride_id),
                None => write!(f, "The {} {} already has an active ride", party, user_id),
            },

            DispatchError::RouteNotFound(msg) => write!(f, "No driving route found: {}", msg),
            DispatchError::ProviderRateLimited => write!(f, "Routing provider rate limit reached"),
            DispatchError::ProviderRejected(msg) => write!(f, "Routing provider rejected the request: {}", msg),
            DispatchError::ProviderUnavailable(msg) => write!(f, "Routing provider unavailable: {}", msg),
            DispatchError::InvalidPolyline(msg) => write!(f, "Invalid encoded polyline: {}", msg),

            DispatchError::RedisConnection(msg) => write!(f, "Redis connection error: {}", msg),
            DispatchError::RedisQuery(msg) => write!(f, "Redis query error: {}", msg),

            DispatchError::JsonParsing(msg) => write!(f, "JSON parsing error: {}", msg),
            DispatchError::JsonSerialization(msg) => write!(f, "JSON serialization error: {}", msg),
            DispatchError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),

            DispatchError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),

            DispatchError::InternalServer(msg) => write!(f, "Internal server error: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

impl DispatchError {
    /// Stable machine-readable code, one per variant.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::ValidationFailed(_) => "validation_failed",
            DispatchError::MissingRequiredField(_) => "missing_field",
            DispatchError::InvalidFieldValue { .. } => "invalid_field",
            DispatchError::RideNotFound(_) => "ride_not_found",
            DispatchError::UserNotFound(_) => "user_not_found",
            DispatchError::Forbidden { .. } => "forbidden",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::PreconditionFailed(_) => "precondition_failed",
            DispatchError::Conflict(_) => "conflict",
            DispatchError::ActiveRideExists { .. } => "active_ride_exists",
            DispatchError::RouteNotFound(_) => "route_not_found",
            DispatchError::ProviderRateLimited => "provider_rate_limited",
            DispatchError::ProviderRejected(_) => "provider_rejected",
            DispatchError::ProviderUnavailable(_) => "provider_unavailable",
            DispatchError::InvalidPolyline(_) => "invalid_polyline",
            DispatchError::RedisConnection(_) => "store_connection",
            DispatchError::RedisQuery(_) => "store_query",
            DispatchError::JsonParsing(_) => "json_parsing",
            DispatchError::JsonSerialization(_) => "json_serialization",
            DispatchError::InvalidFormat(_) => "invalid_format",
            DispatchError::InvalidConfiguration(_) => "invalid_configuration",
            DispatchError::InternalServer(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::ValidationFailed(_)
            | DispatchError::MissingRequiredField(_)
            | DispatchError::InvalidFieldValue { .. }
            | DispatchError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            DispatchError::RideNotFound(_) | DispatchError::UserNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::Forbidden { .. } => StatusCode::FORBIDDEN,
            DispatchError::InvalidTransition { .. }
            | DispatchError::Conflict(_)
            | DispatchError::ActiveRideExists { .. } => StatusCode::CONFLICT,
            DispatchError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            DispatchError::RouteNotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::ProviderRateLimited => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::ProviderRejected(_)
            | DispatchError::ProviderUnavailable(_)
            | DispatchError::InvalidPolyline(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Provider failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ProviderRateLimited | DispatchError::ProviderUnavailable(_)
        )
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let details = match &self {
            DispatchError::ValidationFailed(errors) => serde_json::to_value(errors).ok(),
            DispatchError::InvalidTransition { from, action } => {
                Some(serde_json::json!({ "status": from, "action": action }))
            }
            DispatchError::ActiveRideExists { ride_id: Some(ride_id), .. } => {
                Some(serde_json::json!({ "rideId": ride_id }))
            }
            _ => None,
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let error_response = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
            details,
        };

        (status, axum::Json(error_response)).into_response()
    }
}

// Convenience type alias for Results
pub type DispatchResult<T> = Result<T, DispatchError>;

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::IoError => DispatchError::RedisConnection(err.to_string()),
            redis::ErrorKind::ResponseError => DispatchError::RedisQuery(err.to_string()),
            redis::ErrorKind::AuthenticationFailed => {
                DispatchError::RedisConnection("Authentication failed".to_string())
            }
            _ => DispatchError::RedisQuery(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::ProviderUnavailable("request timed out".to_string())
        } else if err.is_decode() {
            DispatchError::ProviderRejected(format!("unreadable response: {}", err))
        } else {
            DispatchError::ProviderUnavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            DispatchError::JsonParsing(err.to_string())
        } else {
            DispatchError::JsonSerialization(err.to_string())
        }
    }
}

// Helper functions for creating common errors
impl DispatchError {
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        DispatchError::ValidationFailed(vec![ValidationError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn ride_not_found(ride_id: impl Into<String>) -> Self {
        DispatchError::RideNotFound(ride_id.into())
    }

    pub fn forbidden(actor: ActorRole, reason: impl Into<String>) -> Self {
        DispatchError::Forbidden {
            actor,
            reason: reason.into(),
        }
    }

    pub fn invalid_transition(from: RideStatus, action: impl Into<String>) -> Self {
        DispatchError::InvalidTransition {
            from,
            action: action.into(),
        }
    }

    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        DispatchError::PreconditionFailed(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        DispatchError::Conflict(msg.into())
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        DispatchError::InternalServer(msg.into())
    }
}
