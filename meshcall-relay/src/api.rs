//! HTTP signaling endpoint
//!
//! - `POST /api/signaling` - join, leave or relay a negotiation message
//! - `GET /api/signaling?callId=&since=` - participants and new messages
//! - `GET /health` - liveness and number of active calls
//!
//! Errors share one body shape, `{success: false, error, code}`.

use crate::auth::IdentityResolver;
use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use meshcall_core::{
    CallId, CallRegistry, CallSnapshot, IdError, ParticipantId, RegistryError, SignalingError,
    SignalingKind,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

/// Path of the signaling endpoint
pub const SIGNALING_PATH: &str = "/api/signaling";

/// Path of the health endpoint
pub const HEALTH_PATH: &str = "/health";

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Call registry
    pub registry: Arc<CallRegistry>,
    /// Caller identification
    pub resolver: Arc<dyn IdentityResolver>,
}

impl AppState {
    /// Create handler state
    pub fn new(registry: Arc<CallRegistry>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { registry, resolver }
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<ParticipantId, ApiError> {
        self.resolver.resolve(headers).ok_or(ApiError::Unauthorized)
    }
}

/// Build the relay router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(SIGNALING_PATH, get(fetch_messages).post(process_message))
        .route(HEALTH_PATH, get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Body of `POST /api/signaling`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingRequest {
    /// Call the message belongs to
    pub call_id: String,
    /// Message type (join, leave, offer, answer, ice-candidate)
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Recipient; absent broadcasts to the other participants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_participant_id: Option<String>,
}

/// Successful response of `POST /api/signaling`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingResponse {
    /// Always `true`
    pub success: bool,
    /// Call the message belongs to
    pub call_id: String,
    /// Message type
    #[serde(rename = "type")]
    pub kind: SignalingKind,
    /// Timestamp assigned to the stored message; absent for no-op joins and leaves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Query of `GET /api/signaling`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchQuery {
    /// Call to read
    pub call_id: String,
    /// Only messages strictly newer than this timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
}

/// Response of `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"`
    pub status: String,
    /// Number of calls in the registry
    pub active_calls: usize,
}

/// Error response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Always `false`
    pub success: bool,
    /// Human-readable message
    pub error: String,
    /// Machine-readable code
    pub code: String,
}

/// Request failures and their HTTP mapping
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Caller could not be identified
    #[error("Unauthorized")]
    Unauthorized,

    /// Malformed request or rejected payload
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Caller is not a participant of the call
    #[error("Participant {participant} is not in call {call_id}")]
    NotInCall {
        /// Call the request targeted
        call_id: String,
        /// Caller
        participant: String,
    },

    /// No such call
    #[error("Call not found: {0}")]
    CallNotFound(String),
}

impl ApiError {
    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidMessageFormat(_) => StatusCode::BAD_REQUEST,
            Self::NotInCall { .. } => StatusCode::FORBIDDEN,
            Self::CallNotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Stable error code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidMessageFormat(_) => "INVALID_MESSAGE_FORMAT",
            Self::NotInCall { .. } => "NOT_IN_CALL",
            Self::CallNotFound(_) => "CALL_NOT_FOUND",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::debug!(%status, code = self.code(), error = %self, "Request rejected");
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CallNotFound(id) => Self::CallNotFound(id),
            RegistryError::InvalidMessageFormat(msg) => Self::InvalidMessageFormat(msg),
            RegistryError::NotInCall {
                call_id,
                participant,
            } => Self::NotInCall {
                call_id,
                participant,
            },
        }
    }
}

impl From<SignalingError> for ApiError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::CallNotFound(id) => Self::CallNotFound(id),
            SignalingError::InvalidMessageFormat(msg) | SignalingError::RelayFailed(msg) => {
                Self::InvalidMessageFormat(msg)
            }
        }
    }
}

impl From<IdError> for ApiError {
    fn from(err: IdError) -> Self {
        Self::InvalidMessageFormat(err.to_string())
    }
}

/// POST /api/signaling
async fn process_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SignalingRequest>, JsonRejection>,
) -> Result<Json<SignalingResponse>, ApiError> {
    let caller = state.authenticate(&headers)?;
    let Json(request) = body.map_err(|e| ApiError::InvalidMessageFormat(e.body_text()))?;

    let call_id = CallId::parse(request.call_id)?;
    let kind: SignalingKind = request.kind.parse()?;
    let target = request
        .target_participant_id
        .map(ParticipantId::parse)
        .transpose()?;

    let timestamp = match kind {
        SignalingKind::Join => state
            .registry
            .join_with(&call_id, &caller, request.data)?
            .map(|d| d.message.timestamp),
        SignalingKind::Leave => state
            .registry
            .leave(&call_id, &caller)
            .map(|d| d.message.timestamp),
        SignalingKind::Offer | SignalingKind::Answer | SignalingKind::IceCandidate => {
            let delivery = state
                .registry
                .relay(&call_id, &caller, kind, target, request.data)?;
            Some(delivery.message.timestamp)
        }
    };

    Ok(Json(SignalingResponse {
        success: true,
        call_id: call_id.into(),
        kind,
        timestamp,
    }))
}

/// GET /api/signaling
async fn fetch_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<FetchQuery>, QueryRejection>,
) -> Result<Json<CallSnapshot>, ApiError> {
    let caller = state.authenticate(&headers)?;
    let Query(query) = query.map_err(|e| ApiError::InvalidMessageFormat(e.body_text()))?;

    let call_id = CallId::parse(query.call_id)?;
    let snapshot = state.registry.fetch_for(&call_id, &caller, query.since)?;
    Ok(Json(snapshot))
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_calls: state.registry.active_calls(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let cases = [
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            (
                ApiError::InvalidMessageFormat("bad".to_string()),
                StatusCode::BAD_REQUEST,
                "INVALID_MESSAGE_FORMAT",
            ),
            (
                RegistryError::NotInCall {
                    call_id: "abc".to_string(),
                    participant: "eve".to_string(),
                }
                .into(),
                StatusCode::FORBIDDEN,
                "NOT_IN_CALL",
            ),
            (
                RegistryError::CallNotFound("abc".to_string()).into(),
                StatusCode::NOT_FOUND,
                "CALL_NOT_FOUND",
            ),
        ];
        for (error, status, code) in cases {
            assert_eq!(error.status(), status);
            assert_eq!(error.code(), code);
        }
    }

    #[test]
    fn test_request_wire_format() {
        let request: SignalingRequest = serde_json::from_str(
            r#"{"callId":"abc","type":"ice-candidate","data":{"candidate":"c"},"targetParticipantId":"bob"}"#,
        )
        .unwrap();
        assert_eq!(request.kind, "ice-candidate");
        assert_eq!(request.target_participant_id.as_deref(), Some("bob"));

        let response = SignalingResponse {
            success: true,
            call_id: "abc".to_string(),
            kind: SignalingKind::Offer,
            timestamp: None,
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"success": true, "callId": "abc", "type": "offer"})
        );
    }
}
