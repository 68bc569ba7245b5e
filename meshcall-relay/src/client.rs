//! HTTP signaling client
//!
//! [`HttpSignalingChannel`] lets a [`CallController`] talk to a remote relay
//! through the endpoint in [`crate::api`].
//!
//! [`CallController`]: meshcall_core::CallController

use crate::api::{ErrorBody, FetchQuery, SignalingRequest, SignalingResponse, SIGNALING_PATH};
use crate::auth::PARTICIPANT_HEADER;
use async_trait::async_trait;
use meshcall_core::signaling::join_payload;
use meshcall_core::{
    CallId, CallSnapshot, OutboundSignal, ParticipantId, SignalingChannel, SignalingError,
    SignalingKind,
};
use reqwest::StatusCode;
use std::time::Duration;

/// Request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How the client proves who it is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAuth {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// Participant id in the trusted gateway header
    TrustedHeader,
}

/// [`SignalingChannel`] over the relay's HTTP endpoint
pub struct HttpSignalingChannel {
    base_url: String,
    participant: ParticipantId,
    auth: ClientAuth,
    client: reqwest::Client,
}

impl HttpSignalingChannel {
    /// Create a channel for `participant` against the relay at `base_url`
    ///
    /// # Errors
    ///
    /// Returns `RelayFailed` if the URL is not http(s) or the client cannot be built
    pub fn new(
        base_url: impl Into<String>,
        participant: ParticipantId,
        auth: ClientAuth,
    ) -> Result<Self, SignalingError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(SignalingError::RelayFailed(format!(
                "relay URL must start with http:// or https://, got: {base_url}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SignalingError::RelayFailed(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            participant,
            auth,
            client,
        })
    }

    fn url(&self) -> String {
        format!("{}{SIGNALING_PATH}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            ClientAuth::Bearer(token) => request.bearer_auth(token),
            ClientAuth::TrustedHeader => request.header(PARTICIPANT_HEADER, self.participant.as_str()),
        }
    }

    async fn post(&self, request: &SignalingRequest) -> Result<SignalingResponse, SignalingError> {
        let response = self
            .authorize(self.client.post(self.url()).json(request))
            .send()
            .await
            .map_err(|e| SignalingError::RelayFailed(format!("HTTP request failed: {e}")))?;
        decode(response, &request.call_id).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    call_id: &str,
) -> Result<T, SignalingError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| SignalingError::RelayFailed(format!("invalid relay response: {e}")));
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    tracing::debug!(%status, call_id, error = %message, "Relay rejected request");
    Err(match status {
        StatusCode::NOT_FOUND => SignalingError::CallNotFound(call_id.to_string()),
        StatusCode::BAD_REQUEST => SignalingError::InvalidMessageFormat(message),
        _ => SignalingError::RelayFailed(format!("HTTP {}: {message}", status.as_u16())),
    })
}

#[async_trait]
impl SignalingChannel for HttpSignalingChannel {
    fn local_participant(&self) -> &ParticipantId {
        &self.participant
    }

    async fn join(
        &self,
        call_id: &CallId,
        display_name: Option<&str>,
    ) -> Result<Option<i64>, SignalingError> {
        let response = self
            .post(&SignalingRequest {
                call_id: call_id.to_string(),
                kind: SignalingKind::Join.as_str().to_string(),
                data: join_payload(display_name),
                target_participant_id: None,
            })
            .await?;
        Ok(response.timestamp)
    }

    async fn leave(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.post(&SignalingRequest {
            call_id: call_id.to_string(),
            kind: SignalingKind::Leave.as_str().to_string(),
            data: None,
            target_participant_id: None,
        })
        .await?;
        Ok(())
    }

    async fn send(&self, call_id: &CallId, signal: OutboundSignal) -> Result<(), SignalingError> {
        self.post(&SignalingRequest {
            call_id: call_id.to_string(),
            kind: signal.kind.as_str().to_string(),
            data: signal.payload,
            target_participant_id: signal.to.map(String::from),
        })
        .await?;
        Ok(())
    }

    async fn fetch(&self, call_id: &CallId, since: Option<i64>) -> Result<CallSnapshot, SignalingError> {
        let query = FetchQuery {
            call_id: call_id.to_string(),
            since,
        };
        let response = self
            .authorize(self.client.get(self.url()).query(&query))
            .send()
            .await
            .map_err(|e| SignalingError::RelayFailed(format!("HTTP request failed: {e}")))?;
        decode(response, call_id.as_str()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_url() {
        let alice = ParticipantId::parse("alice").unwrap();
        let result = HttpSignalingChannel::new("ftp://relay", alice.clone(), ClientAuth::TrustedHeader);
        assert!(matches!(result, Err(SignalingError::RelayFailed(_))));

        let channel =
            HttpSignalingChannel::new("http://relay:8080/", alice, ClientAuth::TrustedHeader).unwrap();
        assert_eq!(channel.url(), "http://relay:8080/api/signaling");
    }
}
