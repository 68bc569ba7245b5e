//! Caller identification
//!
//! The relay never decides who a caller is by itself. Every request goes
//! through an [`IdentityResolver`] first; requests it cannot attribute to a
//! participant are rejected before they reach the registry.

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderName};
use meshcall_core::{IdError, ParticipantId};
use std::collections::HashMap;
use thiserror::Error;

/// Header carrying the participant id behind a trusted gateway
pub const PARTICIPANT_HEADER: &str = "x-participant-id";

/// Errors parsing identity configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Token spec is not `participant=secret`
    #[error("Invalid token spec '{0}', expected <participant>=<secret>")]
    InvalidTokenSpec(String),

    /// Participant part of a token spec is not a valid id
    #[error(transparent)]
    InvalidParticipant(#[from] IdError),
}

/// Maps an incoming request to the participant making it
pub trait IdentityResolver: Send + Sync {
    /// Participant behind the request, `None` if it cannot be identified
    fn resolve(&self, headers: &HeaderMap) -> Option<ParticipantId>;
}

/// Static bearer tokens, one per participant
#[derive(Debug, Clone, Default)]
pub struct BearerTokenResolver {
    tokens: HashMap<String, ParticipantId>,
}

impl BearerTokenResolver {
    /// Create an empty resolver
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` as identifying `participant`
    #[must_use]
    pub fn with_token(mut self, participant: ParticipantId, token: impl Into<String>) -> Self {
        self.insert(participant, token);
        self
    }

    /// Register `token` as identifying `participant`
    pub fn insert(&mut self, participant: ParticipantId, token: impl Into<String>) {
        self.tokens.insert(token.into(), participant);
    }

    /// Number of registered tokens
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl FromIterator<(ParticipantId, String)> for BearerTokenResolver {
    fn from_iter<I: IntoIterator<Item = (ParticipantId, String)>>(iter: I) -> Self {
        let mut resolver = Self::new();
        for (participant, token) in iter {
            resolver.insert(participant, token);
        }
        resolver
    }
}

impl IdentityResolver for BearerTokenResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<ParticipantId> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let token = value.strip_prefix("Bearer ")?.trim();
        self.tokens.get(token).cloned()
    }
}

/// Trusts a header set by an authenticating gateway in front of the relay
#[derive(Debug, Clone)]
pub struct TrustedHeaderResolver {
    header: HeaderName,
}

impl TrustedHeaderResolver {
    /// Read the participant id from `header`
    #[must_use]
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Default for TrustedHeaderResolver {
    fn default() -> Self {
        Self::new(HeaderName::from_static(PARTICIPANT_HEADER))
    }
}

impl IdentityResolver for TrustedHeaderResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<ParticipantId> {
        let value = headers.get(&self.header)?.to_str().ok()?;
        ParticipantId::parse(value.trim()).ok()
    }
}

/// Parse a `participant=secret` token spec
///
/// # Errors
///
/// Returns error if the spec has no `=`, an empty secret or an invalid participant
pub fn parse_token_spec(spec: &str) -> Result<(ParticipantId, String), AuthError> {
    let (participant, secret) = spec
        .split_once('=')
        .ok_or_else(|| AuthError::InvalidTokenSpec(spec.to_string()))?;
    if secret.is_empty() {
        return Err(AuthError::InvalidTokenSpec(spec.to_string()));
    }
    Ok((ParticipantId::parse(participant)?, secret.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_lookup() {
        let alice = ParticipantId::parse("alice").unwrap();
        let resolver = BearerTokenResolver::new().with_token(alice.clone(), "s3cret");

        assert_eq!(
            resolver.resolve(&headers("authorization", "Bearer s3cret")),
            Some(alice)
        );
        assert_eq!(resolver.resolve(&headers("authorization", "Bearer nope")), None);
        assert_eq!(resolver.resolve(&headers("authorization", "Basic s3cret")), None);
        assert_eq!(resolver.resolve(&HeaderMap::new()), None);
    }

    #[test]
    fn test_trusted_header() {
        let resolver = TrustedHeaderResolver::default();
        assert_eq!(
            resolver.resolve(&headers(PARTICIPANT_HEADER, "bob")),
            Some(ParticipantId::parse("bob").unwrap())
        );
        assert_eq!(resolver.resolve(&headers(PARTICIPANT_HEADER, "  ")), None);
        assert_eq!(resolver.resolve(&HeaderMap::new()), None);
    }

    #[test]
    fn test_parse_token_spec() {
        let (participant, secret) = parse_token_spec("alice=a=b").unwrap();
        assert_eq!(participant.as_str(), "alice");
        assert_eq!(secret, "a=b");

        assert!(matches!(
            parse_token_spec("alice"),
            Err(AuthError::InvalidTokenSpec(_))
        ));
        assert!(matches!(
            parse_token_spec("alice="),
            Err(AuthError::InvalidTokenSpec(_))
        ));
        assert!(matches!(
            parse_token_spec("=secret"),
            Err(AuthError::InvalidParticipant(_))
        ));
    }
}
