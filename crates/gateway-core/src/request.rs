//! Request type accepted by the gateway.
//!
//! A [`StreamRequest`] is what the transport layer hands to the orchestrator.
//! It is also the payload carried through the failover queue, so it must stay
//! serializable and self-contained.

use crate::error::{GatewayError, GatewayResult};
use crate::types::{IdentityTier, RequestId};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Maximum accepted query length in bytes
pub const MAX_QUERY_LEN: u64 = 100_000;

/// A single streaming completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StreamRequest {
    /// Unique request identifier
    #[serde(default = "RequestId::generate")]
    pub id: RequestId,

    /// Caller identity (API key, user id or client address)
    #[validate(length(min = 1, max = 256))]
    pub identity: String,

    /// Identity space the caller is rate limited in
    #[serde(default)]
    pub tier: IdentityTier,

    /// Prompt text
    #[validate(length(min = 1, max = 100000))]
    pub query: String,

    /// Target model
    #[validate(length(min = 1, max = 128))]
    pub model: String,

    /// Sampling temperature (0.0 - 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub max_tokens: Option<u32>,

    /// Caller supplied id used to correlate logs across services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Whether the response may be served from and written to the cache
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
}

fn default_cacheable() -> bool {
    true
}

impl StreamRequest {
    /// Create a new builder for `StreamRequest`
    #[must_use]
    pub fn builder() -> StreamRequestBuilder {
        StreamRequestBuilder::default()
    }

    /// Validate the entire request
    ///
    /// # Errors
    /// Returns a validation error naming the first offending field
    pub fn validate_request(&self) -> GatewayResult<()> {
        self.validate()?;

        if self.query.trim().is_empty() {
            return Err(GatewayError::validation(
                "query cannot be blank",
                Some("query".to_string()),
                "empty_query",
            ));
        }

        if self.identity.trim().is_empty() {
            return Err(GatewayError::validation(
                "identity cannot be blank",
                Some("identity".to_string()),
                "empty_identity",
            ));
        }

        if self.model.chars().any(char::is_whitespace) {
            return Err(GatewayError::validation(
                format!("model '{}' must not contain whitespace", self.model),
                Some("model".to_string()),
                "invalid_model",
            ));
        }

        Ok(())
    }

    /// Query with surrounding whitespace trimmed and inner runs collapsed
    #[must_use]
    pub fn normalized_query(&self) -> String {
        self.query.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Model name as used for routing and caching
    #[must_use]
    pub fn normalized_model(&self) -> String {
        self.model.trim().to_ascii_lowercase()
    }

    /// Ordered, normalized fields that determine the response.
    ///
    /// Identity and ids are not part of it: identical questions from
    /// different callers share one cache entry.
    #[must_use]
    pub fn cache_key_parts(&self) -> Vec<String> {
        vec![
            self.normalized_query(),
            self.normalized_model(),
            self.temperature
                .map_or_else(|| "-".to_string(), |t| format!("{t:.3}")),
            self.max_tokens
                .map_or_else(|| "-".to_string(), |m| m.to_string()),
        ]
    }
}

/// Builder for `StreamRequest`
#[derive(Debug, Default)]
pub struct StreamRequestBuilder {
    id: Option<RequestId>,
    identity: Option<String>,
    tier: IdentityTier,
    query: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    correlation_id: Option<String>,
    cacheable: Option<bool>,
}

impl StreamRequestBuilder {
    /// Set the request ID
    #[must_use]
    pub fn id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the caller identity
    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Set the identity tier
    #[must_use]
    pub fn tier(mut self, tier: IdentityTier) -> Self {
        self.tier = tier;
        self
    }

    /// Set the query text
    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Set the model
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the temperature
    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the correlation id
    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Allow or forbid caching for this request
    #[must_use]
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = Some(cacheable);
        self
    }

    /// Build the request
    ///
    /// # Errors
    /// Returns error if identity, query or model are missing
    pub fn build(self) -> GatewayResult<StreamRequest> {
        let identity = self.identity.ok_or_else(|| {
            GatewayError::validation("identity is required", Some("identity".to_string()), "missing_identity")
        })?;
        let query = self.query.ok_or_else(|| {
            GatewayError::validation("query is required", Some("query".to_string()), "missing_query")
        })?;
        let model = self.model.ok_or_else(|| {
            GatewayError::validation("model is required", Some("model".to_string()), "missing_model")
        })?;

        Ok(StreamRequest {
            id: self.id.unwrap_or_else(RequestId::generate),
            identity,
            tier: self.tier,
            query,
            model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            correlation_id: self.correlation_id,
            cacheable: self.cacheable.unwrap_or(true),
        })
    }
}
