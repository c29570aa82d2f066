//! Token exchange clients

use std::error;

use async_trait::async_trait;
use reqwest::Url;

use crate::{AccessToken, ApiKey, ApiKeyRef};

pub mod iam;

pub use iam::dto::TokenResponse;
pub use iam::{IamClientConfig, IamRequestError, IamTokenClient};

/// The credentials and endpoint a single exchange is performed with
///
/// Authenticators take one snapshot of their settings per token request so that
/// a concurrent credential rotation never pairs a new key with an old endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeRequest {
    api_key: ApiKey,
    endpoint: Option<Url>,
}

impl ExchangeRequest {
    /// Constructs a new exchange request
    ///
    /// When `endpoint` is `None`, the client's configured default is used.
    pub fn new(api_key: ApiKey, endpoint: Option<Url>) -> Self {
        Self { api_key, endpoint }
    }

    /// The API key to trade for a token
    #[inline]
    pub fn api_key(&self) -> &ApiKeyRef {
        &self.api_key
    }

    /// The endpoint override, if any
    #[inline]
    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }
}

/// A client that trades an API key for an access token
///
/// Both operations may be called concurrently from multiple tasks.
#[async_trait]
pub trait TokenExchangeClient: Send + Sync {
    /// The error type returned in the event that an exchange fails
    type Error: error::Error + Send + Sync + 'static;

    /// Returns the client's current token for `request`
    ///
    /// A client may answer from its own cache without a network round trip, but
    /// it is free to perform an exchange when it holds nothing usable.
    async fn cached_token(&self, request: &ExchangeRequest) -> Result<AccessToken, Self::Error>;

    /// Performs a token exchange against the authority
    ///
    /// Returns `Ok(None)` when the authority answered successfully but the
    /// response contained no token.
    async fn request_token(
        &self,
        request: &ExchangeRequest,
    ) -> Result<Option<TokenResponse>, Self::Error>;
}
