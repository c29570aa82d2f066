//! A token exchange client for the IAM API key grant

use std::error;

use aliri_clock::{Clock, System};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT},
    Url,
};
use thiserror::Error;
use tokio::sync::Mutex;

use super::{ExchangeRequest, TokenExchangeClient};
use crate::tokens::{IssuedToken, TokenLifetimeConfig, TokenStatus};
use crate::{AccessToken, ClientId, ClientIdRef, ClientSecret, ClientSecretRef, Scope};

pub mod dto;

use dto::TokenResponse;

/// The public IAM endpoint used when no other endpoint is configured
pub const DEFAULT_IAM_ENDPOINT: &str = "https://iam.cloud.ibm.com";

static DEFAULT_ENDPOINT: Lazy<Url> =
    Lazy::new(|| Url::parse(DEFAULT_IAM_ENDPOINT).expect("default IAM endpoint is a valid URL"));

/// Configuration for an [`IamTokenClient`]
#[derive(Clone, Debug)]
pub struct IamClientConfig<C = System> {
    endpoint: Url,
    client_credentials: Option<(ClientId, ClientSecret)>,
    scope: Option<Scope>,
    headers: HeaderMap,
    lifetime_config: TokenLifetimeConfig<C>,
}

impl Default for IamClientConfig {
    /// Default client configuration
    ///
    /// Uses the public IAM endpoint, no client credentials, no scope, and the
    /// default [`TokenLifetimeConfig`].
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.clone(),
            client_credentials: None,
            scope: None,
            headers: HeaderMap::new(),
            lifetime_config: TokenLifetimeConfig::default(),
        }
    }
}

impl IamClientConfig {
    /// Constructs the default client configuration
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C> IamClientConfig<C> {
    /// Sets the endpoint used when an exchange request does not override it
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Authenticates token requests with HTTP basic auth
    pub fn with_client_credentials(mut self, client_id: ClientId, client_secret: ClientSecret) -> Self {
        self.client_credentials = Some((client_id, client_secret));
        self
    }

    /// Requests tokens for a specific scope
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Adds a header sent with every token request
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets how the client decides that its cached token needs refreshing
    pub fn with_lifetime_config<D>(self, lifetime_config: TokenLifetimeConfig<D>) -> IamClientConfig<D> {
        IamClientConfig {
            endpoint: self.endpoint,
            client_credentials: self.client_credentials,
            scope: self.scope,
            headers: self.headers,
            lifetime_config,
        }
    }

    /// The default endpoint
    #[inline]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// A token exchange client speaking the IAM API key grant
///
/// The client holds the most recently issued token in memory, tagged with the
/// key and endpoint it was issued for. [`cached_token()`][TokenExchangeClient::cached_token]
/// answers from that token while it is fresh, refreshes it once it goes stale,
/// and keeps handing out a stale-but-unexpired token if the refresh fails.
#[derive(Debug)]
pub struct IamTokenClient<C = System> {
    client: reqwest::Client,
    config: IamClientConfig<C>,
    current: Mutex<Option<IssuedToken>>,
}

impl Default for IamTokenClient {
    fn default() -> Self {
        Self::new(reqwest::Client::new(), IamClientConfig::default())
    }
}

impl<C> IamTokenClient<C> {
    /// Constructs a new client
    ///
    /// Request timeouts are those configured on `client`.
    pub fn new(client: reqwest::Client, config: IamClientConfig<C>) -> Self {
        Self {
            client,
            config,
            current: Mutex::new(None),
        }
    }

    fn endpoint<'a>(&'a self, request: &'a ExchangeRequest) -> &'a Url {
        request.endpoint().unwrap_or(&self.config.endpoint)
    }

    async fn fetch(
        &self,
        request: &ExchangeRequest,
        endpoint: &Url,
    ) -> Result<Option<TokenResponse>, IamRequestError> {
        let grant = dto::ApiKeyGrant {
            api_key: request.api_key(),
            scope: self.config.scope.as_deref(),
        };
        let basic_auth = self
            .config
            .client_credentials
            .as_ref()
            .map(|(id, secret)| (&**id, &**secret));

        request_token(
            &self.client,
            token_endpoint(endpoint)?,
            &self.config.headers,
            basic_auth,
            &grant,
        )
        .await
    }
}

impl<C: Clock> IamTokenClient<C> {
    fn issue(&self, request: &ExchangeRequest, endpoint: &Url, resp: TokenResponse) -> IssuedToken {
        self.config.lifetime_config.create_token(
            resp.access_token,
            request.api_key().to_owned(),
            endpoint.clone(),
            resp.expiration,
            resp.expires_in,
        )
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenExchangeClient for IamTokenClient<C> {
    type Error = IamRequestError;

    async fn cached_token(&self, request: &ExchangeRequest) -> Result<AccessToken, Self::Error> {
        let endpoint = self.endpoint(request);
        let mut current = self.current.lock().await;
        let now = self.config.lifetime_config.now();

        let usable = current
            .as_ref()
            .filter(|t| t.issued_for(request.api_key(), endpoint))
            .and_then(|t| match t.token_status_at(now) {
                TokenStatus::Expired => None,
                status => Some((
                    status,
                    t.access_token().to_owned(),
                    t.issued(),
                    t.stale(),
                    t.expiry(),
                )),
            });

        match usable {
            Some((TokenStatus::Fresh, token, _, stale, _)) => {
                tracing::trace!(stale = stale.0, "reusing fresh cached token");
                Ok(token)
            }
            Some((_, token, issued, stale, expiry)) => {
                tracing::debug!(
                    issued = issued.0,
                    stale = stale.0,
                    expiry = expiry.0,
                    "cached token is stale, refreshing"
                );
                match self.fetch(request, endpoint).await {
                    Ok(Some(resp)) => {
                        let refreshed = resp.access_token.clone();
                        *current = Some(self.issue(request, endpoint, resp));
                        Ok(refreshed)
                    }
                    Ok(None) => {
                        tracing::warn!(
                            expiry = expiry.0,
                            "refresh returned no token, keeping stale token until it expires"
                        );
                        Ok(token)
                    }
                    Err(error) => {
                        tracing::warn!(
                            expiry = expiry.0,
                            error = (&error as &dyn error::Error),
                            "unable to refresh stale token, keeping it until it expires"
                        );
                        Ok(token)
                    }
                }
            }
            None => {
                tracing::debug!("no usable cached token, requesting a new one");
                let resp = self
                    .fetch(request, endpoint)
                    .await?
                    .ok_or(IamRequestError::EmptyResponse)?;
                let token = resp.access_token.clone();
                *current = Some(self.issue(request, endpoint, resp));
                Ok(token)
            }
        }
    }

    async fn request_token(
        &self,
        request: &ExchangeRequest,
    ) -> Result<Option<TokenResponse>, Self::Error> {
        let endpoint = self.endpoint(request);
        let resp = self.fetch(request, endpoint).await?;

        if let Some(resp) = &resp {
            let issued = self.issue(request, endpoint, resp.clone());
            *self.current.lock().await = Some(issued);
        }

        Ok(resp)
    }
}

/// An error while attempting to request a new token from IAM
#[derive(Debug, Error)]
pub enum IamRequestError {
    /// An error from IAM with an error body
    #[error("error requesting token from iam: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from iam")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send a token request to IAM
    #[error("error sending request to iam")]
    RequestSend(#[source] reqwest::Error),
    /// The configured endpoint cannot have a path appended to it
    #[error("iam endpoint `{0}` cannot be used as a base url")]
    InvalidEndpoint(Url),
    /// IAM answered successfully but no token was present
    #[error("iam returned an empty token response")]
    EmptyResponse,
}

fn maybe_value<'a, T: tracing::Value + 'a>(v: &'a Option<T>) -> &'a dyn tracing::Value {
    if let Some(v) = v {
        v
    } else {
        &tracing::field::Empty
    }
}

fn token_endpoint(base: &Url) -> Result<Url, IamRequestError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| IamRequestError::InvalidEndpoint(base.clone()))?
        .pop_if_empty()
        .extend(&["identity", "token"]);
    Ok(url)
}

#[tracing::instrument(
    err,
    skip(client, token_url, headers, basic_auth, grant),
    fields(
        token_url = %token_url,
        client_id = maybe_value(&basic_auth.map(|(id, _)| id.as_str())),
        scope = maybe_value(&grant.scope.map(|s| s.as_str())),
    ),
)]
async fn request_token(
    client: &reqwest::Client,
    token_url: Url,
    headers: &HeaderMap,
    basic_auth: Option<(&ClientIdRef, &ClientSecretRef)>,
    grant: &dto::ApiKeyGrant<'_>,
) -> Result<Option<TokenResponse>, IamRequestError> {
    tracing::trace!("requesting token from iam");

    let mut req = client
        .post(token_url)
        .header(ACCEPT, "application/json")
        .headers(headers.clone())
        .form(grant);

    if let Some((id, secret)) = basic_auth {
        req = req.basic_auth(id.as_str(), Some(secret.as_str()));
    }

    let resp = req.send().await.map_err(IamRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from iam"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp
            .text()
            .await
            .map_err(IamRequestError::BodyReadError)?;
        return Err(IamRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(IamRequestError::BodyReadError)?;

    if body.iter().all(u8::is_ascii_whitespace) {
        tracing::warn!("iam returned an empty body");
        return Ok(None);
    }

    let resp: Option<TokenResponse> = serde_json::from_slice(&body)?;

    match resp {
        Some(resp) if !resp.access_token.as_str().is_empty() => {
            tracing::info!(
                expires_in = maybe_value(&resp.expires_in.map(|d| d.0)),
                expiration = maybe_value(&resp.expiration.map(|e| e.0)),
                has_refresh_token = resp.refresh_token.is_some(),
                "received new token"
            );
            Ok(Some(resp))
        }
        _ => {
            tracing::warn!("iam response carried no access token");
            Ok(None)
        }
    }
}
