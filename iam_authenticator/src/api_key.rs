//! An authenticator that trades a long-lived API key for IAM tokens

use std::{
    error,
    sync::{
        atomic::{AtomicBool, Ordering},
        PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use async_trait::async_trait;
use reqwest::Url;

use crate::{
    authenticator::{AuthType, Authenticator},
    error::AuthenticatorError,
    lifetime::{JwtLifetimeInspector, LifetimeInspector},
    sources::{ExchangeRequest, IamTokenClient, TokenExchangeClient},
    ApiKey, IamToken,
};

#[derive(Debug)]
struct Settings {
    api_key: ApiKey,
    endpoint: Option<Url>,
}

/// An IAM authenticator backed by an API key
///
/// Tokens are obtained through a [`TokenExchangeClient`] and are only handed out
/// once a [`LifetimeInspector`] has decoded how long they remain valid. The
/// authenticator itself keeps no expiry bookkeeping: whether a cached token may
/// be reused is decided by decoding that token on every request.
///
/// The API key and endpoint can be replaced at any time. Each token request
/// works from a single consistent snapshot of both.
#[derive(Debug)]
pub struct ApiKeyAuthenticator<X = IamTokenClient, L = JwtLifetimeInspector> {
    settings: RwLock<Settings>,
    secret_encrypted: AtomicBool,
    exchange: X,
    inspector: L,
}

impl ApiKeyAuthenticator {
    /// Constructs an authenticator using the public IAM endpoint and the system clock
    ///
    /// No network call is made until a token is requested.
    pub fn new(api_key: ApiKey) -> Self {
        Self::with_parts(api_key, IamTokenClient::default(), JwtLifetimeInspector::new())
    }
}

impl<X, L> ApiKeyAuthenticator<X, L> {
    /// Constructs an authenticator from its collaborators
    pub fn with_parts(api_key: ApiKey, exchange: X, inspector: L) -> Self {
        tracing::info!("initializing iam authenticator");

        let authenticator = Self {
            settings: RwLock::new(Settings {
                api_key,
                endpoint: None,
            }),
            secret_encrypted: AtomicBool::new(false),
            exchange,
            inspector,
        };

        tracing::info!("initialized iam authenticator");
        authenticator
    }

    /// The exchange client used to obtain tokens
    pub fn exchange_client(&self) -> &X {
        &self.exchange
    }

    fn settings(&self) -> RwLockReadGuard<'_, Settings> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings_mut(&self) -> RwLockWriteGuard<'_, Settings> {
        self.settings.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> ExchangeRequest {
        let settings = self.settings();
        ExchangeRequest::new(settings.api_key.clone(), settings.endpoint.clone())
    }
}

impl<X: TokenExchangeClient, L: LifetimeInspector> ApiKeyAuthenticator<X, L> {
    /// Asks the exchange client for its current token
    ///
    /// Returns `Ok(None)` when the token cannot be time-validated, in which case
    /// the caller should force an exchange.
    async fn existing_token(
        &self,
        request: &ExchangeRequest,
    ) -> Result<Option<IamToken>, AuthenticatorError> {
        tracing::info!("request received to fetch existing token");

        let token = self.exchange.cached_token(request).await.map_err(|error| {
            tracing::error!(
                error = (&error as &dyn error::Error),
                "error fetching existing token"
            );
            AuthenticatorError::token_fetch_failed(error)
        })?;

        match self.inspector.lifetime(&token) {
            Ok(lifetime) => {
                tracing::info!(
                    lifetime = lifetime.0,
                    "fetched iam token and token lifetime successfully"
                );
                Ok(Some(IamToken::new(token, lifetime)))
            }
            Err(error) => {
                tracing::error!(
                    error = (&error as &dyn error::Error),
                    "error fetching token lifetime of existing token"
                );
                Ok(None)
            }
        }
    }

    async fn fresh_token(&self, request: &ExchangeRequest) -> Result<IamToken, AuthenticatorError> {
        tracing::info!("fetching fresh token");

        let resp = self.exchange.request_token(request).await.map_err(|error| {
            tracing::error!(
                error = (&error as &dyn error::Error),
                "error fetching fresh token"
            );
            AuthenticatorError::token_fetch_failed(error)
        })?;

        let token = resp
            .map(|resp| resp.access_token)
            .filter(|token| !token.as_str().is_empty())
            .ok_or_else(|| {
                tracing::error!("token response received is empty");
                AuthenticatorError::EmptyTokenResponse
            })?;

        let lifetime = self.inspector.lifetime(&token).map_err(|source| {
            tracing::error!(
                error = (&source as &dyn error::Error),
                "error fetching token lifetime for new token"
            );
            AuthenticatorError::LifetimeComputationFailed { source }
        })?;

        tracing::info!(
            lifetime = lifetime.0,
            "successfully fetched iam token and token lifetime"
        );
        Ok(IamToken::new(token, lifetime))
    }
}

#[async_trait]
impl<X: TokenExchangeClient, L: LifetimeInspector> Authenticator for ApiKeyAuthenticator<X, L> {
    fn auth_type(&self) -> AuthType {
        AuthType::Iam
    }

    async fn token(&self, fresh_token_required: bool) -> Result<IamToken, AuthenticatorError> {
        tracing::info!(
            fresh_token_required,
            "fetching iam token using api key authenticator"
        );

        let request = self.snapshot();

        if !fresh_token_required {
            if let Some(token) = self.existing_token(&request).await? {
                return Ok(token);
            }
        }

        self.fresh_token(&request).await
    }

    fn secret(&self) -> ApiKey {
        self.settings().api_key.clone()
    }

    fn set_secret(&self, secret: ApiKey) {
        self.settings_mut().api_key = secret;
    }

    fn set_url(&self, url: Url) {
        self.settings_mut().endpoint = Some(url);
    }

    fn is_secret_encrypted(&self) -> bool {
        self.secret_encrypted.load(Ordering::Acquire)
    }

    fn set_encryption(&self, encrypted: bool) {
        self.secret_encrypted.store(encrypted, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use aliri_clock::{DurationSecs, TestClock, UnixTime};
    use color_eyre::Result;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        lifetime::{test_tokens::jwt_expiring_at, LifetimeError},
        sources::{IamClientConfig, TokenResponse},
        AccessToken, AccessTokenRef, TokenLifetimeConfig,
    };

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct MockError(&'static str);

    #[derive(Debug)]
    struct MockExchange {
        cached: Result<&'static str, &'static str>,
        fresh: Result<Option<&'static str>, &'static str>,
        cached_calls: AtomicUsize,
        fresh_calls: AtomicUsize,
        seen: Mutex<Vec<ExchangeRequest>>,
    }

    impl MockExchange {
        fn new(
            cached: Result<&'static str, &'static str>,
            fresh: Result<Option<&'static str>, &'static str>,
        ) -> Self {
            Self {
                cached,
                fresh,
                cached_calls: AtomicUsize::new(0),
                fresh_calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn cached_calls(&self) -> usize {
            self.cached_calls.load(Ordering::SeqCst)
        }

        fn fresh_calls(&self) -> usize {
            self.fresh_calls.load(Ordering::SeqCst)
        }

        fn seen(&self) -> Vec<ExchangeRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TokenExchangeClient for MockExchange {
        type Error = MockError;

        async fn cached_token(&self, request: &ExchangeRequest) -> Result<AccessToken, MockError> {
            self.cached_calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            self.cached.map(AccessToken::from_static).map_err(MockError)
        }

        async fn request_token(
            &self,
            request: &ExchangeRequest,
        ) -> Result<Option<TokenResponse>, MockError> {
            self.fresh_calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            self.fresh.map_err(MockError).map(|token| {
                token.map(|t| TokenResponse {
                    access_token: AccessToken::from_static(t),
                    refresh_token: None,
                    token_type: Some("Bearer".to_owned()),
                    expires_in: Some(DurationSecs(3_600)),
                    expiration: None,
                    scope: None,
                })
            })
        }
    }

    #[derive(Debug, Default)]
    struct MockInspector {
        lifetimes: HashMap<&'static str, u64>,
        calls: AtomicUsize,
    }

    impl MockInspector {
        fn with(lifetimes: &[(&'static str, u64)]) -> Self {
            Self {
                lifetimes: lifetimes.iter().copied().collect(),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl LifetimeInspector for MockInspector {
        fn lifetime(&self, token: &AccessTokenRef) -> Result<DurationSecs, LifetimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.lifetimes
                .get(token.as_str())
                .map(|secs| DurationSecs(*secs))
                .ok_or(LifetimeError::Expired {
                    expired_at: UnixTime(0),
                })
        }
    }

    fn authenticator(
        exchange: MockExchange,
        inspector: MockInspector,
    ) -> ApiKeyAuthenticator<MockExchange, MockInspector> {
        ApiKeyAuthenticator::with_parts(ApiKey::from_static("initial-key"), exchange, inspector)
    }

    #[tokio::test]
    async fn cached_token_is_returned_without_exchange() -> Result<()> {
        let auth = authenticator(
            MockExchange::new(Ok("cached"), Ok(Some("fresh"))),
            MockInspector::with(&[("cached", 300), ("fresh", 3_600)]),
        );

        let token = auth.token(false).await?;

        assert_eq!(token.access_token().as_str(), "cached");
        assert_eq!(token.lifetime(), DurationSecs(300));
        assert_eq!(auth.exchange.cached_calls(), 1);
        assert_eq!(auth.exchange.fresh_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn forced_token_never_consults_cache() -> Result<()> {
        let auth = authenticator(
            MockExchange::new(Ok("cached"), Ok(Some("fresh"))),
            MockInspector::with(&[("cached", 300), ("fresh", 3_600)]),
        );

        let token = auth.token(true).await?;

        assert_eq!(token.access_token().as_str(), "fresh");
        assert_eq!(token.lifetime(), DurationSecs(3_600));
        assert_eq!(auth.exchange.cached_calls(), 0);
        assert_eq!(auth.exchange.fresh_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn undecodable_cached_token_falls_back_to_exchange() -> Result<()> {
        let auth = authenticator(
            MockExchange::new(Ok("stale"), Ok(Some("fresh"))),
            MockInspector::with(&[("fresh", 3_600)]),
        );

        let token = auth.token(false).await?;

        assert_eq!(token.access_token().as_str(), "fresh");
        assert_eq!(token.lifetime(), DurationSecs(3_600));
        assert_eq!(auth.exchange.cached_calls(), 1);
        assert_eq!(auth.exchange.fresh_calls(), 1);
        assert!(logs_contain("error fetching token lifetime of existing token"));
        Ok(())
    }

    #[tokio::test]
    async fn cached_lookup_failure_does_not_fall_through() {
        let auth = authenticator(
            MockExchange::new(Err("cache unavailable"), Ok(Some("fresh"))),
            MockInspector::with(&[("fresh", 3_600)]),
        );

        let err = auth.token(false).await.unwrap_err();

        assert!(matches!(err, AuthenticatorError::TokenFetchFailed { .. }));
        assert_eq!(err.backend_error().as_deref(), Some("cache unavailable"));
        assert_eq!(auth.exchange.fresh_calls(), 0);
    }

    #[tokio::test]
    async fn exchange_failure_is_token_fetch_failed() {
        let auth = authenticator(
            MockExchange::new(Ok("cached"), Err("connection refused")),
            MockInspector::default(),
        );

        let err = auth.token(true).await.unwrap_err();

        assert!(matches!(err, AuthenticatorError::TokenFetchFailed { .. }));
        assert_eq!(err.description(), "error fetching iam token using api key");
        assert_eq!(err.backend_error().as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn empty_response_skips_lifetime_computation() {
        let auth = authenticator(
            MockExchange::new(Ok("cached"), Ok(None)),
            MockInspector::default(),
        );

        let err = auth.token(true).await.unwrap_err();

        assert!(matches!(err, AuthenticatorError::EmptyTokenResponse));
        assert_eq!(auth.inspector.calls(), 0);
    }

    #[tokio::test]
    async fn empty_access_token_is_an_empty_response() {
        let auth = authenticator(
            MockExchange::new(Ok("cached"), Ok(Some(""))),
            MockInspector::default(),
        );

        let err = auth.token(true).await.unwrap_err();

        assert!(matches!(err, AuthenticatorError::EmptyTokenResponse));
        assert_eq!(auth.inspector.calls(), 0);
    }

    #[tokio::test]
    async fn fresh_lifetime_failure_is_fatal() {
        let auth = authenticator(
            MockExchange::new(Ok("stale"), Ok(Some("undecodable"))),
            MockInspector::default(),
        );

        let err = auth.token(false).await.unwrap_err();

        assert!(matches!(
            err,
            AuthenticatorError::LifetimeComputationFailed { .. }
        ));
        assert_eq!(err.backend_error().as_deref(), Some("token expired at 0"));
        assert_eq!(auth.exchange.cached_calls(), 1);
        assert_eq!(auth.exchange.fresh_calls(), 1);
        assert_eq!(auth.inspector.calls(), 2);
    }

    #[tokio::test]
    async fn rotated_secret_is_used_for_next_exchange() -> Result<()> {
        let auth = authenticator(
            MockExchange::new(Ok("cached"), Ok(Some("fresh"))),
            MockInspector::with(&[("fresh", 3_600)]),
        );

        auth.token(true).await?;
        auth.set_secret(ApiKey::from_static("rotated-key"));
        auth.token(true).await?;

        let keys: Vec<_> = auth
            .exchange
            .seen()
            .iter()
            .map(|r| r.api_key().as_str().to_owned())
            .collect();
        assert_eq!(keys, ["initial-key", "rotated-key"]);
        Ok(())
    }

    #[test]
    fn secret_round_trips() {
        let auth = authenticator(
            MockExchange::new(Ok("cached"), Ok(None)),
            MockInspector::default(),
        );

        assert_eq!(auth.secret().as_str(), "initial-key");
        auth.set_secret(ApiKey::from_static("another-key"));
        assert_eq!(auth.secret().as_str(), "another-key");
    }

    #[tokio::test]
    async fn endpoint_override_reaches_exchange() -> Result<()> {
        let auth = authenticator(
            MockExchange::new(Ok("cached"), Ok(Some("fresh"))),
            MockInspector::with(&[("fresh", 3_600)]),
        );

        auth.token(true).await?;
        let private = Url::parse("https://private.iam.cloud.ibm.com")?;
        auth.set_url(private.clone());
        auth.token(true).await?;

        let endpoints: Vec<_> = auth
            .exchange
            .seen()
            .iter()
            .map(|r| r.endpoint().cloned())
            .collect();
        assert_eq!(endpoints, [None, Some(private)]);
        Ok(())
    }

    #[test]
    fn encryption_flag_round_trips() {
        let auth = authenticator(
            MockExchange::new(Ok("cached"), Ok(None)),
            MockInspector::default(),
        );

        assert!(!auth.is_secret_encrypted());
        auth.set_encryption(true);
        assert!(auth.is_secret_encrypted());
        auth.set_encryption(false);
        assert!(!auth.is_secret_encrypted());
    }

    #[tokio::test]
    #[traced_test]
    async fn logs_follow_the_cached_path() -> Result<()> {
        let auth = authenticator(
            MockExchange::new(Ok("cached"), Ok(Some("fresh"))),
            MockInspector::with(&[("cached", 300)]),
        );

        auth.token(false).await?;

        logs_assert(|lines: &[&str]| {
            let position = |needle: &str| {
                lines
                    .iter()
                    .position(|line| line.contains(needle))
                    .ok_or_else(|| format!("missing log line: {}", needle))
            };

            let expected = [
                "initializing iam authenticator",
                "initialized iam authenticator",
                "fetching iam token using api key authenticator",
                "request received to fetch existing token",
                "fetched iam token and token lifetime successfully",
            ];

            let mut last = None;
            for needle in expected {
                let at = position(needle)?;
                if last.map_or(false, |prev| at <= prev) {
                    return Err(format!("log line out of order: {}", needle));
                }
                last = Some(at);
            }

            if lines.iter().any(|line| line.contains("fetching fresh token")) {
                return Err("cached path must not force an exchange".to_owned());
            }

            Ok(())
        });
        Ok(())
    }

    #[tokio::test]
    async fn usable_as_a_trait_object() -> Result<()> {
        let auth: Arc<dyn Authenticator> = Arc::new(authenticator(
            MockExchange::new(Ok("cached"), Ok(Some("fresh"))),
            MockInspector::with(&[("cached", 300)]),
        ));

        assert_eq!(auth.auth_type(), AuthType::Iam);
        let token = auth.token(false).await?;
        assert_eq!(token.authorization(), "Bearer cached");
        Ok(())
    }

    #[tokio::test]
    async fn end_to_end_against_iam() -> Result<()> {
        let server = MockServer::start_async().await;
        let access_token = jwt_expiring_at(4_600);
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/identity/token")
                    .body_includes("apikey=initial-key");
                then.status(200).json_body(json!({
                    "access_token": access_token.as_str(),
                    "refresh_token": "not_supported",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                    "expiration": 4600
                }));
            })
            .await;

        let clock = TestClock::new(UnixTime(1_000));
        let client = IamTokenClient::new(
            reqwest::Client::new(),
            IamClientConfig::new()
                .with_endpoint(Url::parse(&server.base_url())?)
                .with_lifetime_config(
                    TokenLifetimeConfig::default().with_clock(clock.clone()),
                ),
        );
        let auth = ApiKeyAuthenticator::with_parts(
            ApiKey::from_static("initial-key"),
            client,
            JwtLifetimeInspector::new().with_clock(clock),
        );

        let first = auth.token(false).await?;
        let second = auth.token(false).await?;
        mock.assert_calls_async(1).await;

        assert_eq!(first.access_token(), &*access_token);
        assert_eq!(first.lifetime(), DurationSecs(3_600));
        assert_eq!(second, first);

        let forced = auth.token(true).await?;
        mock.assert_calls_async(2).await;
        assert_eq!(forced.lifetime(), DurationSecs(3_600));
        Ok(())
    }
}
