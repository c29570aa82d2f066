use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use reqwest::Url;

use crate::{AccessToken, AccessTokenRef, ApiKey, ApiKeyRef};

/// A bearer token paired with the number of seconds it remains valid
///
/// Only an authenticator constructs this type, and only after the lifetime has
/// been decoded from the token itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IamToken {
    access_token: AccessToken,
    lifetime: DurationSecs,
}

impl IamToken {
    pub(crate) fn new(access_token: AccessToken, lifetime: DurationSecs) -> Self {
        Self {
            access_token,
            lifetime,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the remaining lifetime of the token at the time it was handed out
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }

    /// Formats the token as the value of an `Authorization` header
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.access_token.as_str())
    }

    /// Splits the token into its parts
    pub fn into_parts(self) -> (AccessToken, DurationSecs) {
        (self.access_token, self.lifetime)
    }
}

/// A token's lifecycle status within the exchange client's cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TokenStatus {
    /// The token is fresh and valid
    Fresh,
    /// The token is valid, but should be refreshed
    Stale,
    /// The token is no longer valid
    Expired,
}

/// A token held by the exchange client, tagged with the credentials it was issued for
#[derive(Debug)]
pub(crate) struct IssuedToken {
    access_token: AccessToken,
    api_key: ApiKey,
    endpoint: Url,
    issued: UnixTime,
    stale: UnixTime,
    expiry: UnixTime,
}

impl IssuedToken {
    #[inline]
    pub(crate) fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    #[inline]
    pub(crate) fn expiry(&self) -> UnixTime {
        self.expiry
    }

    #[inline]
    pub(crate) fn stale(&self) -> UnixTime {
        self.stale
    }

    /// Whether this token was obtained with the given key against the given endpoint
    pub(crate) fn issued_for(&self, api_key: &ApiKeyRef, endpoint: &Url) -> bool {
        *self.api_key == *api_key && self.endpoint == *endpoint
    }

    #[inline]
    pub(crate) fn token_status_at(&self, time: UnixTime) -> TokenStatus {
        if time < self.stale {
            TokenStatus::Fresh
        } else if time < self.expiry {
            TokenStatus::Stale
        } else {
            TokenStatus::Expired
        }
    }

    #[inline]
    pub(crate) fn issued(&self) -> UnixTime {
        self.issued
    }
}

/// Configuration for determining when a cached token should be refreshed
#[derive(Clone, Debug)]
pub struct TokenLifetimeConfig<C = System> {
    refresh_ratio: f64,
    min_refresh_window: DurationSecs,
    clock: C,
}

impl Default for TokenLifetimeConfig {
    /// Default lifetime configuration
    ///
    /// A token becomes stale after 80% of its lifetime has passed, and always at
    /// least 10 seconds before it expires. Uses the system clock.
    fn default() -> Self {
        Self {
            refresh_ratio: 0.8,
            min_refresh_window: DurationSecs(10),
            clock: System,
        }
    }
}

impl TokenLifetimeConfig {
    /// Constructs a new lifetime configuration
    ///
    /// A token using this configuration will be considered stale when `refresh_ratio`
    /// of its lifetime has passed, or when less than `min_refresh_window` remains,
    /// whichever comes first.
    pub fn new(refresh_ratio: f64, min_refresh_window: DurationSecs) -> Self {
        Self {
            refresh_ratio,
            min_refresh_window,
            clock: System,
        }
    }
}

impl<C> TokenLifetimeConfig<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenLifetimeConfig<D> {
        TokenLifetimeConfig {
            refresh_ratio: self.refresh_ratio,
            min_refresh_window: self.min_refresh_window,
            clock,
        }
    }

    fn time_to_stale(&self, issued: UnixTime, expiry: UnixTime) -> UnixTime {
        if expiry <= issued {
            return issued;
        }

        let valid = expiry - issued;
        let by_ratio = issued + valid * self.refresh_ratio;
        let by_window = if valid > self.min_refresh_window {
            expiry - self.min_refresh_window
        } else {
            issued
        };

        by_ratio.min(by_window)
    }
}

impl<C: Clock> TokenLifetimeConfig<C> {
    /// Gets the current time according to the configured clock
    #[inline]
    pub(crate) fn now(&self) -> UnixTime {
        self.clock.now()
    }

    /// Stamps a newly issued token with its stale and expiry times
    ///
    /// An absolute `expiration` wins over a relative `expires_in`. A token with
    /// neither is treated as already expired and will not be reused.
    pub(crate) fn create_token(
        &self,
        access_token: AccessToken,
        api_key: ApiKey,
        endpoint: Url,
        expiration: Option<UnixTime>,
        expires_in: Option<DurationSecs>,
    ) -> IssuedToken {
        let issued = self.clock.now();
        let expiry = expiration
            .or_else(|| expires_in.map(|lifetime| issued + lifetime))
            .unwrap_or(issued);

        IssuedToken {
            access_token,
            api_key,
            endpoint,
            issued,
            stale: self.time_to_stale(issued, expiry),
            expiry,
        }
    }
}
