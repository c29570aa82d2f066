//! Decoding the remaining lifetime of a bearer token

use std::error::Error as StdError;

use aliri::{jwt, JwtRef};
use aliri_base64::Base64Url;
use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use serde::Deserialize;
use thiserror::Error;

use crate::AccessTokenRef;

/// Computes how much longer a bearer token remains valid
pub trait LifetimeInspector: Send + Sync {
    /// Decodes `token` and returns the number of seconds until it expires
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be decoded or has already expired.
    fn lifetime(&self, token: &AccessTokenRef) -> Result<DurationSecs, LifetimeError>;
}

/// A token's lifetime could not be determined
#[derive(Debug, Error)]
pub enum LifetimeError {
    /// The token is not a well-formed JWT
    #[error("malformed token")]
    Malformed {
        /// The decoding failure
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
    /// The token carries no `exp` claim
    #[error("token has no expiration claim")]
    MissingExpiry,
    /// The token's expiry is not in the future
    #[error("token expired at {}", expired_at.0)]
    Expired {
        /// When the token expired
        expired_at: UnixTime,
    },
}

fn malformed(source: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> LifetimeError {
    LifetimeError::Malformed {
        source: source.into(),
    }
}

#[derive(Deserialize)]
struct ExpiryClaims {
    #[serde(default)]
    exp: Option<UnixTime>,
}

/// Reads the `exp` claim of a JWT access token
///
/// The token's signature is **not** verified. The token came straight from the
/// issuing authority and is only inspected to decide whether it is still worth
/// presenting.
#[derive(Clone, Copy, Debug, Default)]
pub struct JwtLifetimeInspector<C = System> {
    clock: C,
}

impl JwtLifetimeInspector {
    /// Constructs an inspector using the system clock
    pub const fn new() -> Self {
        Self { clock: System }
    }
}

impl<C> JwtLifetimeInspector<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> JwtLifetimeInspector<D> {
        JwtLifetimeInspector { clock }
    }
}

impl<C: Clock> JwtLifetimeInspector<C> {
    fn expiry(token: &AccessTokenRef) -> Result<UnixTime, LifetimeError> {
        let decomposed = JwtRef::from_str(token.as_str())
            .decompose::<jwt::BasicHeaders>()
            .map_err(malformed)?;
        let payload = Base64Url::from_encoded(decomposed.untrusted_payload()).map_err(malformed)?;
        let claims: ExpiryClaims = serde_json::from_slice(payload.as_slice()).map_err(malformed)?;

        claims.exp.ok_or(LifetimeError::MissingExpiry)
    }
}

impl<C: Clock + Send + Sync> LifetimeInspector for JwtLifetimeInspector<C> {
    fn lifetime(&self, token: &AccessTokenRef) -> Result<DurationSecs, LifetimeError> {
        let expiry = Self::expiry(token)?;
        let now = self.clock.now();

        if expiry <= now {
            return Err(LifetimeError::Expired { expired_at: expiry });
        }

        Ok(expiry - now)
    }
}
