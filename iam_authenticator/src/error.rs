//! Errors surfaced to callers of an authenticator

use std::error::Error as StdError;

use thiserror::Error;

use crate::lifetime::LifetimeError;

/// An error while obtaining a token from an authenticator
///
/// Every variant carries a human-readable description. Variants that wrap a
/// failure from a collaborator also expose that failure through
/// [`backend_error()`][Self::backend_error] and [`source()`][StdError::source].
#[derive(Debug, Error)]
pub enum AuthenticatorError {
    /// The token could not be fetched, either from the exchange client's cache
    /// or from a forced exchange
    #[error("error fetching iam token using api key")]
    TokenFetchFailed {
        /// The underlying exchange client error
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    /// The token exchange succeeded but returned no usable token
    #[error("token response received is empty")]
    EmptyTokenResponse,

    /// A freshly exchanged token could not be time-decoded
    #[error("error fetching token lifetime")]
    LifetimeComputationFailed {
        /// The underlying decoding error
        #[source]
        source: LifetimeError,
    },
}

impl AuthenticatorError {
    pub(crate) fn token_fetch_failed(
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self::TokenFetchFailed {
            source: source.into(),
        }
    }

    /// A human-readable description of what failed
    pub fn description(&self) -> String {
        self.to_string()
    }

    /// The wrapped backend error rendered as a string, if any
    pub fn backend_error(&self) -> Option<String> {
        self.source().map(ToString::to_string)
    }
}
