//! Authentication for cloud APIs using IAM API keys
//!
//! An [`ApiKeyAuthenticator`] trades a long-lived API key for short-lived bearer
//! tokens issued by the IAM token service. Every token it hands out carries the
//! number of seconds it remains valid, decoded from the token's own `exp` claim.
//!
//! Callers choose per request whether a previously issued token is acceptable.
//! When it is, the authenticator asks its exchange client for the current token
//! and returns it if its lifetime can be determined. Otherwise, or when a fresh
//! token is demanded, a new exchange is performed.
//!
//! ```
//! use iam_authenticator::{ApiKey, ApiKeyAuthenticator, Authenticator};
//!
//! # async fn run() -> Result<(), iam_authenticator::AuthenticatorError> {
//! let authenticator = ApiKeyAuthenticator::new(ApiKey::from_static("my-api-key"));
//!
//! # /* Commented out due to this trying to interact with the world.
//! let token = authenticator.token(false).await?;
//!
//! tracing::info!(
//!     token = format_args!("{:#?}", token.access_token()),
//!     lifetime = token.lifetime().0,
//!     "obtained access token"
//! );
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! The default exchange client keeps the most recent token in memory and renews it
//! once it goes stale, according to its [`TokenLifetimeConfig`]. A custom
//! [`TokenExchangeClient`][sources::TokenExchangeClient] or
//! [`LifetimeInspector`] can be supplied through
//! [`ApiKeyAuthenticator::with_parts`].
//!
//! # Features
//!
//! * `rustls-tls` (default): Uses `rustls` for TLS connections to the token service.
//! * `native-tls`: Uses the platform's native TLS implementation instead.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod api_key;
pub mod authenticator;
mod braids;
pub mod error;
pub mod lifetime;
pub mod sources;
mod tokens;

pub use api_key::ApiKeyAuthenticator;
pub use authenticator::{AuthType, Authenticator};
pub use braids::*;
pub use error::AuthenticatorError;
pub use lifetime::{JwtLifetimeInspector, LifetimeError, LifetimeInspector};
pub use tokens::{IamToken, TokenLifetimeConfig};
