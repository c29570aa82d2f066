//! The generic authenticator interface

use std::fmt;

use async_trait::async_trait;
use reqwest::Url;

use crate::{error::AuthenticatorError, ApiKey, IamToken};

/// The kind of credential an authenticator trades for tokens
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AuthType {
    /// A long-lived IAM API key
    Iam,
}

impl AuthType {
    /// The conventional name of the auth type
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Iam => "iam",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source of bearer tokens for cloud API calls
///
/// Implementations are shared between tasks, so every operation takes `&self`.
/// Setters take effect on the next token request; requests already in flight
/// keep the settings they started with.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The kind of credential this authenticator uses
    fn auth_type(&self) -> AuthType;

    /// Gets a token and its remaining lifetime
    ///
    /// When `fresh_token_required` is `false`, a previously issued token may be
    /// returned. Otherwise a new token is always exchanged for.
    async fn token(&self, fresh_token_required: bool) -> Result<IamToken, AuthenticatorError>;

    /// Gets the secret currently used to obtain tokens
    fn secret(&self) -> ApiKey;

    /// Replaces the secret used to obtain tokens
    fn set_secret(&self, secret: ApiKey);

    /// Replaces the endpoint tokens are obtained from
    fn set_url(&self, url: Url);

    /// Whether the secret has been marked as encrypted
    fn is_secret_encrypted(&self) -> bool;

    /// Marks the secret as encrypted or not
    ///
    /// The flag is informational only; the authenticator does not decrypt anything.
    fn set_encryption(&self, encrypted: bool);
}
