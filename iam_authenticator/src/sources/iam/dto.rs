//! DTOs for interacting with the IAM token endpoint

use aliri_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessToken, ApiKeyRef, RefreshToken, ScopeRef};

/// The grant type used to trade an API key for an access token
pub const API_KEY_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";

/// The form body of an API key token request
#[derive(Debug)]
pub(super) struct ApiKeyGrant<'a> {
    pub api_key: &'a ApiKeyRef,
    pub scope: Option<&'a ScopeRef>,
}

impl Serialize for ApiKeyGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("ApiKeyGrant", 4)?;
        ser.serialize_field("grant_type", API_KEY_GRANT_TYPE)?;
        ser.serialize_field("apikey", self.api_key.as_str())?;
        ser.serialize_field("response_type", "cloud_iam")?;
        if let Some(scope) = self.scope {
            ser.serialize_field("scope", scope.as_str())?;
        } else {
            ser.skip_field("scope")?;
        }
        ser.end()
    }
}

/// A successful response from the IAM token endpoint
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TokenResponse {
    /// The bearer access token
    pub access_token: AccessToken,

    /// A refresh token, if one was issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,

    /// The token type, usually `Bearer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    /// Seconds the token is valid for, relative to issuance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<DurationSecs>,

    /// The absolute expiry of the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<UnixTime>,

    /// The scope the token was issued for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}
