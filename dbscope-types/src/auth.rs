//! Authentication API surface consumed by the resilience layer.
//!
//! The core never talks to the authentication service directly; it goes
//! through a thin client implementing [`AuthApi`]. All calls are one-shot
//! request/response, `validate` is assumed idempotent, and tokens are
//! carried as [`SecretString`] so they never land in logs or debug output.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Dynamic trait object for the authentication client.
///
/// Must be `Send + Sync` to work with async contexts.
pub type AuthApiService = Arc<dyn AuthApi + Send + Sync>;

/// The verdict of a token validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthVerdict {
    /// Whether the token is valid.
    pub valid: bool,
    /// The user the token belongs to, when valid.
    pub user_id: Option<UserId>,
    /// The user's email, when the service returns one.
    pub email: Option<String>,
    /// Permissions attached to the token.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Set when this verdict was served from the token cache while the
    /// authentication dependency was unreachable. Downstream policy may
    /// treat degraded verdicts more conservatively.
    #[serde(default)]
    pub degraded: bool,
    /// Service-provided error detail for invalid tokens.
    pub error: Option<String>,
}

impl AuthVerdict {
    /// A positive verdict for the given user.
    pub fn valid_for(user_id: impl Into<UserId>) -> Self {
        Self {
            valid: true,
            user_id: Some(user_id.into()),
            email: None,
            permissions: Vec::new(),
            degraded: false,
            error: None,
        }
    }

    /// A negative verdict with the given reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            user_id: None,
            email: None,
            permissions: Vec::new(),
            degraded: false,
            error: Some(reason.into()),
        }
    }
}

/// A refreshed token pair.
///
/// Deliberately not serializable as a whole; the tokens inside stay
/// [`SecretString`]s until a transport layer exposes them explicitly.
#[derive(Debug, Deserialize)]
pub struct AuthGrant {
    /// The new access token.
    pub access_token: SecretString,
    /// The new refresh token.
    pub refresh_token: SecretString,
    /// Seconds until the access token expires.
    pub expires_in: u64,
}

/// Health of the authentication service as reported by itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthServiceHealth {
    /// Free-form status string, `"ok"` when healthy.
    pub status: String,
}

impl AuthServiceHealth {
    /// Returns `true` when the reported status is `"ok"`.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Thin client to the authentication service.
///
/// Implementations perform the actual transport (HTTP, gRPC, in-process
/// stub). Transport failures and deadline handling are the caller's
/// concern; every method simply reports what the service answered.
#[async_trait]
pub trait AuthApi {
    /// Validates a bearer token and returns the service's verdict.
    ///
    /// An invalid token is a successful call with `valid == false`; `Err`
    /// means the service could not be asked.
    async fn validate(&self, token: &SecretString) -> eyre::Result<AuthVerdict>;

    /// Exchanges a refresh token for a fresh token pair.
    async fn refresh(&self, refresh_token: &SecretString) -> eyre::Result<AuthGrant>;

    /// Invalidates a token server-side. Returns whether the service
    /// confirmed the logout.
    async fn logout(&self, token: &SecretString) -> eyre::Result<bool>;

    /// Asks the service for its own health.
    async fn health(&self) -> eyre::Result<AuthServiceHealth>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_defaults_to_false_on_deserialize() {
        let verdict: AuthVerdict = serde_json::from_str(
            r#"{"valid":true,"user_id":"alice","email":null,"permissions":[],"error":null}"#,
        )
        .unwrap();
        assert!(verdict.valid);
        assert!(!verdict.degraded);
    }

    #[test]
    fn invalid_verdict_carries_reason() {
        let verdict = AuthVerdict::invalid("expired");
        assert!(!verdict.valid);
        assert_eq!(verdict.error.as_deref(), Some("expired"));
        assert!(verdict.user_id.is_none());
    }
}
