//! OAuth2 token handling for Tern Mail

pub mod provider_oauth;
pub mod token_manager;

pub use provider_oauth::{OAuthRegistry, ProviderOAuth};
pub use token_manager::{TokenManager, TokenRefresher};

/// OAuth2 authorization URL
#[derive(Debug, Clone)]
pub struct AuthorizationUrl {
    /// Authorization URL
    pub url: String,
    /// State parameter
    pub state: String,
    /// Code verifier (for PKCE), empty when the provider does not use PKCE
    pub code_verifier: String,
}

/// OAuth2 token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthToken {
    /// Access token
    pub access_token: String,
    /// Refresh token
    pub refresh_token: Option<String>,
    /// Expires at
    pub expires_at: Option<time::OffsetDateTime>,
    /// Scope
    pub scope: Option<String>,
}

impl OAuthToken {
    /// Check if the token is expired
    pub fn is_expired(&self) -> bool {
        self.expires_within(time::Duration::ZERO)
    }

    /// Check if the token expires within `margin`. Tokens without an expiry never do.
    pub fn expires_within(&self, margin: time::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - time::OffsetDateTime::now_utc() <= margin,
            None => false,
        }
    }

    /// Credentials in the shape an account is linked with
    pub fn into_provider_tokens(self) -> tern_core::ProviderTokens {
        tern_core::ProviderTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_token_expiration() {
        let token = OAuthToken {
            access_token: "test-token".to_string(),
            refresh_token: None,
            expires_at: Some(time::OffsetDateTime::now_utc() + time::Duration::hours(1)),
            scope: None,
        };

        assert!(!token.is_expired());
        assert!(!token.expires_within(time::Duration::minutes(5)));
        assert!(token.expires_within(time::Duration::hours(2)));

        let expired_token = OAuthToken {
            expires_at: Some(time::OffsetDateTime::now_utc() - time::Duration::hours(1)),
            ..token.clone()
        };
        assert!(expired_token.is_expired());

        let no_expiry = OAuthToken {
            expires_at: None,
            ..token
        };
        assert!(!no_expiry.expires_within(time::Duration::days(365)));
    }
}
