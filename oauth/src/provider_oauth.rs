//! Provider OAuth2 clients: authorization URLs, code exchange and refresh

use std::collections::HashMap;

use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, PkceCodeVerifier,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use tern_core::config::{OAuthClientConfig, ProvidersConfig};
use tern_core::error::{TernError, TernResult};
use tern_core::{Config, ProviderKind};

use crate::{AuthorizationUrl, OAuthToken, TokenRefresher};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const MICROSOFT_AUTH_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
const AURINKO_SCOPES: &[&str] = &["Mail.Read", "Mail.ReadWrite", "Mail.Send"];

/// Aurinko code exchange response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AurinkoTokenResponse {
    access_token: String,
}

enum Flow {
    /// RFC 6749 authorization code flow with PKCE
    Standard(BasicClient),
    /// Aurinko's own flow: the code goes in the token URL path and tokens do not expire
    Aurinko {
        client: OAuthClientConfig,
        authorize_url: String,
        token_url: String,
        http: reqwest::Client,
    },
}

/// OAuth2 client for one provider
pub struct ProviderOAuth {
    provider: ProviderKind,
    flow: Flow,
    scopes: Vec<String>,
    /// Aurinko `serviceType`, e.g. `Google` or `Office365`
    service_type: String,
}

impl ProviderOAuth {
    /// Create a client from the provider's registration
    pub fn new(provider: ProviderKind, client: &OAuthClientConfig, providers: &ProvidersConfig) -> TernResult<Self> {
        if !client.is_configured() {
            return Err(TernError::config(format!("No OAuth client configured for {}", provider)));
        }

        let (flow, scopes): (Flow, &[&str]) = match provider {
            ProviderKind::Google => (
                Flow::Standard(standard_client(client, GOOGLE_AUTH_URL, &providers.google_token_url)?),
                tern_core::GMAIL_OAUTH_SCOPES,
            ),
            ProviderKind::Microsoft => (
                Flow::Standard(
                    standard_client(client, MICROSOFT_AUTH_URL, &providers.microsoft_token_url)?
                        .set_auth_type(AuthType::RequestBody),
                ),
                tern_core::GRAPH_OAUTH_SCOPES,
            ),
            ProviderKind::Aurinko => (
                Flow::Aurinko {
                    client: client.clone(),
                    authorize_url: format!("{}/auth/authorize", providers.aurinko_api_base.trim_end_matches('/')),
                    token_url: providers.aurinko_token_url.trim_end_matches('/').to_string(),
                    http: reqwest::Client::new(),
                },
                AURINKO_SCOPES,
            ),
        };

        Ok(Self {
            provider,
            flow,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            service_type: "Google".to_string(),
        })
    }

    /// Pick the mailbox service Aurinko should connect to
    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Generate an authorization URL for the user to visit
    pub fn authorization_url(&self) -> TernResult<AuthorizationUrl> {
        match &self.flow {
            Flow::Standard(client) => {
                let (code_challenge, code_verifier) = PkceCodeChallenge::new_random_sha256();
                let mut request = client
                    .authorize_url(CsrfToken::new_random)
                    .add_scopes(self.scopes.iter().cloned().map(Scope::new))
                    .set_pkce_challenge(code_challenge);

                if self.provider == ProviderKind::Google {
                    // Google only issues a refresh token for offline access
                    request = request
                        .add_extra_param("access_type", "offline")
                        .add_extra_param("prompt", "consent");
                }

                let (url, state) = request.url();
                Ok(AuthorizationUrl {
                    url: url.to_string(),
                    state: state.secret().clone(),
                    code_verifier: code_verifier.secret().clone(),
                })
            }
            Flow::Aurinko {
                client, authorize_url, ..
            } => {
                let state = CsrfToken::new_random();
                let scopes = self.scopes.join(" ");
                let url = url::Url::parse_with_params(
                    authorize_url,
                    &[
                        ("clientId", client.client_id.as_str()),
                        ("serviceType", self.service_type.as_str()),
                        ("scopes", scopes.as_str()),
                        ("responseType", "code"),
                        ("returnUrl", client.redirect_uri.as_str()),
                        ("state", state.secret().as_str()),
                    ],
                )?;
                Ok(AuthorizationUrl {
                    url: url.to_string(),
                    state: state.secret().clone(),
                    code_verifier: String::new(),
                })
            }
        }
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> TernResult<OAuthToken> {
        match &self.flow {
            Flow::Standard(client) => {
                let mut request = client.exchange_code(AuthorizationCode::new(code.to_string()));
                if !code_verifier.is_empty() {
                    request = request.set_pkce_verifier(PkceCodeVerifier::new(code_verifier.to_string()));
                }
                let response = request
                    .request_async(async_http_client)
                    .await
                    .map_err(|e| TernError::ProviderRejected(format!("{} code exchange: {}", self.provider, e)))?;
                Ok(token_from_response(&response, None))
            }
            Flow::Aurinko {
                client, token_url, http, ..
            } => {
                let response = http
                    .post(format!("{}/{}", token_url, code))
                    .basic_auth(&client.client_id, Some(&client.client_secret))
                    .send()
                    .await?;

                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(TernError::ProviderRejected(format!(
                        "aurinko code exchange ({}): {}",
                        status, body
                    )));
                }

                let token: AurinkoTokenResponse = response.json().await?;
                Ok(OAuthToken {
                    access_token: token.access_token,
                    refresh_token: None,
                    expires_at: None,
                    scope: Some(self.scopes.join(" ")),
                })
            }
        }
    }

    /// Refresh an access token. The old refresh token is kept when the
    /// provider does not rotate it.
    pub async fn refresh_token(&self, refresh_token: &str) -> TernResult<OAuthToken> {
        match &self.flow {
            Flow::Standard(client) => {
                let response = client
                    .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
                    .request_async(async_http_client)
                    .await
                    .map_err(|e| TernError::ProviderRejected(format!("{} token refresh: {}", self.provider, e)))?;
                Ok(token_from_response(&response, Some(refresh_token)))
            }
            Flow::Aurinko { .. } => Err(TernError::ProviderRejected(
                "aurinko tokens cannot be refreshed, relink the account".to_string(),
            )),
        }
    }
}

fn standard_client(client: &OAuthClientConfig, auth_url: &str, token_url: &str) -> TernResult<BasicClient> {
    let client_secret = (!client.client_secret.is_empty()).then(|| ClientSecret::new(client.client_secret.clone()));
    let mut oauth = BasicClient::new(
        ClientId::new(client.client_id.clone()),
        client_secret,
        AuthUrl::new(auth_url.to_string())?,
        Some(TokenUrl::new(token_url.to_string())?),
    );

    if !client.redirect_uri.is_empty() {
        oauth = oauth.set_redirect_uri(RedirectUrl::new(client.redirect_uri.clone())?);
    }
    Ok(oauth)
}

fn token_from_response(response: &BasicTokenResponse, previous_refresh: Option<&str>) -> OAuthToken {
    let expires_at = response
        .expires_in()
        .map(|duration| time::OffsetDateTime::now_utc() + time::Duration::seconds(duration.as_secs() as i64));
    let scope = response
        .scopes()
        .map(|scopes| scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" "));

    OAuthToken {
        access_token: response.access_token().secret().clone(),
        refresh_token: response
            .refresh_token()
            .map(|t| t.secret().clone())
            .or_else(|| previous_refresh.map(String::from)),
        expires_at,
        scope,
    }
}

/// OAuth clients of every configured provider
#[derive(Default)]
pub struct OAuthRegistry {
    clients: HashMap<ProviderKind, ProviderOAuth>,
}

impl OAuthRegistry {
    /// Build clients for the providers that have credentials configured
    pub fn from_config(config: &Config) -> TernResult<Self> {
        let providers = &config.providers;
        let mut registry = Self::default();

        for (kind, client) in [
            (ProviderKind::Google, &providers.google),
            (ProviderKind::Microsoft, &providers.microsoft),
            (ProviderKind::Aurinko, &providers.aurinko),
        ] {
            if client.is_configured() {
                registry.insert(ProviderOAuth::new(kind, client, providers)?);
            } else {
                tracing::debug!("No OAuth client for {}", kind);
            }
        }

        Ok(registry)
    }

    pub fn insert(&mut self, client: ProviderOAuth) {
        self.clients.insert(client.provider(), client);
    }

    pub fn get(&self, provider: ProviderKind) -> TernResult<&ProviderOAuth> {
        self.clients
            .get(&provider)
            .ok_or_else(|| TernError::config(format!("No OAuth client configured for {}", provider)))
    }
}

#[async_trait]
impl TokenRefresher for OAuthRegistry {
    async fn refresh(&self, provider: ProviderKind, refresh_token: &str) -> TernResult<OAuthToken> {
        let client = self
            .get(provider)
            .map_err(|e| TernError::ProviderRejected(e.to_string()))?;
        client.refresh_token(refresh_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_config(id: &str) -> OAuthClientConfig {
        OAuthClientConfig {
            client_id: id.to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://127.0.0.1:8080/callback".to_string(),
        }
    }

    fn providers(server: &MockServer) -> ProvidersConfig {
        ProvidersConfig {
            google_token_url: format!("{}/google/token", server.uri()),
            microsoft_token_url: format!("{}/microsoft/token", server.uri()),
            aurinko_token_url: format!("{}/auth/token", server.uri()),
            aurinko_api_base: server.uri(),
            ..ProvidersConfig::default()
        }
    }

    #[test]
    fn test_unconfigured_client_is_rejected() {
        let result = ProviderOAuth::new(
            ProviderKind::Google,
            &OAuthClientConfig::default(),
            &ProvidersConfig::default(),
        );
        assert!(matches!(result, Err(TernError::Config(_))));
    }

    #[test]
    fn test_google_authorization_url() {
        let oauth = ProviderOAuth::new(
            ProviderKind::Google,
            &client_config("google-client"),
            &ProvidersConfig::default(),
        )
        .unwrap();
        let auth_url = oauth.authorization_url().unwrap();

        assert!(auth_url.url.starts_with(GOOGLE_AUTH_URL));
        assert!(auth_url.url.contains("client_id=google-client"));
        assert!(auth_url.url.contains("code_challenge="));
        assert!(auth_url.url.contains("access_type=offline"));
        assert!(auth_url.url.contains("gmail.readonly"));
        assert!(!auth_url.state.is_empty());
        assert!(!auth_url.code_verifier.is_empty());
    }

    #[test]
    fn test_aurinko_authorization_url() {
        let oauth = ProviderOAuth::new(
            ProviderKind::Aurinko,
            &client_config("aurinko-client"),
            &ProvidersConfig::default(),
        )
        .unwrap()
        .with_service_type("Office365");
        let auth_url = oauth.authorization_url().unwrap();

        assert!(auth_url.url.starts_with("https://api.aurinko.io/v1/auth/authorize?"));
        assert!(auth_url.url.contains("clientId=aurinko-client"));
        assert!(auth_url.url.contains("serviceType=Office365"));
        assert!(auth_url.url.contains("responseType=code"));
        assert!(auth_url.code_verifier.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/google/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let oauth = ProviderOAuth::new(ProviderKind::Google, &client_config("google-client"), &providers(&server))
            .unwrap();
        let token = oauth.refresh_token("old-refresh").await.unwrap();

        assert_eq!(token.access_token, "new-access");
        assert_eq!(token.refresh_token.as_deref(), Some("old-refresh"));
        assert!(!token.expires_within(time::Duration::minutes(30)));
    }

    #[tokio::test]
    async fn test_microsoft_refresh_sends_credentials_in_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/microsoft/token"))
            .and(body_string_contains("client_id=ms-client"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ms-access",
                "refresh_token": "ms-rotated",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let oauth = ProviderOAuth::new(ProviderKind::Microsoft, &client_config("ms-client"), &providers(&server))
            .unwrap();
        let token = oauth.refresh_token("ms-refresh").await.unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("ms-rotated"));
    }

    #[tokio::test]
    async fn test_revoked_refresh_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/google/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;

        let oauth = ProviderOAuth::new(ProviderKind::Google, &client_config("google-client"), &providers(&server))
            .unwrap();
        let result = oauth.refresh_token("revoked").await;
        assert!(matches!(result, Err(TernError::ProviderRejected(_))));
    }

    #[tokio::test]
    async fn test_aurinko_code_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token/the-code"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accountId": 42,
                "accessToken": "aurinko-access",
                "userId": "u1",
                "userSession": "s1"
            })))
            .mount(&server)
            .await;

        let oauth = ProviderOAuth::new(ProviderKind::Aurinko, &client_config("aurinko-client"), &providers(&server))
            .unwrap();
        let token = oauth.exchange_code("the-code", "").await.unwrap();
        assert_eq!(token.access_token, "aurinko-access");
        assert!(token.expires_at.is_none());

        assert!(matches!(
            oauth.refresh_token("anything").await,
            Err(TernError::ProviderRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_only_holds_configured_providers() {
        let mut config = Config::default();
        config.providers.microsoft = client_config("ms-client");

        let registry = OAuthRegistry::from_config(&config).unwrap();
        assert!(registry.get(ProviderKind::Microsoft).is_ok());
        assert!(registry.get(ProviderKind::Google).is_err());
        assert!(matches!(
            registry.refresh(ProviderKind::Google, "r").await,
            Err(TernError::ProviderRejected(_))
        ));
    }
}
