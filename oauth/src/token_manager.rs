//! Token management for OAuth2

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tern_core::error::{TernError, TernResult};
use tern_core::sync::TokenSource;
use tern_core::{Account, Database, ProviderKind};
use tokio::sync::Mutex;

use crate::OAuthToken;

/// Exchanges a refresh token for a new access token
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, provider: ProviderKind, refresh_token: &str) -> TernResult<OAuthToken>;
}

/// Hands out valid access tokens, refreshing and persisting them on the
/// account shortly before they expire
pub struct TokenManager {
    db: Database,
    refresher: Arc<dyn TokenRefresher>,
    /// Refresh tokens expiring within this margin
    margin: time::Duration,
    /// Serializes refreshes per account
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenManager {
    /// Create a new token manager
    pub fn new(db: Database, refresher: Arc<dyn TokenRefresher>, margin: std::time::Duration) -> Self {
        Self {
            db,
            refresher,
            margin: time::Duration::seconds(margin.as_secs() as i64),
            refresh_locks: DashMap::new(),
        }
    }

    fn needs_refresh(&self, account: &Account) -> bool {
        token_of(account).expires_within(self.margin)
    }

    /// A valid access token for the account
    pub async fn get_access_token(&self, account_id: &str) -> TernResult<String> {
        let account = self.db.require_account(account_id).await?;
        if !self.needs_refresh(&account) {
            return Ok(account.access_token);
        }

        let lock = self
            .refresh_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited
        let account = self.db.require_account(account_id).await?;
        if !self.needs_refresh(&account) {
            return Ok(account.access_token);
        }

        let Some(refresh_token) = account.refresh_token.as_deref() else {
            if token_of(&account).is_expired() {
                return Err(TernError::auth_expired(format!(
                    "Access token of {} expired and no refresh token is stored",
                    account_id
                )));
            }
            return Ok(account.access_token);
        };

        tracing::debug!(account_id, "Refreshing access token");
        let token = self
            .refresher
            .refresh(account.provider, refresh_token)
            .await
            .map_err(|e| match e {
                TernError::ProviderRejected(_) => e,
                other => TernError::ProviderRejected(other.to_string()),
            })?;

        self.db
            .update_tokens(account_id, &token.access_token, token.refresh_token.as_deref(), token.expires_at)
            .await?;
        tracing::info!(account_id, "Access token refreshed");

        Ok(token.access_token)
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn access_token(&self, account_id: &str) -> TernResult<String> {
        self.get_access_token(account_id).await
    }
}

fn token_of(account: &Account) -> OAuthToken {
    OAuthToken {
        access_token: account.access_token.clone(),
        refresh_token: account.refresh_token.clone(),
        expires_at: account.expires_at,
        scope: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider_oauth::{OAuthRegistry, ProviderOAuth};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tern_core::config::{OAuthClientConfig, ProvidersConfig};
    use tern_core::{ProviderTokens, UserIdentity};
    use time::OffsetDateTime;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ACCOUNT: &str = "google_jane@example.com";

    /// Refresher that counts calls and hands out numbered tokens
    #[derive(Default)]
    struct CountingRefresher {
        calls: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _provider: ProviderKind, _refresh_token: &str) -> TernResult<OAuthToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.reject {
                return Err(TernError::unavailable("token endpoint unreachable"));
            }
            Ok(OAuthToken {
                access_token: format!("access-{}", n + 1),
                refresh_token: None,
                expires_at: Some(OffsetDateTime::now_utc() + time::Duration::hours(1)),
                scope: None,
            })
        }
    }

    async fn database_with(expires_at: Option<OffsetDateTime>, refresh_token: Option<&str>) -> Database {
        let db = Database::open_in_memory().await.unwrap();
        db.initialize().await.unwrap();

        let owner = UserIdentity {
            user_id: "user_1".into(),
            primary_email: "jane@example.com".into(),
        };
        let tokens = ProviderTokens {
            access_token: "access-1".into(),
            refresh_token: refresh_token.map(String::from),
            expires_at,
        };
        let account = Account::new(&owner, ProviderKind::Google, "jane@example.com", None, tokens).unwrap();
        db.upsert_account(&account).await.unwrap();
        db
    }

    fn manager(db: Database, refresher: Arc<dyn TokenRefresher>) -> TokenManager {
        TokenManager::new(db, refresher, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_valid_token_is_returned_as_is() {
        let db = database_with(Some(OffsetDateTime::now_utc() + time::Duration::hours(1)), Some("refresh-1")).await;
        let refresher = Arc::new(CountingRefresher::default());
        let tokens = manager(db, refresher.clone());

        assert_eq!(tokens.access_token(ACCOUNT).await.unwrap(), "access-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_token_without_expiry_is_valid() {
        let db = database_with(None, None).await;
        let tokens = manager(db, Arc::new(CountingRefresher::default()));
        assert_eq!(tokens.access_token(ACCOUNT).await.unwrap(), "access-1");
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let db = database_with(Some(OffsetDateTime::now_utc() + time::Duration::minutes(2)), Some("refresh-1")).await;
        let tokens = manager(db.clone(), Arc::new(CountingRefresher::default()));

        assert_eq!(tokens.access_token(ACCOUNT).await.unwrap(), "access-2");

        let account = db.require_account(ACCOUNT).await.unwrap();
        assert_eq!(account.access_token, "access-2");
        assert_eq!(account.refresh_token.as_deref(), Some("refresh-1"));
        assert!(account.expires_at.unwrap() > OffsetDateTime::now_utc() + time::Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_serialized() {
        let db = database_with(Some(OffsetDateTime::now_utc() - time::Duration::minutes(1)), Some("refresh-1")).await;
        let refresher = Arc::new(CountingRefresher::default());
        let tokens = manager(db, refresher.clone());

        let (a, b, c) = tokio::join!(
            tokens.access_token(ACCOUNT),
            tokens.access_token(ACCOUNT),
            tokens.access_token(ACCOUNT)
        );
        assert_eq!(a.unwrap(), "access-2");
        assert_eq!(b.unwrap(), "access-2");
        assert_eq!(c.unwrap(), "access-2");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token() {
        let db = database_with(Some(OffsetDateTime::now_utc() - time::Duration::minutes(1)), None).await;
        let tokens = manager(db, Arc::new(CountingRefresher::default()));

        let result = tokens.access_token(ACCOUNT).await;
        assert!(matches!(result, Err(TernError::AuthExpired(_))));
    }

    #[tokio::test]
    async fn test_expiring_soon_without_refresh_token_is_still_used() {
        let db = database_with(Some(OffsetDateTime::now_utc() + time::Duration::minutes(2)), None).await;
        let tokens = manager(db, Arc::new(CountingRefresher::default()));
        assert_eq!(tokens.access_token(ACCOUNT).await.unwrap(), "access-1");
    }

    #[tokio::test]
    async fn test_refresh_failure_is_provider_rejected() {
        let db = database_with(Some(OffsetDateTime::now_utc() - time::Duration::minutes(1)), Some("refresh-1")).await;
        let refresher = Arc::new(CountingRefresher {
            reject: true,
            ..Default::default()
        });
        let tokens = manager(db.clone(), refresher);

        let result = tokens.access_token(ACCOUNT).await;
        assert!(matches!(result, Err(TernError::ProviderRejected(_))));

        // The stored token is left untouched
        let account = db.require_account(ACCOUNT).await.unwrap();
        assert_eq!(account.access_token, "access-1");
    }

    #[tokio::test]
    async fn test_refresh_against_token_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "from-endpoint",
                "token_type": "Bearer",
                "expires_in": 3599
            })))
            .expect(1)
            .mount(&server)
            .await;

        let providers = ProvidersConfig {
            google_token_url: format!("{}/token", server.uri()),
            ..ProvidersConfig::default()
        };
        let client = OAuthClientConfig {
            client_id: "google-client".into(),
            client_secret: "secret".into(),
            redirect_uri: String::new(),
        };
        let mut registry = OAuthRegistry::default();
        registry.insert(ProviderOAuth::new(ProviderKind::Google, &client, &providers).unwrap());

        let db = database_with(Some(OffsetDateTime::now_utc() + time::Duration::seconds(30)), Some("refresh-1")).await;
        let tokens = manager(db.clone(), Arc::new(registry));

        assert_eq!(tokens.access_token(ACCOUNT).await.unwrap(), "from-endpoint");
        let account = db.require_account(ACCOUNT).await.unwrap();
        assert_eq!(account.refresh_token.as_deref(), Some("refresh-1"));
    }
}
