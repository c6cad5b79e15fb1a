//! Account model for Tern Mail

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{TernError, TernResult};

/// Mail providers an account can be linked to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Gmail REST API
    Google,
    /// Microsoft Graph
    Microsoft,
    /// Aurinko unified mail API
    Aurinko,
}

impl ProviderKind {
    /// Tag stored in the database and used in account ids
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Microsoft => "microsoft",
            ProviderKind::Aurinko => "aurinko",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = TernError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" | "gmail" => Ok(ProviderKind::Google),
            "microsoft" | "graph" | "outlook" => Ok(ProviderKind::Microsoft),
            "aurinko" => Ok(ProviderKind::Aurinko),
            other => Err(TernError::validation(format!("Unknown provider: {}", other))),
        }
    }
}

/// Outcome of the most recent sync run, visible to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Never synced
    Idle,
    /// A run is in progress
    Running,
    /// Last run completed
    Succeeded,
    /// Last run failed, see `last_sync_error`
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Running => "running",
            SyncStatus::Succeeded => "succeeded",
            SyncStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = TernError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "running" => Ok(SyncStatus::Running),
            "succeeded" => Ok(SyncStatus::Succeeded),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(TernError::validation(format!("Unknown sync status: {}", other))),
        }
    }
}

/// Resume point for incremental sync.
///
/// `delta_token` is the provider token left behind by the last completed run.
/// While a run is in flight, `page_token` and `pending_delta_token` record how
/// far it got so an interrupted run resumes at the first unpersisted page.
/// The tokens are opaque and provider specific.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub delta_token: Option<String>,
    pub page_token: Option<String>,
    pub pending_delta_token: Option<String>,
}

impl SyncCursor {
    /// A cursor for a run that finished on its last page
    pub fn resting(delta_token: Option<String>) -> Self {
        Self {
            delta_token,
            page_token: None,
            pending_delta_token: None,
        }
    }

    /// No resume point at all: the next run is a full bootstrap
    pub fn is_bootstrap(&self) -> bool {
        self.delta_token.is_none() && self.page_token.is_none()
    }

    /// True when a previous run stopped between pages
    pub fn is_mid_run(&self) -> bool {
        self.page_token.is_some()
    }
}

/// The authenticated caller, as supplied by the identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub primary_email: String,
}

/// Tokens handed over by an OAuth callback
#[derive(Debug, Clone)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

/// One external mailbox connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// `{provider}_{address}`
    pub id: String,
    /// Owning user id from the identity provider
    pub user_id: String,
    pub provider: ProviderKind,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    /// Mailbox address, lowercased
    pub email: String,
    pub display_name: String,
    pub cursor: SyncCursor,
    pub sync_status: SyncStatus,
    pub last_sync_error: Option<String>,
    pub last_synced_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Account {
    /// Build a freshly linked account
    pub fn new(
        owner: &UserIdentity,
        provider: ProviderKind,
        email: &str,
        display_name: Option<String>,
        tokens: ProviderTokens,
    ) -> TernResult<Self> {
        let email = email.trim().to_lowercase();
        if !email_address::EmailAddress::is_valid(&email) {
            return Err(TernError::validation(format!("Invalid mailbox address: {}", email)));
        }
        if tokens.access_token.is_empty() {
            return Err(TernError::validation("Access token is empty"));
        }

        let now = OffsetDateTime::now_utc();
        Ok(Self {
            id: Self::derive_id(provider, &email),
            user_id: owner.user_id.clone(),
            provider,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
            display_name: display_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| email.clone()),
            email,
            cursor: SyncCursor::default(),
            sync_status: SyncStatus::Idle,
            last_sync_error: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Stable account id for a provider mailbox
    pub fn derive_id(provider: ProviderKind, email: &str) -> String {
        format!("{}_{}", provider.as_str(), email.trim().to_lowercase())
    }
}
