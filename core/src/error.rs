//! Error types for Tern Mail Core

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for Tern Mail operations
pub type TernResult<T> = Result<T, TernError>;

/// Main error type for Tern Mail
#[derive(Debug, thiserror::Error)]
pub enum TernError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to create data directory
    #[error("Failed to create data directory: {0}")]
    DataDirCreateFailed(PathBuf),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database migration error
    #[error("Database migration error: {0}")]
    DatabaseMigration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// Outgoing message construction errors
    #[error("Message build error: {0}")]
    MessageBuild(#[from] lettre::error::Error),

    /// Outgoing address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParsing(#[from] lettre::address::AddressError),

    /// The access token is expired or was rejected and cannot be refreshed
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// The provider refused the operation for the granted scopes
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The provider rejected a token refresh (e.g. revoked consent)
    #[error("Provider rejected token refresh: {0}")]
    ProviderRejected(String),

    /// Rate limited beyond the retry budget, or a transient failure
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider refused a request for a reason retries cannot fix
    #[error("Provider request failed ({status}): {message}")]
    ProviderRequest { status: u16, message: String },

    /// The stored delta cursor is no longer accepted by the provider
    #[error("Sync cursor expired: {0}")]
    CursorExpired(String),

    /// A single message could not be normalized
    #[error("Malformed message {id}: {reason}")]
    MalformedMessage { id: String, reason: String },

    /// A single entity failed to upsert
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Another run for the same account holds the account lock
    #[error("Sync already in progress for account {0}")]
    SyncAlreadyInProgress(String),

    /// The run was cancelled or exceeded its time budget
    #[error("Sync cancelled: {0}")]
    Cancelled(String),

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TernError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new auth-expired error
    pub fn auth_expired(msg: impl Into<String>) -> Self {
        Self::AuthExpired(msg.into())
    }

    /// Create a new provider-unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable(msg.into())
    }

    /// Create a new malformed-message error
    pub fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Check if this is an authentication error
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired(_) | Self::PermissionDenied(_) | Self::ProviderRejected(_)
        )
    }
}
