//! Tern Mail Core Library
//!
//! This crate contains the sync engine for Tern Mail, including:
//! - Domain models (Account, canonical EmailMessage)
//! - Provider adapters (Gmail, Microsoft Graph, Aurinko) and the resilient request executor
//! - Message normalization
//! - Storage layer (SQLite database, idempotent batch persistence)
//! - Sync orchestration and the per-account sync manager

pub mod account;
pub mod config;
pub mod error;
pub mod message;
pub mod normalize;
pub mod provider;
pub mod storage;
pub mod sync;

// Re-export commonly used types
pub use account::{Account, ProviderKind, ProviderTokens, SyncCursor, SyncStatus, UserIdentity};
pub use config::Config;
pub use error::{TernError, TernResult};
pub use message::{AttachmentMeta, EmailAddress, EmailMessage, LabelSet, SendParams, SentMessage, SystemLabel, ThreadFolder};
pub use provider::{HttpProviderFactory, MailProvider, ProviderFactory};
pub use storage::{BatchReport, Database};
pub use sync::{SyncManager, SyncOrchestrator, SyncOutcome, TokenSource};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Tern Mail";

/// Default configuration directory name
pub const CONFIG_DIR_NAME: &str = "tern-mail";

/// Default database filename
pub const DB_FILENAME: &str = "tern-mail.db";

/// Default sync interval in seconds (5 minutes)
pub const DEFAULT_SYNC_INTERVAL: u64 = 300;

/// Gmail OAuth scopes
pub const GMAIL_OAUTH_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.modify",
];

/// Microsoft Graph OAuth scopes
pub const GRAPH_OAUTH_SCOPES: &[&str] = &[
    "offline_access",
    "User.Read",
    "Mail.ReadWrite",
    "Mail.Send",
];

/// Get the default configuration directory
pub fn get_config_dir() -> TernResult<std::path::PathBuf> {
    let config_dir = std::env::var("TERN_CONFIG_DIR")
        .map(std::path::PathBuf::from)
        .or_else(|_| {
            directories::ProjectDirs::from("", "", CONFIG_DIR_NAME)
                .map(|dirs| dirs.config_dir().to_path_buf())
                .ok_or(std::env::VarError::NotPresent)
        })
        .unwrap_or_else(|_| std::path::PathBuf::from("~/.config/tern-mail"));

    Ok(config_dir)
}

/// Get the default data directory
pub fn get_data_dir() -> TernResult<std::path::PathBuf> {
    let data_dir = std::env::var("TERN_DATA_DIR")
        .map(std::path::PathBuf::from)
        .or_else(|_| {
            directories::ProjectDirs::from("", "", CONFIG_DIR_NAME)
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or(std::env::VarError::NotPresent)
        })
        .unwrap_or_else(|_| std::path::PathBuf::from("~/.local/share/tern-mail"));

    std::fs::create_dir_all(&data_dir).map_err(|_| TernError::DataDirCreateFailed(data_dir.clone()))?;

    Ok(data_dir)
}
