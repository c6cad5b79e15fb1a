//! Sync engine for Tern Mail

pub mod orchestrator;
pub mod sync_manager;

pub use orchestrator::{RunSettings, SyncOrchestrator, SyncOutcome, SyncPhase, REAUTH_REQUIRED};
pub use sync_manager::SyncManager;

use crate::error::TernResult;

/// Supplies a valid access token for an account, refreshing it when needed
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, account_id: &str) -> TernResult<String>;
}
