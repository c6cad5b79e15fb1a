//! Wiring of the Tern Mail sync engine

use std::sync::Arc;

use tern_core::config::Config;
use tern_core::error::TernResult;
use tern_core::provider::TokioSleeper;
use tern_core::sync::RunSettings;
use tern_core::{Database, HttpProviderFactory, SyncManager, SyncOrchestrator};
use tern_oauth::{OAuthRegistry, TokenManager};
use tracing::info;

/// Main application structure
pub struct TernApp {
    /// Application configuration
    config: Config,
    /// Mail store
    db: Database,
    /// OAuth clients of the configured providers
    oauth: Arc<OAuthRegistry>,
    /// Sync manager
    sync_manager: SyncManager,
}

impl TernApp {
    /// Open the store and assemble the sync engine
    pub async fn new(config: Config) -> TernResult<Self> {
        info!("Initializing Tern Mail");
        config.validate()?;

        let db = Database::open(&config.database_file_path()).await?;
        db.initialize().await?;

        let oauth = Arc::new(OAuthRegistry::from_config(&config)?);
        let tokens = Arc::new(TokenManager::new(
            db.clone(),
            oauth.clone(),
            config.sync.refresh_margin(),
        ));
        let providers = Arc::new(HttpProviderFactory::new(&config)?);

        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            tokens,
            providers,
            Arc::new(TokioSleeper),
            RunSettings::from_config(&config.sync),
        );
        let sync_manager = SyncManager::new(orchestrator, &config.sync);

        Ok(Self {
            config,
            db,
            oauth,
            sync_manager,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn oauth(&self) -> &OAuthRegistry {
        &self.oauth
    }

    pub fn sync_manager(&self) -> &SyncManager {
        &self.sync_manager
    }

    pub fn sync_manager_mut(&mut self) -> &mut SyncManager {
        &mut self.sync_manager
    }
}
