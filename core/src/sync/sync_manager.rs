//! Sync manager: per-account serialization, scheduling and account linking

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::account::{Account, ProviderKind, ProviderTokens, UserIdentity};
use crate::config::SyncConfig;
use crate::error::{TernError, TernResult};
use crate::message::{SendParams, SentMessage};

use super::{SyncOrchestrator, SyncOutcome};

/// Sync statistics
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total sync operations
    pub total_syncs: u64,
    /// Successful syncs
    pub successful_syncs: u64,
    /// Failed syncs
    pub failed_syncs: u64,
    /// Total messages persisted
    pub total_messages_synced: u64,
    /// Last completed sync
    pub last_sync: Option<time::OffsetDateTime>,
}

/// State shared with spawned runs and the scheduler
struct Shared {
    orchestrator: SyncOrchestrator,
    /// One lock per account; holding it means a run is active or queued first
    locks: DashMap<String, Arc<Mutex<()>>>,
    running: DashMap<String, CancellationToken>,
    permits: Arc<Semaphore>,
    stats: RwLock<SyncStats>,
}

impl Shared {
    fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn sync_now(&self, account_id: &str) -> TernResult<SyncOutcome> {
        let guard = self
            .account_lock(account_id)
            .try_lock_owned()
            .map_err(|_| TernError::SyncAlreadyInProgress(account_id.to_string()))?;
        self.run_locked(account_id, guard).await
    }

    async fn enqueue(&self, account_id: &str) -> TernResult<SyncOutcome> {
        let guard = self.account_lock(account_id).lock_owned().await;
        self.run_locked(account_id, guard).await
    }

    async fn run_locked(&self, account_id: &str, _guard: OwnedMutexGuard<()>) -> TernResult<SyncOutcome> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TernError::invalid_state("Sync manager is shut down"))?;

        let cancel = CancellationToken::new();
        let running = RunningEntry::register(&self.running, account_id, cancel.clone());
        let result = self.orchestrator.perform_sync_until(account_id, cancel).await;
        drop(running);

        let mut stats = self.stats.write().await;
        stats.total_syncs += 1;
        match &result {
            Ok(outcome) => {
                stats.successful_syncs += 1;
                stats.total_messages_synced += outcome.messages_processed as u64;
                stats.last_sync = Some(time::OffsetDateTime::now_utc());
            }
            Err(_) => stats.failed_syncs += 1,
        }

        result
    }

    fn cancel_all(&self) {
        for entry in self.running.iter() {
            entry.value().cancel();
        }
    }
}

/// Registration of an active run, removed when the run ends or is dropped
struct RunningEntry<'a> {
    running: &'a DashMap<String, CancellationToken>,
    account_id: String,
}

impl<'a> RunningEntry<'a> {
    fn register(running: &'a DashMap<String, CancellationToken>, account_id: &str, cancel: CancellationToken) -> Self {
        running.insert(account_id.to_string(), cancel);
        Self {
            running,
            account_id: account_id.to_string(),
        }
    }
}

impl Drop for RunningEntry<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.account_id);
    }
}

/// Sync manager for coordinating all sync operations
pub struct SyncManager {
    shared: Arc<Shared>,
    /// Sync interval
    sync_interval: Duration,
    /// Background sync task handle
    background_task: Option<(JoinHandle<()>, CancellationToken)>,
}

impl SyncManager {
    /// Create a new sync manager
    pub fn new(orchestrator: SyncOrchestrator, config: &SyncConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                orchestrator,
                locks: DashMap::new(),
                running: DashMap::new(),
                permits: Arc::new(Semaphore::new(config.max_concurrent_syncs.max(1))),
                stats: RwLock::new(SyncStats::default()),
            }),
            sync_interval: config.interval(),
            background_task: None,
        }
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.shared.orchestrator
    }

    /// Run a sync right away, failing with `SyncAlreadyInProgress` when the
    /// account is already syncing
    pub async fn sync_now(&self, account_id: &str) -> TernResult<SyncOutcome> {
        self.shared.sync_now(account_id).await
    }

    /// Run a sync once any earlier run of the account has finished
    pub async fn enqueue(&self, account_id: &str) -> TernResult<SyncOutcome> {
        self.shared.enqueue(account_id).await
    }

    /// Queue a sync on a background task
    pub fn enqueue_background(&self, account_id: &str) -> JoinHandle<TernResult<SyncOutcome>> {
        let shared = self.shared.clone();
        let account_id = account_id.to_string();
        tokio::spawn(async move { shared.enqueue(&account_id).await })
    }

    /// Whether a run of the account is executing now
    pub fn is_running(&self, account_id: &str) -> bool {
        self.shared.running.contains_key(account_id)
    }

    /// Cancel the account's active run. Returns false when none is running.
    pub fn cancel(&self, account_id: &str) -> bool {
        match self.shared.running.get(account_id) {
            Some(token) => {
                info!(account_id, "Cancelling sync");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Register an account from an OAuth callback and queue its first sync.
    ///
    /// The mailbox address comes from the provider profile. The returned
    /// account is saved even when the queued sync later fails.
    pub async fn link_account(
        &self,
        owner: &UserIdentity,
        provider: ProviderKind,
        tokens: ProviderTokens,
    ) -> TernResult<Account> {
        let orchestrator = &self.shared.orchestrator;
        let profile = orchestrator
            .providers()
            .create(provider, &tokens.access_token)?
            .get_profile()
            .await?;

        let account = Account::new(owner, provider, &profile.email, profile.display_name, tokens)?;
        let account = orchestrator.database().upsert_account(&account).await?;
        info!(account_id = %account.id, user_id = %owner.user_id, "Linked account");

        let handle = self.enqueue_background(&account.id);
        let account_id = account.id.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(outcome)) => debug!(account_id = %account_id, messages = outcome.messages_processed, "Initial sync done"),
                Ok(Err(e)) => warn!(account_id = %account_id, "Initial sync failed: {}", e),
                Err(e) => error!(account_id = %account_id, "Initial sync task panicked: {}", e),
            }
        });

        Ok(account)
    }

    /// Send a message through the account's provider
    pub async fn send_message(&self, account_id: &str, params: &SendParams) -> TernResult<SentMessage> {
        let orchestrator = &self.shared.orchestrator;
        let account = orchestrator.database().require_account(account_id).await?;
        let token = orchestrator.tokens().access_token(account_id).await?;
        let provider = orchestrator.providers().create(account.provider, &token)?;

        let sent = provider.send_message(params).await?;
        info!(account_id, id = ?sent.id, "Message sent");
        Ok(sent)
    }

    /// Start background sync
    pub fn start_background_sync(&mut self) -> TernResult<()> {
        if self.background_task.is_some() {
            return Err(TernError::invalid_state("Background sync already running"));
        }

        let shared = self.shared.clone();
        let sync_interval = self.sync_interval;
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();

        let task = tokio::spawn(async move {
            let mut interval = interval(sync_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let accounts = match shared.orchestrator.database().list_accounts(None).await {
                    Ok(accounts) => accounts,
                    Err(e) => {
                        error!("Failed to list accounts for background sync: {}", e);
                        continue;
                    }
                };

                let runs = accounts.iter().map(|account| shared.sync_now(&account.id));
                let results = futures::future::join_all(runs).await;

                for (account, result) in accounts.iter().zip(results) {
                    match result {
                        Ok(_) => {}
                        Err(TernError::SyncAlreadyInProgress(_)) => {
                            debug!(account_id = %account.id, "Skipping scheduled sync, already running")
                        }
                        Err(e) => warn!(account_id = %account.id, "Scheduled sync failed: {}", e),
                    }
                }
            }
        });

        self.background_task = Some((task, shutdown));
        info!("Started background sync with interval: {:?}", sync_interval);
        Ok(())
    }

    /// Stop background sync, cancelling runs in flight
    pub async fn stop_background_sync(&mut self) -> TernResult<()> {
        if let Some((task, shutdown)) = self.background_task.take() {
            shutdown.cancel();
            self.shared.cancel_all();
            if let Err(e) = task.await {
                warn!("Background sync task ended abnormally: {}", e);
            }
            info!("Stopped background sync");
        }
        Ok(())
    }

    /// Get sync statistics
    pub async fn get_stats(&self) -> SyncStats {
        self.shared.stats.read().await.clone()
    }

    #[cfg(test)]
    fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.shared.account_lock(account_id)
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if let Some((task, shutdown)) = self.background_task.take() {
            shutdown.cancel();
            task.abort();
        }
    }
}
