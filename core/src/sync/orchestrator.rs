//! Single-account sync runs

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::account::{Account, SyncCursor, SyncStatus};
use crate::config::SyncConfig;
use crate::error::{TernError, TernResult};
use crate::provider::{ListRequest, MailProvider, ProviderFactory, Sleeper};
use crate::storage::{BatchReport, Database};

use super::TokenSource;

/// Prefix of `last_sync_error` for accounts that must be linked again
pub const REAUTH_REQUIRED: &str = "Reauthorization required:";

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    TokenCheck,
    /// Fetching the given page (1-based)
    Fetching(u32),
    /// Persisting the given page
    Persisting(u32),
    Completed,
    Failed,
}

/// Tunables of a run
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub page_size: u32,
    pub page_delay: Duration,
    pub initial_sync_days: u32,
    pub run_timeout: Duration,
}

impl RunSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            page_delay: config.page_delay(),
            initial_sync_days: config.initial_sync_days,
            run_timeout: config.run_timeout(),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub account_id: String,
    /// Messages persisted (inserted or updated)
    pub messages_processed: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Messages rolled back by the store
    pub failed: usize,
    /// Messages the provider returned that could not be normalized
    pub malformed: usize,
    pub pages: u32,
    /// Resting delta token stored at the end of the run
    pub new_cursor: Option<String>,
    /// The run started without a delta token
    pub bootstrap: bool,
    /// An expired cursor forced a restart as a bootstrap
    pub restarted: bool,
}

impl SyncOutcome {
    fn record(&mut self, report: BatchReport, malformed: usize) {
        self.inserted += report.inserted;
        self.updated += report.updated;
        self.failed += report.failed;
        self.messages_processed += report.persisted();
        self.malformed += malformed;
        self.pages += 1;
    }
}

/// Runs one sync for one account: token check, then page by page fetch and
/// persist, storing the cursor after each persisted page.
///
/// Runs for the same account must not overlap; [`super::SyncManager`]
/// serializes them.
#[derive(Clone)]
pub struct SyncOrchestrator {
    db: Database,
    tokens: Arc<dyn TokenSource>,
    providers: Arc<dyn ProviderFactory>,
    sleeper: Arc<dyn Sleeper>,
    settings: RunSettings,
    phases: Arc<DashMap<String, SyncPhase>>,
}

impl SyncOrchestrator {
    pub fn new(
        db: Database,
        tokens: Arc<dyn TokenSource>,
        providers: Arc<dyn ProviderFactory>,
        sleeper: Arc<dyn Sleeper>,
        settings: RunSettings,
    ) -> Self {
        Self {
            db,
            tokens,
            providers,
            sleeper,
            settings,
            phases: Arc::new(DashMap::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn providers(&self) -> &Arc<dyn ProviderFactory> {
        &self.providers
    }

    pub fn tokens(&self) -> &Arc<dyn TokenSource> {
        &self.tokens
    }

    /// Current phase of the account's run, `Idle` when none ran yet
    pub fn phase(&self, account_id: &str) -> SyncPhase {
        self.phases.get(account_id).map(|p| *p).unwrap_or(SyncPhase::Idle)
    }

    fn set_phase(&self, account_id: &str, phase: SyncPhase) {
        debug!(account_id, ?phase, "Sync phase");
        self.phases.insert(account_id.to_string(), phase);
    }

    /// Sync one account to completion
    pub async fn perform_sync(&self, account_id: &str) -> TernResult<SyncOutcome> {
        self.perform_sync_until(account_id, CancellationToken::new()).await
    }

    /// Sync one account, giving up when `cancel` fires or the run timeout
    /// elapses. Pages persisted before that stay persisted.
    pub async fn perform_sync_until(&self, account_id: &str, cancel: CancellationToken) -> TernResult<SyncOutcome> {
        let account = self.db.require_account(account_id).await?;
        self.db
            .update_sync_status(account_id, SyncStatus::Running, None)
            .await?;

        let started = Instant::now();
        let budget = self.settings.run_timeout;
        let run_id = Uuid::new_v4();
        let run = self.run(&account).instrument(info_span!("sync_run", %run_id, account_id));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TernError::Cancelled(account_id.to_string())),
            result = tokio::time::timeout(budget, run) => {
                result.unwrap_or_else(|_| Err(TernError::Timeout(budget)))
            }
        };

        match &result {
            Ok(outcome) => {
                self.set_phase(account_id, SyncPhase::Completed);
                self.db
                    .update_sync_status(account_id, SyncStatus::Succeeded, None)
                    .await?;
                info!(
                    account_id,
                    %run_id,
                    messages = outcome.messages_processed,
                    pages = outcome.pages,
                    failed = outcome.failed,
                    malformed = outcome.malformed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Sync completed"
                );
            }
            Err(e) => {
                self.set_phase(account_id, SyncPhase::Failed);
                let message = if e.is_auth_error() {
                    format!("{} {}", REAUTH_REQUIRED, e)
                } else {
                    e.to_string()
                };
                if let Err(status_err) = self
                    .db
                    .update_sync_status(account_id, SyncStatus::Failed, Some(&message))
                    .await
                {
                    warn!(account_id, "Failed to record sync failure: {}", status_err);
                }
                error!(account_id, %run_id, "Sync failed: {}", message);
            }
        }

        result
    }

    async fn run(&self, account: &Account) -> TernResult<SyncOutcome> {
        self.set_phase(&account.id, SyncPhase::TokenCheck);
        let token = self.tokens.access_token(&account.id).await?;
        let provider = self.providers.create(account.provider, &token)?;

        let mut outcome = SyncOutcome {
            account_id: account.id.clone(),
            bootstrap: account.cursor.delta_token.is_none(),
            ..Default::default()
        };

        let result = self
            .fetch_pages(account, provider.as_ref(), account.cursor.clone(), &mut outcome)
            .await;

        let cursor = match result {
            Err(TernError::CursorExpired(reason)) if !account.cursor.is_bootstrap() => {
                warn!(account_id = %account.id, "Cursor expired ({}), restarting as a bootstrap", reason);
                self.db.reset_cursor(&account.id).await?;
                outcome.restarted = true;
                outcome.bootstrap = true;
                self.fetch_pages(account, provider.as_ref(), SyncCursor::default(), &mut outcome)
                    .await?
            }
            other => other?,
        };

        outcome.new_cursor = cursor.delta_token;
        Ok(outcome)
    }

    /// Page through the provider from `cursor` until no page token remains
    async fn fetch_pages(
        &self,
        account: &Account,
        provider: &dyn MailProvider,
        mut cursor: SyncCursor,
        outcome: &mut SyncOutcome,
    ) -> TernResult<SyncCursor> {
        let since = cursor.delta_token.is_none().then(|| {
            OffsetDateTime::now_utc() - time::Duration::days(self.settings.initial_sync_days as i64)
        });
        let mut page_no = 0u32;

        loop {
            page_no += 1;
            self.set_phase(&account.id, SyncPhase::Fetching(page_no));

            let request = ListRequest {
                query: None,
                page_token: cursor.page_token.clone(),
                cursor: cursor.delta_token.clone(),
                page_size: self.settings.page_size,
                since,
            };
            let page = provider.list_messages(&request).await?;

            if page.next_page_token.is_some() && page.next_page_token == request.page_token {
                return Err(TernError::invalid_state(format!(
                    "{} repeated page token on page {}",
                    provider.kind(),
                    page_no
                )));
            }

            self.set_phase(&account.id, SyncPhase::Persisting(page_no));
            let report = self.db.persist_batch(&account.id, &page.messages).await?;
            outcome.record(report, page.malformed);

            let pending = page.next_cursor.or(cursor.pending_delta_token.take());
            cursor = match page.next_page_token {
                Some(next) => SyncCursor {
                    delta_token: cursor.delta_token.take(),
                    page_token: Some(next),
                    pending_delta_token: pending,
                },
                None => SyncCursor::resting(pending.or(cursor.delta_token.take())),
            };
            self.db.update_cursor(&account.id, &cursor).await?;

            info!(
                account_id = %account.id,
                page = page_no,
                inserted = report.inserted,
                updated = report.updated,
                failed = report.failed,
                "Page persisted"
            );

            if cursor.page_token.is_none() {
                return Ok(cursor);
            }
            self.sleeper.sleep(self.settings.page_delay).await;
        }
    }
}
