//! Database layer for Tern Mail

use crate::account::{Account, SyncCursor, SyncStatus};
use crate::error::{TernError, TernResult};
use crate::message::{AttachmentMeta, EmailAddress, EmailMessage, LabelSet, ThreadFolder};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;

const ACCOUNT_COLUMNS: &str = "id, user_id, provider, access_token, refresh_token, expires_at, email, display_name,
     delta_token, page_token, pending_delta_token, sync_status, last_sync_error, last_synced_at,
     created_at, updated_at";

/// Rows removed by a purge or an account deletion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub attachments: usize,
    pub recipients: usize,
    pub emails: usize,
    pub threads: usize,
    pub addresses: usize,
    pub accounts: usize,
}

/// Stored mail volume of one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailCounts {
    pub emails: usize,
    pub threads: usize,
    pub addresses: usize,
    pub attachments: usize,
}

/// A conversation as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    pub id: String,
    pub subject: String,
    pub last_message_at: OffsetDateTime,
    pub message_count: usize,
    pub folder: ThreadFolder,
}

const THREAD_COLUMNS: &str = "t.id, t.subject, t.last_message_at,
     (SELECT COUNT(*) FROM emails e WHERE e.account_id = t.account_id AND e.thread_id = t.id),
     t.inbox_status, t.junk_status, t.draft_status";

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    pub(super) connection: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file
    pub async fn open(database_path: &Path) -> TernResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let connection = Connection::open(database_path)?;

        // WAL lets readers proceed while a sync writes
        let _mode: String = connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;
        connection.pragma_update(None, "foreign_keys", true)?;

        Ok(Self::from_connection(connection))
    }

    /// A private in-memory database, used by tests and dry runs
    pub async fn open_in_memory() -> TernResult<Self> {
        let connection = Connection::open_in_memory()?;
        connection.pragma_update(None, "foreign_keys", true)?;
        Ok(Self::from_connection(connection))
    }

    fn from_connection(connection: Connection) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
        }
    }

    /// Initialize the database (run migrations)
    pub async fn initialize(&self) -> TernResult<()> {
        let mut migration_manager = crate::storage::migrations::MigrationManager::new(self.connection.clone());
        migration_manager.run_migrations().await
    }

    // Account operations

    /// Insert a linked account, or refresh the tokens and display name of an
    /// existing one. Cursor and sync status of an existing account are kept.
    pub async fn upsert_account(&self, account: &Account) -> TernResult<Account> {
        let conn = self.connection.lock().await;

        let owner: Option<String> = conn
            .query_row("SELECT user_id FROM accounts WHERE id = ?", [&account.id], |row| row.get(0))
            .optional()?;
        if let Some(owner) = owner {
            if owner != account.user_id {
                return Err(TernError::invalid_state(format!(
                    "Account {} is linked by another user",
                    account.id
                )));
            }
        }

        conn.execute(
            "INSERT INTO accounts (id, user_id, provider, access_token, refresh_token, expires_at, email, display_name,
                 delta_token, page_token, pending_delta_token, sync_status, last_sync_error, last_synced_at,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                 access_token = excluded.access_token,
                 refresh_token = COALESCE(excluded.refresh_token, accounts.refresh_token),
                 expires_at = excluded.expires_at,
                 display_name = excluded.display_name,
                 updated_at = excluded.updated_at",
            params![
                account.id,
                account.user_id,
                account.provider.as_str(),
                account.access_token,
                account.refresh_token,
                account.expires_at.map(|dt| dt.unix_timestamp()),
                account.email,
                account.display_name,
                account.cursor.delta_token,
                account.cursor.page_token,
                account.cursor.pending_delta_token,
                account.sync_status.as_str(),
                account.last_sync_error,
                account.last_synced_at.map(|dt| dt.unix_timestamp()),
                account.created_at.unix_timestamp(),
                account.updated_at.unix_timestamp(),
            ],
        )?;

        let sql = format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS);
        let stored = conn.query_row(&sql, [&account.id], row_to_account)?;
        Ok(stored)
    }

    /// Get an account by ID
    pub async fn get_account(&self, account_id: &str) -> TernResult<Option<Account>> {
        let conn = self.connection.lock().await;
        let sql = format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS);
        let account = conn.query_row(&sql, [account_id], row_to_account).optional()?;
        Ok(account)
    }

    /// Get an account by ID, failing with `NotFound` when it does not exist
    pub async fn require_account(&self, account_id: &str) -> TernResult<Account> {
        self.get_account(account_id)
            .await?
            .ok_or_else(|| TernError::not_found(format!("Account {}", account_id)))
    }

    /// All accounts, optionally restricted to one owner
    pub async fn list_accounts(&self, user_id: Option<&str>) -> TernResult<Vec<Account>> {
        let conn = self.connection.lock().await;

        let accounts = match user_id {
            Some(user_id) => {
                let sql = format!(
                    "SELECT {} FROM accounts WHERE user_id = ? ORDER BY created_at, id",
                    ACCOUNT_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([user_id], row_to_account)?;
                rows.collect::<SqliteResult<Vec<_>>>()?
            }
            None => {
                let sql = format!("SELECT {} FROM accounts ORDER BY created_at, id", ACCOUNT_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], row_to_account)?;
                rows.collect::<SqliteResult<Vec<_>>>()?
            }
        };

        Ok(accounts)
    }

    /// Store refreshed credentials. A missing refresh token keeps the stored one.
    pub async fn update_tokens(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<OffsetDateTime>,
    ) -> TernResult<()> {
        let conn = self.connection.lock().await;
        let changed = conn.execute(
            "UPDATE accounts SET access_token = ?, refresh_token = COALESCE(?, refresh_token), expires_at = ?,
                 updated_at = ?
             WHERE id = ?",
            params![
                access_token,
                refresh_token,
                expires_at.map(|dt| dt.unix_timestamp()),
                OffsetDateTime::now_utc().unix_timestamp(),
                account_id,
            ],
        )?;
        ensure_changed(changed, account_id)
    }

    /// Store the sync cursor
    pub async fn update_cursor(&self, account_id: &str, cursor: &SyncCursor) -> TernResult<()> {
        let conn = self.connection.lock().await;
        let changed = conn.execute(
            "UPDATE accounts SET delta_token = ?, page_token = ?, pending_delta_token = ?, updated_at = ?
             WHERE id = ?",
            params![
                cursor.delta_token,
                cursor.page_token,
                cursor.pending_delta_token,
                OffsetDateTime::now_utc().unix_timestamp(),
                account_id,
            ],
        )?;
        ensure_changed(changed, account_id)
    }

    /// Clear the cursor so the next run bootstraps
    pub async fn reset_cursor(&self, account_id: &str) -> TernResult<()> {
        self.update_cursor(account_id, &SyncCursor::default()).await
    }

    /// Record a sync status transition. `last_synced_at` moves on success only.
    pub async fn update_sync_status(
        &self,
        account_id: &str,
        status: SyncStatus,
        error: Option<&str>,
    ) -> TernResult<()> {
        let conn = self.connection.lock().await;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let synced_at = (status == SyncStatus::Succeeded).then_some(now);

        let changed = conn.execute(
            "UPDATE accounts SET sync_status = ?, last_sync_error = ?,
                 last_synced_at = COALESCE(?, last_synced_at), updated_at = ?
             WHERE id = ?",
            params![status.as_str(), error, synced_at, now, account_id],
        )?;
        ensure_changed(changed, account_id)
    }

    /// Delete all stored mail of an account, keeping the account itself
    pub async fn purge_mail(&self, account_id: &str) -> TernResult<PurgeReport> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction()?;
        let report = delete_mail(&tx, account_id)?;
        tx.commit()?;

        tracing::info!(
            account_id,
            emails = report.emails,
            threads = report.threads,
            "Purged stored mail"
        );
        Ok(report)
    }

    /// Delete an account and everything it owns in one transaction
    pub async fn delete_account(&self, account_id: &str) -> TernResult<PurgeReport> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction()?;

        let mut report = delete_mail(&tx, account_id)?;
        report.accounts = tx.execute("DELETE FROM accounts WHERE id = ?", [account_id])?;
        if report.accounts == 0 {
            return Err(TernError::not_found(format!("Account {}", account_id)));
        }
        tx.commit()?;

        tracing::info!(account_id, emails = report.emails, "Deleted account");
        Ok(report)
    }

    // Mail queries

    /// Stored mail volume for an account
    pub async fn mail_counts(&self, account_id: &str) -> TernResult<MailCounts> {
        let conn = self.connection.lock().await;
        let count = |table: &str| -> SqliteResult<usize> {
            let sql = format!("SELECT COUNT(*) FROM {} WHERE account_id = ?", table);
            conn.query_row(&sql, [account_id], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        };

        Ok(MailCounts {
            emails: count("emails")?,
            threads: count("threads")?,
            addresses: count("email_addresses")?,
            attachments: count("attachments")?,
        })
    }

    /// Load a stored message with its addresses and attachments
    pub async fn get_email(&self, account_id: &str, email_id: &str) -> TernResult<Option<EmailMessage>> {
        let conn = self.connection.lock().await;

        let email = conn
            .query_row(
                "SELECT e.id, e.thread_id, e.subject, e.body, e.snippet, e.sent_at, e.received_at, e.labels,
                        e.has_attachments, e.internet_message_id, e.in_reply_to, e.message_references, e.folder_id,
                        a.name, a.address, a.raw
                 FROM emails e JOIN email_addresses a ON a.id = e.from_address_id
                 WHERE e.account_id = ? AND e.id = ?",
                [account_id, email_id],
                row_to_email,
            )
            .optional()?;

        let Some(mut email) = email else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT r.kind, a.name, a.address, a.raw
             FROM email_recipients r JOIN email_addresses a ON a.id = r.address_id
             WHERE r.account_id = ? AND r.email_id = ?
             ORDER BY r.kind, r.position",
        )?;
        let recipients = stmt.query_map([account_id, email_id], |row| {
            Ok((row.get::<_, String>(0)?, row_to_address(row, 1)?))
        })?;
        for recipient in recipients {
            let (kind, address) = recipient?;
            match kind.as_str() {
                "to" => email.to.push(address),
                "cc" => email.cc.push(address),
                "bcc" => email.bcc.push(address),
                "reply_to" => email.reply_to.push(address),
                other => tracing::warn!("Unknown recipient kind {} on {}", other, email_id),
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, name, mime_type, size, inline, content_id FROM attachments
             WHERE account_id = ? AND email_id = ? ORDER BY id",
        )?;
        let attachments = stmt.query_map([account_id, email_id], |row| {
            Ok(AttachmentMeta {
                id: row.get(0)?,
                name: row.get(1)?,
                mime_type: row.get(2)?,
                size: row.get::<_, i64>(3)? as u64,
                inline: row.get(4)?,
                content_id: row.get(5)?,
            })
        })?;
        email.attachments = attachments.collect::<SqliteResult<Vec<_>>>()?;

        Ok(Some(email))
    }

    /// Load a stored thread
    pub async fn get_thread(&self, account_id: &str, thread_id: &str) -> TernResult<Option<ThreadSummary>> {
        let conn = self.connection.lock().await;
        let thread = conn
            .query_row(
                &format!("SELECT {} FROM threads t WHERE t.account_id = ? AND t.id = ?", THREAD_COLUMNS),
                [account_id, thread_id],
                row_to_thread,
            )
            .optional()?;
        Ok(thread)
    }

    /// Threads listed under `folder`, most recent activity first
    pub async fn list_threads(&self, account_id: &str, folder: ThreadFolder, limit: usize) -> TernResult<Vec<ThreadSummary>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM threads t WHERE t.account_id = ? AND t.{} = 1
             ORDER BY t.last_message_at DESC LIMIT ?",
            THREAD_COLUMNS,
            folder.column()
        ))?;
        let threads = stmt
            .query_map(params![account_id, limit as i64], row_to_thread)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(threads)
    }

    /// Look up a stored address by its lowercased form
    pub async fn get_address(&self, account_id: &str, address: &str) -> TernResult<Option<EmailAddress>> {
        let conn = self.connection.lock().await;
        let address = conn
            .query_row(
                "SELECT name, address, raw FROM email_addresses WHERE account_id = ? AND address = ?",
                params![account_id, address.trim().to_lowercase()],
                |row| row_to_address(row, 0),
            )
            .optional()?;
        Ok(address)
    }
}

/// Delete an account's mail in ownership order
fn delete_mail(conn: &Connection, account_id: &str) -> SqliteResult<PurgeReport> {
    let attachments = conn.execute("DELETE FROM attachments WHERE account_id = ?", [account_id])?;
    let recipients = conn.execute("DELETE FROM email_recipients WHERE account_id = ?", [account_id])?;
    let emails = conn.execute("DELETE FROM emails WHERE account_id = ?", [account_id])?;
    let threads = conn.execute("DELETE FROM threads WHERE account_id = ?", [account_id])?;
    let addresses = conn.execute("DELETE FROM email_addresses WHERE account_id = ?", [account_id])?;

    Ok(PurgeReport {
        attachments,
        recipients,
        emails,
        threads,
        addresses,
        accounts: 0,
    })
}

fn ensure_changed(changed: usize, account_id: &str) -> TernResult<()> {
    if changed == 0 {
        return Err(TernError::not_found(format!("Account {}", account_id)));
    }
    Ok(())
}

fn conversion_error(idx: usize, ty: Type, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

pub(super) fn timestamp(row: &Row, idx: usize) -> SqliteResult<OffsetDateTime> {
    let secs: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| conversion_error(idx, Type::Integer, e))
}

fn optional_timestamp(row: &Row, idx: usize) -> SqliteResult<Option<OffsetDateTime>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => timestamp(row, idx).map(Some),
        None => Ok(None),
    }
}

fn row_to_account(row: &Row) -> SqliteResult<Account> {
    let provider: String = row.get(2)?;
    let status: String = row.get(11)?;

    Ok(Account {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: provider.parse().map_err(|e| conversion_error(2, Type::Text, e))?,
        access_token: row.get(3)?,
        refresh_token: row.get(4)?,
        expires_at: optional_timestamp(row, 5)?,
        email: row.get(6)?,
        display_name: row.get(7)?,
        cursor: SyncCursor {
            delta_token: row.get(8)?,
            page_token: row.get(9)?,
            pending_delta_token: row.get(10)?,
        },
        sync_status: status.parse().map_err(|e| conversion_error(11, Type::Text, e))?,
        last_sync_error: row.get(12)?,
        last_synced_at: optional_timestamp(row, 13)?,
        created_at: timestamp(row, 14)?,
        updated_at: timestamp(row, 15)?,
    })
}

fn row_to_thread(row: &Row) -> SqliteResult<ThreadSummary> {
    let folder = if row.get(4)? {
        ThreadFolder::Inbox
    } else if row.get(5)? {
        ThreadFolder::Junk
    } else if row.get(6)? {
        ThreadFolder::Draft
    } else {
        ThreadFolder::Sent
    };
    Ok(ThreadSummary {
        id: row.get(0)?,
        subject: row.get(1)?,
        last_message_at: timestamp(row, 2)?,
        message_count: row.get::<_, i64>(3)? as usize,
        folder,
    })
}

fn row_to_address(row: &Row, start: usize) -> SqliteResult<EmailAddress> {
    Ok(EmailAddress {
        name: row.get(start)?,
        address: row.get(start + 1)?,
        raw: row.get(start + 2)?,
    })
}

fn row_to_email(row: &Row) -> SqliteResult<EmailMessage> {
    let labels: String = row.get(7)?;
    let labels: LabelSet = serde_json::from_str(&labels).map_err(|e| conversion_error(7, Type::Text, e))?;

    Ok(EmailMessage {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        subject: row.get(2)?,
        body: row.get(3)?,
        snippet: row.get(4)?,
        sent_at: timestamp(row, 5)?,
        received_at: timestamp(row, 6)?,
        from: row_to_address(row, 13)?,
        to: Vec::new(),
        cc: Vec::new(),
        bcc: Vec::new(),
        reply_to: Vec::new(),
        labels,
        has_attachments: row.get(8)?,
        attachments: Vec::new(),
        internet_message_id: row.get(9)?,
        in_reply_to: row.get(10)?,
        references: row.get(11)?,
        folder_id: row.get(12)?,
    })
}
