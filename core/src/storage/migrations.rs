//! Database migrations for Tern Mail

use crate::error::{TernError, TernResult};
use rusqlite::{Connection, Result as SqliteResult};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Migration manager for database schema updates
pub struct MigrationManager {
    connection: Arc<Mutex<Connection>>,
}

impl MigrationManager {
    /// Create a new migration manager
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    /// Run all pending migrations
    pub async fn run_migrations(&mut self) -> TernResult<()> {
        let mut conn = self.connection.lock().await;
        create_migrations_table(&conn)?;

        for migration in migrations() {
            if is_migration_applied(&conn, migration.name())? {
                continue;
            }

            tracing::info!("Applying migration: {}", migration.name());
            let tx = conn.transaction()?;
            migration
                .apply(&tx)
                .map_err(|e| TernError::DatabaseMigration(format!("{}: {}", migration.name(), e)))?;
            tx.execute("INSERT INTO migrations (name) VALUES (?)", [migration.name()])?;
            tx.commit()?;
            tracing::debug!("Migration applied: {}", migration.name());
        }

        Ok(())
    }

    /// Names of the migrations recorded as applied, in order
    pub async fn applied_migrations(&self) -> TernResult<Vec<String>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare("SELECT name FROM migrations ORDER BY id")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqliteResult<Vec<String>>>()?;
        Ok(names)
    }
}

fn create_migrations_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

fn is_migration_applied(conn: &Connection, migration_name: &str) -> SqliteResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM migrations WHERE name = ?",
        [migration_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// All migrations, in application order
fn migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(CreateAccountsTable),
        Box::new(CreateEmailAddressesTable),
        Box::new(CreateThreadsTable),
        Box::new(CreateEmailsTable),
        Box::new(CreateEmailRecipientsTable),
        Box::new(CreateAttachmentsTable),
        Box::new(AddIndexes),
        Box::new(AddThreadFolderStatus),
    ]
}

/// Trait for database migrations
trait Migration {
    fn name(&self) -> &str;
    fn apply(&self, connection: &Connection) -> SqliteResult<()>;
}

/// Migration: Create accounts table
struct CreateAccountsTable;

impl Migration for CreateAccountsTable {
    fn name(&self) -> &str {
        "create_accounts_table"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE TABLE accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at INTEGER,
                email TEXT NOT NULL,
                display_name TEXT NOT NULL,
                delta_token TEXT,
                page_token TEXT,
                pending_delta_token TEXT,
                sync_status TEXT NOT NULL DEFAULT 'idle',
                last_sync_error TEXT,
                last_synced_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (user_id, email, provider)
            )",
            [],
        )?;
        Ok(())
    }
}

/// Migration: Create email addresses table
struct CreateEmailAddressesTable;

impl Migration for CreateEmailAddressesTable {
    fn name(&self) -> &str {
        "create_email_addresses_table"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE TABLE email_addresses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL REFERENCES accounts (id),
                address TEXT NOT NULL,
                name TEXT,
                raw TEXT NOT NULL,
                UNIQUE (account_id, address)
            )",
            [],
        )?;
        Ok(())
    }
}

/// Migration: Create threads table
struct CreateThreadsTable;

impl Migration for CreateThreadsTable {
    fn name(&self) -> &str {
        "create_threads_table"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE TABLE threads (
                account_id TEXT NOT NULL REFERENCES accounts (id),
                id TEXT NOT NULL,
                subject TEXT NOT NULL,
                last_message_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, id)
            )",
            [],
        )?;
        Ok(())
    }
}

/// Migration: Create emails table
struct CreateEmailsTable;

impl Migration for CreateEmailsTable {
    fn name(&self) -> &str {
        "create_emails_table"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE TABLE emails (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT,
                snippet TEXT,
                sent_at INTEGER NOT NULL,
                received_at INTEGER NOT NULL,
                from_address_id INTEGER NOT NULL REFERENCES email_addresses (id),
                labels TEXT NOT NULL,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                internet_message_id TEXT,
                in_reply_to TEXT,
                message_references TEXT,
                folder_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, id),
                FOREIGN KEY (account_id, thread_id) REFERENCES threads (account_id, id)
            )",
            [],
        )?;
        Ok(())
    }
}

/// Migration: Create email recipients table
struct CreateEmailRecipientsTable;

impl Migration for CreateEmailRecipientsTable {
    fn name(&self) -> &str {
        "create_email_recipients_table"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE TABLE email_recipients (
                account_id TEXT NOT NULL,
                email_id TEXT NOT NULL,
                address_id INTEGER NOT NULL REFERENCES email_addresses (id),
                kind TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (account_id, email_id, kind, position),
                FOREIGN KEY (account_id, email_id) REFERENCES emails (account_id, id)
            )",
            [],
        )?;
        Ok(())
    }
}

/// Migration: Create attachments table
struct CreateAttachmentsTable;

impl Migration for CreateAttachmentsTable {
    fn name(&self) -> &str {
        "create_attachments_table"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE TABLE attachments (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                email_id TEXT NOT NULL,
                name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                inline INTEGER NOT NULL DEFAULT 0,
                content_id TEXT,
                PRIMARY KEY (account_id, id),
                FOREIGN KEY (account_id, email_id) REFERENCES emails (account_id, id)
            )",
            [],
        )?;
        Ok(())
    }
}

/// Migration: Add indexes for performance
struct AddIndexes;

impl Migration for AddIndexes {
    fn name(&self) -> &str {
        "add_indexes"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        // Account indexes
        connection.execute("CREATE INDEX IF NOT EXISTS idx_accounts_user_id ON accounts (user_id)", [])?;

        // Thread indexes
        connection.execute(
            "CREATE INDEX IF NOT EXISTS idx_threads_last_message_at ON threads (account_id, last_message_at)",
            [],
        )?;

        // Email indexes
        connection.execute("CREATE INDEX IF NOT EXISTS idx_emails_thread_id ON emails (account_id, thread_id)", [])?;
        connection.execute("CREATE INDEX IF NOT EXISTS idx_emails_sent_at ON emails (account_id, sent_at)", [])?;
        connection.execute(
            "CREATE INDEX IF NOT EXISTS idx_emails_internet_message_id ON emails (internet_message_id)",
            [],
        )?;

        // Recipient and attachment indexes
        connection.execute(
            "CREATE INDEX IF NOT EXISTS idx_email_recipients_address_id ON email_recipients (address_id)",
            [],
        )?;
        connection.execute(
            "CREATE INDEX IF NOT EXISTS idx_attachments_email_id ON attachments (account_id, email_id)",
            [],
        )?;

        Ok(())
    }
}

/// Migration: Folder flags on threads, derived from their emails' labels
struct AddThreadFolderStatus;

impl Migration for AddThreadFolderStatus {
    fn name(&self) -> &str {
        "add_thread_folder_status"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        connection.execute_batch(
            "ALTER TABLE threads ADD COLUMN inbox_status INTEGER NOT NULL DEFAULT 1;
             ALTER TABLE threads ADD COLUMN sent_status INTEGER NOT NULL DEFAULT 0;
             ALTER TABLE threads ADD COLUMN draft_status INTEGER NOT NULL DEFAULT 0;
             ALTER TABLE threads ADD COLUMN junk_status INTEGER NOT NULL DEFAULT 0;
             CREATE INDEX IF NOT EXISTS idx_threads_inbox ON threads (account_id, inbox_status, last_message_at);
             CREATE INDEX IF NOT EXISTS idx_threads_sent ON threads (account_id, sent_status, last_message_at);
             CREATE INDEX IF NOT EXISTS idx_threads_draft ON threads (account_id, draft_status, last_message_at);",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(path: &std::path::Path) -> Arc<Mutex<Connection>> {
        Arc::new(Mutex::new(Connection::open(path).unwrap()))
    }

    #[tokio::test]
    async fn test_migration_manager() {
        let temp_dir = TempDir::new().unwrap();
        let connection = open(&temp_dir.path().join("test.db"));
        let mut migration_manager = MigrationManager::new(connection.clone());

        migration_manager.run_migrations().await.unwrap();

        let applied = migration_manager.applied_migrations().await.unwrap();
        assert_eq!(applied.len(), migrations().len());
        assert_eq!(applied[0], "create_accounts_table");

        let conn = connection.lock().await;
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('accounts', 'email_addresses', 'threads', 'emails', 'email_recipients', 'attachments')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);

        let folder_columns: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('threads') WHERE name IN
                 ('inbox_status', 'sent_status', 'draft_status', 'junk_status')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(folder_columns, 4);
    }

    #[tokio::test]
    async fn test_migration_idempotency() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        MigrationManager::new(open(&db_path)).run_migrations().await.unwrap();

        // A second manager on a reopened file must not reapply anything
        let mut migration_manager = MigrationManager::new(open(&db_path));
        migration_manager.run_migrations().await.unwrap();

        let applied = migration_manager.applied_migrations().await.unwrap();
        assert_eq!(applied.len(), migrations().len());
    }
}
