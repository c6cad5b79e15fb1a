//! Idempotent persistence of normalized messages

use crate::error::{TernError, TernResult};
use crate::message::{EmailAddress, EmailMessage, LabelSet, ThreadFolder};
use crate::storage::Database;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

/// Per-batch persistence counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages stored for the first time
    pub inserted: usize,
    /// Messages that already existed and were overwritten
    pub updated: usize,
    /// Messages rolled back and skipped
    pub failed: usize,
}

impl BatchReport {
    /// Messages that made it to the store
    pub fn persisted(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upsert {
    Inserted,
    Updated,
}

impl Database {
    /// Upsert a batch of messages, one transaction per message.
    ///
    /// A message that fails is rolled back and counted; the rest of the batch
    /// still goes through.
    pub async fn persist_batch(&self, account_id: &str, messages: &[EmailMessage]) -> TernResult<BatchReport> {
        let mut conn = self.connection.lock().await;
        let mut report = BatchReport::default();

        for message in messages {
            match persist_one(&mut conn, account_id, message) {
                Ok(Upsert::Inserted) => report.inserted += 1,
                Ok(Upsert::Updated) => report.updated += 1,
                Err(e) => {
                    let err = TernError::persistence(format!("message {}: {}", message.id, e));
                    tracing::warn!(account_id, "Skipping message: {}", err);
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            account_id,
            inserted = report.inserted,
            updated = report.updated,
            failed = report.failed,
            "Persisted batch"
        );
        Ok(report)
    }
}

fn persist_one(conn: &mut Connection, account_id: &str, message: &EmailMessage) -> rusqlite::Result<Upsert> {
    let tx = conn.transaction()?;
    let outcome = upsert_message(&tx, account_id, message)?;
    tx.commit()?;
    Ok(outcome)
}

/// Address, thread, email, recipients, attachments
fn upsert_message(conn: &Connection, account_id: &str, message: &EmailMessage) -> rusqlite::Result<Upsert> {
    let from_id = upsert_address(conn, account_id, &message.from)?;

    let recipients = [
        ("to", &message.to),
        ("cc", &message.cc),
        ("bcc", &message.bcc),
        ("reply_to", &message.reply_to),
    ];
    let mut recipient_ids = Vec::new();
    for (kind, addresses) in recipients {
        for (position, address) in addresses.iter().enumerate() {
            recipient_ids.push((kind, position as i64, upsert_address(conn, account_id, address)?));
        }
    }

    upsert_thread(conn, account_id, message)?;

    let previous_thread: Option<String> = conn
        .query_row(
            "SELECT thread_id FROM emails WHERE account_id = ? AND id = ?",
            [account_id, message.id.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    let labels = serde_json::to_string(&message.labels)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    let now = OffsetDateTime::now_utc().unix_timestamp();

    conn.execute(
        "INSERT INTO emails (account_id, id, thread_id, subject, body, snippet, sent_at, received_at, from_address_id,
             labels, has_attachments, internet_message_id, in_reply_to, message_references, folder_id,
             created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (account_id, id) DO UPDATE SET
             thread_id = excluded.thread_id,
             subject = excluded.subject,
             body = excluded.body,
             snippet = excluded.snippet,
             sent_at = excluded.sent_at,
             received_at = excluded.received_at,
             from_address_id = excluded.from_address_id,
             labels = excluded.labels,
             has_attachments = excluded.has_attachments,
             internet_message_id = excluded.internet_message_id,
             in_reply_to = excluded.in_reply_to,
             message_references = excluded.message_references,
             folder_id = excluded.folder_id,
             updated_at = excluded.updated_at",
        params![
            account_id,
            message.id,
            message.thread_id,
            message.subject,
            message.body,
            message.snippet,
            message.sent_at.unix_timestamp(),
            message.received_at.unix_timestamp(),
            from_id,
            labels,
            message.has_attachments,
            message.internet_message_id,
            message.in_reply_to,
            message.references,
            message.folder_id,
            now,
            now,
        ],
    )?;

    refresh_thread_folder(conn, account_id, &message.thread_id)?;
    if let Some(previous) = previous_thread.as_deref().filter(|t| *t != message.thread_id) {
        refresh_thread_folder(conn, account_id, previous)?;
    }

    // Recipients are replaced wholesale
    conn.execute(
        "DELETE FROM email_recipients WHERE account_id = ? AND email_id = ?",
        [account_id, message.id.as_str()],
    )?;
    for (kind, position, address_id) in recipient_ids {
        conn.execute(
            "INSERT INTO email_recipients (account_id, email_id, address_id, kind, position) VALUES (?, ?, ?, ?, ?)",
            params![account_id, message.id, address_id, kind, position],
        )?;
    }

    for attachment in &message.attachments {
        conn.execute(
            "INSERT INTO attachments (account_id, id, email_id, name, mime_type, size, inline, content_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (account_id, id) DO UPDATE SET
                 email_id = excluded.email_id,
                 name = excluded.name,
                 mime_type = excluded.mime_type,
                 size = excluded.size,
                 inline = excluded.inline,
                 content_id = excluded.content_id",
            params![
                account_id,
                attachment.id,
                message.id,
                attachment.name,
                attachment.mime_type,
                attachment.size as i64,
                attachment.inline,
                attachment.content_id,
            ],
        )?;
    }

    Ok(if previous_thread.is_some() { Upsert::Updated } else { Upsert::Inserted })
}

/// Insert or refresh an address, returning its row id
fn upsert_address(conn: &Connection, account_id: &str, address: &EmailAddress) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO email_addresses (account_id, address, name, raw) VALUES (?, ?, ?, ?)
         ON CONFLICT (account_id, address) DO UPDATE SET
             name = COALESCE(excluded.name, email_addresses.name),
             raw = excluded.raw
         RETURNING id",
        params![account_id, address.address, address.name, address.raw],
        |row| row.get(0),
    )
}

/// Insert a thread or move its last activity forward
fn upsert_thread(conn: &Connection, account_id: &str, message: &EmailMessage) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO threads (account_id, id, subject, last_message_at) VALUES (?, ?, ?, ?)
         ON CONFLICT (account_id, id) DO UPDATE SET
             subject = CASE WHEN excluded.last_message_at >= threads.last_message_at
                            THEN excluded.subject ELSE threads.subject END,
             last_message_at = MAX(threads.last_message_at, excluded.last_message_at)",
        params![account_id, message.thread_id, message.subject, message.sent_at.unix_timestamp()],
    )?;
    Ok(())
}

/// Recompute the thread's folder flags from the labels of its emails
fn refresh_thread_folder(conn: &Connection, account_id: &str, thread_id: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached("SELECT labels FROM emails WHERE account_id = ? AND thread_id = ?")?;
    let label_sets = stmt
        .query_map([account_id, thread_id], |row| row.get::<_, String>(0))?
        .map(|labels| {
            serde_json::from_str::<LabelSet>(&labels?)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
        })
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let folder = ThreadFolder::from_message_labels(&label_sets);
    conn.execute(
        "UPDATE threads SET inbox_status = ?, junk_status = ?, draft_status = ?, sent_status = ?
         WHERE account_id = ? AND id = ?",
        params![
            folder == ThreadFolder::Inbox,
            folder == ThreadFolder::Junk,
            folder == ThreadFolder::Draft,
            folder == ThreadFolder::Sent,
            account_id,
            thread_id,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::{AttachmentMeta, SystemLabel};
    use crate::storage::database::tests::{test_account, test_database};

    const ACCOUNT: &str = "google_jane@example.com";

    async fn setup() -> Database {
        let db = test_database().await;
        db.upsert_account(&test_account("user_1", "jane@example.com")).await.unwrap();
        db
    }

    pub(crate) fn sample_message(id: &str, thread: &str, sent_at: i64) -> EmailMessage {
        let sent_at = OffsetDateTime::from_unix_timestamp(sent_at).unwrap();
        EmailMessage {
            id: id.into(),
            thread_id: thread.into(),
            subject: format!("Subject {}", id),
            body: Some("<p>hello</p>".into()),
            snippet: Some("hello".into()),
            sent_at,
            received_at: sent_at,
            from: EmailAddress::new(Some("Alice"), "alice@example.com"),
            to: vec![EmailAddress::new(None, "jane@example.com")],
            cc: vec![EmailAddress::new(Some("Bob"), "bob@example.com")],
            bcc: Vec::new(),
            reply_to: Vec::new(),
            labels: LabelSet::from_labels([SystemLabel::Inbox, SystemLabel::Unread]),
            has_attachments: false,
            attachments: Vec::new(),
            internet_message_id: Some(format!("<{}@mail.example.com>", id)),
            in_reply_to: None,
            references: None,
            folder_id: None,
        }
    }

    #[tokio::test]
    async fn test_persist_is_idempotent() {
        let db = setup().await;
        let mut first = sample_message("m1", "t1", 1_700_000_000);
        first.has_attachments = true;
        first.attachments = vec![AttachmentMeta::new("m1", "report.pdf", "application/pdf", 1024, false)];
        let batch = vec![first, sample_message("m2", "t1", 1_700_000_100)];

        let report = db.persist_batch(ACCOUNT, &batch).await.unwrap();
        assert_eq!(report, BatchReport { inserted: 2, updated: 0, failed: 0 });

        let report = db.persist_batch(ACCOUNT, &batch).await.unwrap();
        assert_eq!(report, BatchReport { inserted: 0, updated: 2, failed: 0 });

        let counts = db.mail_counts(ACCOUNT).await.unwrap();
        assert_eq!(counts.emails, 2);
        assert_eq!(counts.threads, 1);
        assert_eq!(counts.addresses, 3);
        assert_eq!(counts.attachments, 1);

        let stored = db.get_email(ACCOUNT, "m1").await.unwrap().unwrap();
        assert_eq!(stored.to.len(), 1);
        assert_eq!(stored.cc[0].name.as_deref(), Some("Bob"));
        assert_eq!(stored.attachments[0].id, "m1_report.pdf");
        assert!(stored.labels.contains(SystemLabel::Unread));
        assert_eq!(stored.sent_at, batch[0].sent_at);
    }

    #[tokio::test]
    async fn test_address_dedup_refreshes_name() {
        let db = setup().await;
        let mut first = sample_message("m1", "t1", 1_700_000_000);
        first.from = EmailAddress::new(None, "Carol@Example.com");
        let mut second = sample_message("m2", "t2", 1_700_000_100);
        second.from = EmailAddress::new(Some("Carol Jones"), "carol@example.com");
        let mut third = sample_message("m3", "t3", 1_700_000_200);
        third.from = EmailAddress::new(None, "carol@example.com");

        db.persist_batch(ACCOUNT, &[first, second, third]).await.unwrap();

        let carol = db.get_address(ACCOUNT, "CAROL@example.com").await.unwrap().unwrap();
        assert_eq!(carol.address, "carol@example.com");
        assert_eq!(carol.name.as_deref(), Some("Carol Jones"));

        assert_eq!(db.mail_counts(ACCOUNT).await.unwrap().addresses, 3);
    }

    #[tokio::test]
    async fn test_thread_tracks_latest_activity() {
        let db = setup().await;
        let newer = sample_message("m2", "t1", 1_700_000_500);
        let older = sample_message("m1", "t1", 1_700_000_000);

        db.persist_batch(ACCOUNT, &[newer, older]).await.unwrap();

        let thread = db.get_thread(ACCOUNT, "t1").await.unwrap().unwrap();
        assert_eq!(thread.last_message_at.unix_timestamp(), 1_700_000_500);
        assert_eq!(thread.subject, "Subject m2");
        assert_eq!(thread.message_count, 2);
    }

    #[tokio::test]
    async fn test_thread_folder_follows_message_labels() {
        let db = setup().await;
        let labeled = |id: &str, thread: &str, labels: &[SystemLabel]| {
            let mut message = sample_message(id, thread, 1_700_000_000);
            message.labels = LabelSet::from_labels(labels.iter().copied());
            message
        };

        db.persist_batch(
            ACCOUNT,
            &[
                labeled("s1", "sent-only", &[SystemLabel::Sent]),
                labeled("d1", "drafted", &[SystemLabel::Sent]),
                labeled("d2", "drafted", &[SystemLabel::Draft]),
                labeled("j1", "junked", &[SystemLabel::Draft]),
                labeled("j2", "junked", &[SystemLabel::Junk]),
                labeled("r1", "replied", &[SystemLabel::Sent]),
            ],
        )
        .await
        .unwrap();

        let folder = |thread: &'static str| {
            let db = db.clone();
            async move { db.get_thread(ACCOUNT, thread).await.unwrap().unwrap().folder }
        };
        assert_eq!(folder("sent-only").await, ThreadFolder::Sent);
        assert_eq!(folder("drafted").await, ThreadFolder::Draft);
        assert_eq!(folder("junked").await, ThreadFolder::Junk);
        assert_eq!(folder("replied").await, ThreadFolder::Sent);

        // A reply landing in the inbox moves the whole conversation there
        db.persist_batch(ACCOUNT, &[labeled("r2", "replied", &[SystemLabel::Inbox])])
            .await
            .unwrap();
        assert_eq!(folder("replied").await, ThreadFolder::Inbox);

        // Relabeling the reply on a later sync moves it back
        db.persist_batch(ACCOUNT, &[labeled("r2", "replied", &[SystemLabel::Trash])])
            .await
            .unwrap();
        assert_eq!(folder("replied").await, ThreadFolder::Sent);

        let sent: Vec<_> = db
            .list_threads(ACCOUNT, ThreadFolder::Sent, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(sent.len(), 2);
        assert!(sent.contains(&"sent-only".to_string()) && sent.contains(&"replied".to_string()));
        assert!(db.list_threads(ACCOUNT, ThreadFolder::Inbox, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_message_is_skipped() {
        let db = setup().await;
        {
            let conn = db.connection.lock().await;
            conn.execute_batch(
                "CREATE TRIGGER poison BEFORE INSERT ON emails WHEN NEW.id = 'bad'
                 BEGIN SELECT RAISE(ABORT, 'poisoned message'); END;",
            )
            .unwrap();
        }

        let mut bad = sample_message("bad", "t-bad", 1_700_000_050);
        bad.from = EmailAddress::new(Some("Mallory"), "mallory@example.com");
        let batch = vec![sample_message("m1", "t1", 1_700_000_000), bad, sample_message("m2", "t1", 1_700_000_100)];

        let report = db.persist_batch(ACCOUNT, &batch).await.unwrap();
        assert_eq!(report, BatchReport { inserted: 2, updated: 0, failed: 1 });
        assert_eq!(report.persisted(), 2);

        // Nothing from the failed message survives the rollback
        assert!(db.get_email(ACCOUNT, "bad").await.unwrap().is_none());
        assert!(db.get_thread(ACCOUNT, "t-bad").await.unwrap().is_none());
        assert!(db.get_address(ACCOUNT, "mallory@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let db = setup().await;
        let mut first = sample_message("m1", "t1", 1_700_000_000);
        first.attachments = vec![AttachmentMeta::new("m1", "a.txt", "text/plain", 10, false)];
        db.persist_batch(ACCOUNT, &[first, sample_message("m2", "t2", 1_700_000_100)])
            .await
            .unwrap();

        let report = db.delete_account(ACCOUNT).await.unwrap();
        assert_eq!(report.attachments, 1);
        assert_eq!(report.recipients, 4);
        assert_eq!(report.emails, 2);
        assert_eq!(report.threads, 2);
        assert_eq!(report.addresses, 3);
        assert_eq!(report.accounts, 1);

        assert!(db.get_account(ACCOUNT).await.unwrap().is_none());
        assert_eq!(db.mail_counts(ACCOUNT).await.unwrap(), Default::default());
        assert!(matches!(db.delete_account(ACCOUNT).await, Err(TernError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_purge_keeps_account() {
        let db = setup().await;
        db.persist_batch(ACCOUNT, &[sample_message("m1", "t1", 1_700_000_000)]).await.unwrap();

        let report = db.purge_mail(ACCOUNT).await.unwrap();
        assert_eq!(report.emails, 1);
        assert_eq!(report.accounts, 0);
        assert!(db.get_account(ACCOUNT).await.unwrap().is_some());
    }
}
