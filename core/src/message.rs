//! Canonical message model shared by every provider adapter

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use time::OffsetDateTime;

/// Canonical system labels. A message may carry several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemLabel {
    Inbox,
    Sent,
    Draft,
    Junk,
    Trash,
    Unread,
    Flagged,
    Important,
}

impl SystemLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemLabel::Inbox => "inbox",
            SystemLabel::Sent => "sent",
            SystemLabel::Draft => "draft",
            SystemLabel::Junk => "junk",
            SystemLabel::Trash => "trash",
            SystemLabel::Unread => "unread",
            SystemLabel::Flagged => "flagged",
            SystemLabel::Important => "important",
        }
    }
}

/// Set of system labels that is never empty.
///
/// Consumers filter by label presence, so a message whose provider labels
/// map to nothing lands in the inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<SystemLabel>", into = "Vec<SystemLabel>")]
pub struct LabelSet(BTreeSet<SystemLabel>);

impl LabelSet {
    /// Collect labels, defaulting to `inbox` when none mapped
    pub fn from_labels(labels: impl IntoIterator<Item = SystemLabel>) -> Self {
        let mut set: BTreeSet<SystemLabel> = labels.into_iter().collect();
        if set.is_empty() {
            set.insert(SystemLabel::Inbox);
        }
        Self(set)
    }

    pub fn contains(&self, label: SystemLabel) -> bool {
        self.0.contains(&label)
    }

    pub fn iter(&self) -> impl Iterator<Item = SystemLabel> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Folder a whole conversation is listed under.
///
/// Any message in the inbox puts the thread in the inbox; otherwise junk wins,
/// then drafts. Threads with none of those are sent conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadFolder {
    Inbox,
    Junk,
    Draft,
    Sent,
}

impl ThreadFolder {
    /// Derive the folder from the label sets of every message in the thread
    pub fn from_message_labels<'a>(labels: impl IntoIterator<Item = &'a LabelSet>) -> Self {
        let mut folder = ThreadFolder::Sent;
        for set in labels {
            if set.contains(SystemLabel::Inbox) {
                return ThreadFolder::Inbox;
            }
            if set.contains(SystemLabel::Junk) {
                folder = ThreadFolder::Junk;
            } else if set.contains(SystemLabel::Draft) && folder == ThreadFolder::Sent {
                folder = ThreadFolder::Draft;
            }
        }
        folder
    }

    /// Status column flagging threads of this folder
    pub fn column(&self) -> &'static str {
        match self {
            ThreadFolder::Inbox => "inbox_status",
            ThreadFolder::Junk => "junk_status",
            ThreadFolder::Draft => "draft_status",
            ThreadFolder::Sent => "sent_status",
        }
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self::from_labels([])
    }
}

impl TryFrom<Vec<SystemLabel>> for LabelSet {
    type Error = std::convert::Infallible;

    fn try_from(labels: Vec<SystemLabel>) -> Result<Self, Self::Error> {
        Ok(Self::from_labels(labels))
    }
}

impl From<LabelSet> for Vec<SystemLabel> {
    fn from(set: LabelSet) -> Self {
        set.0.into_iter().collect()
    }
}

/// A parsed mailbox address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name, case preserved
    pub name: Option<String>,
    /// Address, lowercased for dedup
    pub address: String,
    /// The text as it appeared on the wire
    pub raw: String,
}

impl EmailAddress {
    pub fn new(name: Option<&str>, address: &str) -> Self {
        let name = name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);
        let raw = match &name {
            Some(name) => format!("{} <{}>", name, address),
            None => address.to_string(),
        };
        Self {
            name,
            address: address.trim().to_lowercase(),
            raw,
        }
    }
}

/// Attachment metadata; content is fetched on demand elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    /// `{message_id}_{filename}`
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub inline: bool,
    pub content_id: Option<String>,
}

impl AttachmentMeta {
    pub fn new(message_id: &str, name: &str, mime_type: &str, size: u64, inline: bool) -> Self {
        Self {
            id: Self::synthesize_id(message_id, name),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size,
            inline,
            content_id: None,
        }
    }

    /// Identity that stays stable across re-fetches of the same message
    pub fn synthesize_id(message_id: &str, filename: &str) -> String {
        format!("{}_{}", message_id, filename)
    }
}

/// Provider-agnostic message every adapter normalizes into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Provider message id, unique within the account
    pub id: String,
    /// Provider thread id
    pub thread_id: String,
    pub subject: String,
    /// HTML when available, plain text or snippet otherwise
    pub body: Option<String>,
    pub snippet: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub reply_to: Vec<EmailAddress>,
    pub labels: LabelSet,
    pub has_attachments: bool,
    pub attachments: Vec<AttachmentMeta>,
    /// `Message-ID` header
    pub internet_message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    /// Provider folder the message was seen in
    pub folder_id: Option<String>,
}

impl EmailMessage {
    /// Every address on the message, sender first
    pub fn participants(&self) -> impl Iterator<Item = &EmailAddress> {
        std::iter::once(&self.from)
            .chain(self.to.iter())
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .chain(self.reply_to.iter())
    }
}

/// Fields of an outgoing message
#[derive(Debug, Clone, Default)]
pub struct SendParams {
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub reply_to: Vec<EmailAddress>,
    pub subject: String,
    /// HTML body
    pub body: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Provider thread to file the message under, when the provider supports it
    pub thread_id: Option<String>,
}

/// Provider acknowledgement of a sent message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SentMessage {
    /// Provider id of the sent message, when the API reports one
    pub id: Option<String>,
}
