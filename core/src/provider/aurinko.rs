//! Aurinko unified mail API adapter
//!
//! A bootstrap starts a server-side sync window with `POST /email/sync` and
//! then pages `GET /email/sync/updated` from the returned token. The
//! `nextDeltaToken` of the last page is the cursor for the next run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

use super::executor::RequestExecutor;
use super::{join_url, ListRequest, MailProvider, MessagePage, Profile};
use crate::account::ProviderKind;
use crate::error::{TernError, TernResult};
use crate::message::{AttachmentMeta, EmailAddress, EmailMessage, LabelSet, SendParams, SentMessage, SystemLabel};
use crate::normalize::{self, NativeMessage};

/// Times to ask whether the sync window is ready before giving up
const SYNC_READY_ATTEMPTS: u32 = 5;
const SYNC_READY_DELAY: Duration = Duration::from_secs(1);

/// Map Aurinko system labels onto canonical labels
pub fn map_labels(labels: &[String]) -> LabelSet {
    LabelSet::from_labels(labels.iter().filter_map(|label| match label.to_ascii_lowercase().as_str() {
        "inbox" => Some(SystemLabel::Inbox),
        "sent" => Some(SystemLabel::Sent),
        "draft" => Some(SystemLabel::Draft),
        "junk" | "spam" => Some(SystemLabel::Junk),
        "trash" => Some(SystemLabel::Trash),
        "unread" => Some(SystemLabel::Unread),
        "flagged" => Some(SystemLabel::Flagged),
        "important" => Some(SystemLabel::Important),
        _ => None,
    }))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AurinkoAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl AurinkoAddress {
    fn to_address(&self) -> EmailAddress {
        if self.address.is_empty() {
            return normalize::parse_address(self.raw.as_deref().unwrap_or_default());
        }
        let mut address = EmailAddress::new(self.name.as_deref(), &self.address);
        if let Some(raw) = self.raw.as_ref().filter(|r| !r.is_empty()) {
            address.raw = raw.clone();
        }
        address
    }

    fn from_address(addr: &EmailAddress) -> Self {
        Self {
            name: addr.name.clone(),
            address: addr.address.clone(),
            raw: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AurinkoAttachment {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub inline: bool,
    pub content_id: Option<String>,
}

/// Aurinko email record
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AurinkoMessage {
    #[serde(default)]
    pub id: String,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub body_snippet: Option<String>,
    pub sent_at: Option<String>,
    pub received_at: Option<String>,
    pub from: Option<AurinkoAddress>,
    #[serde(default)]
    pub to: Vec<AurinkoAddress>,
    #[serde(default)]
    pub cc: Vec<AurinkoAddress>,
    #[serde(default)]
    pub bcc: Vec<AurinkoAddress>,
    #[serde(default)]
    pub reply_to: Vec<AurinkoAddress>,
    #[serde(default)]
    pub sys_labels: Vec<String>,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub attachments: Vec<AurinkoAttachment>,
    pub internet_message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub folder_id: Option<String>,
}

impl NativeMessage for AurinkoMessage {
    fn native_id(&self) -> &str {
        &self.id
    }

    fn normalize(&self) -> TernResult<EmailMessage> {
        if self.id.is_empty() {
            return Err(TernError::malformed("<unknown>", "missing id"));
        }
        let sent_at = self.sent_at.as_deref().and_then(normalize::parse_rfc3339);
        let received_at = self.received_at.as_deref().and_then(normalize::parse_rfc3339);
        let (sent_at, received_at) = match (sent_at, received_at) {
            (Some(sent), Some(received)) => (sent, received),
            (Some(ts), None) | (None, Some(ts)) => (ts, ts),
            (None, None) => return Err(TernError::malformed(&self.id, "no sent or received time")),
        };
        let from = self
            .from
            .as_ref()
            .map(AurinkoAddress::to_address)
            .filter(|a| !a.address.is_empty())
            .ok_or_else(|| TernError::malformed(&self.id, "missing sender"))?;

        let attachments: Vec<AttachmentMeta> = self
            .attachments
            .iter()
            .filter_map(|att| {
                let name = att.name.as_deref().filter(|n| !n.is_empty())?;
                let mime = att.mime_type.as_deref().unwrap_or("application/octet-stream");
                let mut meta = AttachmentMeta::new(&self.id, name, mime, att.size, att.inline);
                meta.content_id = att.content_id.clone();
                Some(meta)
            })
            .collect();
        let addresses = |list: &[AurinkoAddress]| -> Vec<EmailAddress> { list.iter().map(AurinkoAddress::to_address).collect() };

        Ok(EmailMessage {
            id: self.id.clone(),
            thread_id: self.thread_id.clone().unwrap_or_else(|| self.id.clone()),
            subject: normalize::subject_or_default(self.subject.as_deref()),
            body: normalize::body_or_snippet(self.body.clone(), self.body_snippet.as_deref()),
            snippet: self.body_snippet.clone(),
            sent_at,
            received_at,
            from,
            to: addresses(&self.to),
            cc: addresses(&self.cc),
            bcc: addresses(&self.bcc),
            reply_to: addresses(&self.reply_to),
            labels: map_labels(&self.sys_labels),
            has_attachments: self.has_attachments || !attachments.is_empty(),
            attachments,
            internet_message_id: self.internet_message_id.clone(),
            in_reply_to: self.in_reply_to.clone(),
            references: self.references.clone(),
            folder_id: self.folder_id.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncStartResponse {
    sync_updated_token: Option<String>,
    #[serde(default)]
    ready: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncUpdatedResponse {
    #[serde(default)]
    records: Vec<AurinkoMessage>,
    next_page_token: Option<String>,
    next_delta_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AurinkoAccount {
    email: String,
    name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<AurinkoAddress>,
    to: Vec<AurinkoAddress>,
    cc: Vec<AurinkoAddress>,
    bcc: Vec<AurinkoAddress>,
    reply_to: Vec<AurinkoAddress>,
    subject: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    references: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
}

/// Aurinko adapter bound to one access token
pub struct AurinkoProvider {
    executor: RequestExecutor,
    base: url::Url,
    token: String,
}

impl AurinkoProvider {
    /// `base` is the API root, e.g. `https://api.aurinko.io/v1`
    pub fn new(executor: RequestExecutor, base: &str, token: &str) -> TernResult<Self> {
        Ok(Self {
            executor,
            base: url::Url::parse(base)?,
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base, path)
    }

    /// Open a sync window and return its first delta token once ready
    async fn start_sync(&self, since: Option<OffsetDateTime>) -> TernResult<String> {
        let days = since
            .map(|since| {
                let hours = (OffsetDateTime::now_utc() - since).whole_hours().max(0);
                ((hours + 23) / 24).max(1)
            })
            .unwrap_or(crate::config::SyncConfig::default().initial_sync_days as i64);
        let url = self.url("email/sync");

        for attempt in 1..=SYNC_READY_ATTEMPTS {
            let response = self
                .executor
                .send(|| {
                    self.executor
                        .client()
                        .post(&url)
                        .bearer_auth(&self.token)
                        .query(&[("daysWithin", days.to_string()), ("bodyType", "html".to_string())])
                })
                .await?;
            let start: SyncStartResponse = response.json().await?;

            match start.sync_updated_token {
                Some(token) if start.ready => {
                    info!("Aurinko sync window of {} days is ready", days);
                    return Ok(token);
                }
                _ => {
                    debug!("Aurinko sync not ready (attempt {}/{})", attempt, SYNC_READY_ATTEMPTS);
                    if attempt < SYNC_READY_ATTEMPTS {
                        self.executor.pause(SYNC_READY_DELAY).await;
                    }
                }
            }
        }

        Err(TernError::unavailable("Aurinko sync window did not become ready"))
    }
}

#[async_trait]
impl MailProvider for AurinkoProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aurinko
    }

    async fn get_profile(&self) -> TernResult<Profile> {
        let account: AurinkoAccount = self.executor.get_json(&self.url("account"), &self.token, &[]).await?;
        Ok(Profile {
            email: account.email,
            display_name: account.name,
        })
    }

    async fn list_messages(&self, request: &ListRequest) -> TernResult<MessagePage> {
        let query = match (&request.page_token, &request.cursor) {
            (Some(page_token), _) => vec![("pageToken", page_token.clone())],
            (None, Some(delta_token)) => vec![("deltaToken", delta_token.clone())],
            (None, None) => vec![("deltaToken", self.start_sync(request.since).await?)],
        };

        let response: SyncUpdatedResponse = match self
            .executor
            .get_json(&self.url("email/sync/updated"), &self.token, &query)
            .await
        {
            Ok(response) => response,
            Err(TernError::NotFound(msg)) if request.cursor.is_some() => return Err(TernError::CursorExpired(msg)),
            Err(e) => return Err(e),
        };

        let (messages, malformed) = normalize::normalize_all(&response.records);
        Ok(MessagePage {
            messages,
            next_page_token: response.next_page_token,
            next_cursor: response.next_delta_token,
            malformed,
        })
    }

    async fn get_message_detail(&self, id: &str) -> TernResult<EmailMessage> {
        let url = self.url(&format!("email/messages/{}", id));
        let native: AurinkoMessage = self.executor.get_json(&url, &self.token, &[]).await?;
        native.normalize()
    }

    async fn send_message(&self, params: &SendParams) -> TernResult<SentMessage> {
        if params.to.is_empty() && params.cc.is_empty() && params.bcc.is_empty() {
            return Err(TernError::validation("Message has no recipients"));
        }

        let addresses = |list: &[EmailAddress]| -> Vec<AurinkoAddress> { list.iter().map(AurinkoAddress::from_address).collect() };
        let body = OutgoingMessage {
            from: params.from.as_ref().map(AurinkoAddress::from_address),
            to: addresses(&params.to),
            cc: addresses(&params.cc),
            bcc: addresses(&params.bcc),
            reply_to: addresses(&params.reply_to),
            subject: &params.subject,
            body: &params.body,
            in_reply_to: params.in_reply_to.as_deref(),
            references: (!params.references.is_empty()).then(|| params.references.join(" ")),
            thread_id: params.thread_id.as_deref(),
        };

        let url = self.url("email/messages");
        let response = self
            .executor
            .send(|| {
                self.executor
                    .client()
                    .post(&url)
                    .bearer_auth(&self.token)
                    .query(&[("returnMailId", "true")])
                    .json(&body)
            })
            .await?;
        Ok(response.json().await?)
    }
}
