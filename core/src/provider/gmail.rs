//! Gmail REST adapter
//!
//! Bootstrap runs list `messages?q=newer_than:Nd` and announce the mailbox
//! `historyId` captured before the first page. Incremental runs page through
//! `history` from the stored `historyId`.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::compose::compose_rfc2822;
use super::executor::RequestExecutor;
use super::{join_url, ListRequest, MailProvider, MessagePage, Profile};
use crate::account::ProviderKind;
use crate::error::{TernError, TernResult};
use crate::message::{EmailAddress, EmailMessage, LabelSet, SendParams, SentMessage, SystemLabel};
use crate::normalize::{self, MimePart, NativeMessage};

/// Message details fetched in parallel within one page
const DETAIL_CONCURRENCY: usize = 4;

/// Map Gmail system label ids onto canonical labels
pub fn map_labels(label_ids: &[String]) -> LabelSet {
    LabelSet::from_labels(label_ids.iter().filter_map(|id| match id.as_str() {
        "INBOX" => Some(SystemLabel::Inbox),
        "SENT" => Some(SystemLabel::Sent),
        "DRAFT" => Some(SystemLabel::Draft),
        "SPAM" => Some(SystemLabel::Junk),
        "TRASH" => Some(SystemLabel::Trash),
        "UNREAD" => Some(SystemLabel::Unread),
        "STARRED" => Some(SystemLabel::Flagged),
        "IMPORTANT" => Some(SystemLabel::Important),
        _ => None,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailProfile {
    email_address: String,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

/// Gmail `users.messages` resource in `format=full`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    #[serde(default)]
    pub id: String,
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    /// Epoch milliseconds, as a string
    pub internal_date: Option<String>,
    pub payload: Option<GmailPart>,
}

/// One node of a Gmail MIME tree
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailPart {
    #[serde(default)]
    pub mime_type: String,
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<GmailHeader>,
    pub body: Option<GmailBody>,
    #[serde(default)]
    pub parts: Vec<GmailPart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailBody {
    #[serde(default)]
    pub size: u64,
    /// Base64url content, absent for attachments stored separately
    pub data: Option<String>,
    pub attachment_id: Option<String>,
}

impl MimePart for GmailPart {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    fn size(&self) -> u64 {
        self.body.as_ref().map(|b| b.size).unwrap_or(0)
    }

    fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(normalize::decode_base64url)
    }

    fn children(&self) -> &[Self] {
        &self.parts
    }
}

impl GmailMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()?
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Gmail's own receive time; the Date header is sender controlled
    fn timestamp(&self) -> Option<OffsetDateTime> {
        self.internal_date
            .as_deref()
            .and_then(|d| d.parse::<i64>().ok())
            .and_then(normalize::from_epoch_millis)
    }
}

impl NativeMessage for GmailMessage {
    fn native_id(&self) -> &str {
        &self.id
    }

    fn normalize(&self) -> TernResult<EmailMessage> {
        if self.id.is_empty() {
            return Err(TernError::malformed("<unknown>", "missing id"));
        }
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| TernError::malformed(&self.id, "missing payload"))?;
        let timestamp = self
            .timestamp()
            .ok_or_else(|| TernError::malformed(&self.id, "missing or invalid internalDate"))?;
        let from = self
            .header("From")
            .map(normalize::parse_address)
            .filter(|a| !a.address.is_empty())
            .ok_or_else(|| TernError::malformed(&self.id, "missing From header"))?;

        let list = |name: &str| self.header(name).map(normalize::parse_address_list).unwrap_or_default();
        let attachments = normalize::collect_attachments(&self.id, payload);

        Ok(EmailMessage {
            id: self.id.clone(),
            thread_id: self.thread_id.clone().unwrap_or_else(|| self.id.clone()),
            subject: normalize::subject_or_default(self.header("Subject")),
            body: normalize::body_or_snippet(normalize::extract_body(payload), self.snippet.as_deref()),
            snippet: self.snippet.clone(),
            sent_at: timestamp,
            received_at: timestamp,
            from,
            to: list("To"),
            cc: list("Cc"),
            bcc: list("Bcc"),
            reply_to: list("Reply-To"),
            labels: map_labels(&self.label_ids),
            has_attachments: !attachments.is_empty(),
            attachments,
            internet_message_id: self.header("Message-ID").map(str::to_string),
            in_reply_to: self.header("In-Reply-To").map(str::to_string),
            references: self.header("References").map(str::to_string),
            folder_id: None,
        })
    }
}

/// Gmail adapter bound to one access token
pub struct GmailProvider {
    executor: RequestExecutor,
    base: url::Url,
    token: String,
}

impl GmailProvider {
    /// `base` is the `users/me` root, e.g. `https://gmail.googleapis.com/gmail/v1/users/me`
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

    async fn profile(&self) -> TernResult<GmailProfile> {
        self.executor.get_json(&self.url("profile"), &self.token, &[]).await
    }

    async fn fetch_native(&self, id: &str) -> TernResult<GmailMessage> {
        let url = self.url(&format!("messages/{}", id));
        self.executor
            .get_json(&url, &self.token, &[("format", "full".to_string())])
            .await
    }

    /// Fetch details for a page of ids and normalize them.
    ///
    /// Messages deleted between listing and fetching are skipped.
    async fn fetch_details(&self, ids: Vec<String>) -> TernResult<(Vec<EmailMessage>, usize)> {
        let results: Vec<(String, TernResult<GmailMessage>)> = stream::iter(ids)
            .map(|id| async move {
                let result = self.fetch_native(&id).await;
                (id, result)
            })
            .buffered(DETAIL_CONCURRENCY)
            .collect()
            .await;

        let mut natives = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(native) => natives.push(native),
                Err(TernError::NotFound(_)) => warn!("Gmail message {} vanished before it was fetched", id),
                Err(e) => return Err(e),
            }
        }

        Ok(normalize::normalize_all(&natives))
    }

    async fn list_bootstrap(&self, request: &ListRequest) -> TernResult<MessagePage> {
        // The history id must predate the listing so nothing added meanwhile is lost.
        let next_cursor = if request.page_token.is_none() {
            self.profile().await?.history_id
        } else {
            None
        };

        let mut terms = Vec::new();
        if let Some(since) = request.since {
            let hours = (OffsetDateTime::now_utc() - since).whole_hours().max(0);
            terms.push(format!("newer_than:{}d", ((hours + 23) / 24).max(1)));
        }
        if let Some(extra) = request.query.as_deref().filter(|q| !q.trim().is_empty()) {
            terms.push(extra.trim().to_string());
        }

        let mut query = vec![("maxResults", request.page_size.to_string())];
        if !terms.is_empty() {
            query.push(("q", terms.join(" ")));
        }
        if let Some(page_token) = &request.page_token {
            query.push(("pageToken", page_token.clone()));
        }

        let listing: MessageListResponse = self.executor.get_json(&self.url("messages"), &self.token, &query).await?;
        debug!("Gmail listing returned {} message ids", listing.messages.len());

        let ids = listing.messages.into_iter().map(|m| m.id).collect();
        let (messages, malformed) = self.fetch_details(ids).await?;

        Ok(MessagePage {
            messages,
            next_page_token: listing.next_page_token,
            next_cursor,
            malformed,
        })
    }

    async fn list_history(&self, history_id: &str, request: &ListRequest) -> TernResult<MessagePage> {
        let mut query = vec![
            ("startHistoryId", history_id.to_string()),
            ("historyTypes", "messageAdded".to_string()),
            ("maxResults", request.page_size.to_string()),
        ];
        if let Some(page_token) = &request.page_token {
            query.push(("pageToken", page_token.clone()));
        }

        let history: HistoryResponse = match self.executor.get_json(&self.url("history"), &self.token, &query).await {
            Ok(history) => history,
            Err(TernError::NotFound(msg)) => {
                info!("Gmail history {} is no longer available", history_id);
                return Err(TernError::CursorExpired(msg));
            }
            Err(e) => return Err(e),
        };

        let mut seen = HashSet::new();
        let ids: Vec<String> = history
            .history
            .into_iter()
            .flat_map(|record| record.messages_added)
            .map(|added| added.message.id)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        debug!("Gmail history returned {} new message ids", ids.len());

        let (messages, malformed) = self.fetch_details(ids).await?;

        Ok(MessagePage {
            messages,
            next_page_token: history.next_page_token,
            next_cursor: history.history_id,
            malformed,
        })
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage<'a> {
    raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn get_profile(&self) -> TernResult<Profile> {
        let profile = self.profile().await?;
        Ok(Profile {
            email: profile.email_address,
            display_name: None,
        })
    }

    async fn list_messages(&self, request: &ListRequest) -> TernResult<MessagePage> {
        match &request.cursor {
            Some(history_id) => self.list_history(history_id, request).await,
            None => self.list_bootstrap(request).await,
        }
    }

    async fn get_message_detail(&self, id: &str) -> TernResult<EmailMessage> {
        self.fetch_native(id).await?.normalize()
    }

    async fn send_message(&self, params: &SendParams) -> TernResult<SentMessage> {
        let me = EmailAddress::new(None, &self.profile().await?.email_address);
        let raw = compose_rfc2822(params, &me)?;
        let body = RawMessage {
            raw: normalize::encode_base64url(&raw),
            thread_id: params.thread_id.as_deref(),
        };
        self.executor
            .post_json(&self.url("messages/send"), &self.token, &body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::executor::tests::test_executor;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BASE: &str = "/gmail/v1/users/me";

    fn b64(text: &str) -> String {
        normalize::encode_base64url(text.as_bytes())
    }

    fn full_message(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "threadId": "t1",
            "labelIds": ["INBOX", "UNREAD", "CATEGORY_UPDATES"],
            "snippet": "Hello there",
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "From", "value": "Jane Doe <Jane@Example.com>"},
                    {"name": "To", "value": "bob@example.com, Carol <carol@example.com>"},
                    {"name": "Subject", "value": "Status"},
                    {"name": "Message-ID", "value": "<abc@mail.example.com>"}
                ],
                "parts": [
                    {
                        "mimeType": "multipart/alternative",
                        "parts": [
                            {"mimeType": "text/plain", "body": {"size": 5, "data": b64("plain")}},
                            {"mimeType": "text/html", "body": {"size": 12, "data": b64("<p>html</p>")}}
                        ]
                    },
                    {"mimeType": "application/pdf", "filename": "report.pdf", "body": {"size": 2048, "attachmentId": "att1"}}
                ]
            }
        })
    }

    async fn provider(server: &MockServer) -> GmailProvider {
        GmailProvider::new(test_executor(), &format!("{}{}", server.uri(), BASE), "token").unwrap()
    }

    #[test]
    fn test_label_mapping() {
        let labels = map_labels(&["SPAM".into(), "STARRED".into(), "Label_7".into()]);
        assert!(labels.contains(SystemLabel::Junk));
        assert!(labels.contains(SystemLabel::Flagged));
        assert_eq!(labels.len(), 2);

        let fallback = map_labels(&["CATEGORY_SOCIAL".into()]);
        assert!(fallback.contains(SystemLabel::Inbox));
    }

    #[test]
    fn test_normalize_full_message() {
        let native: GmailMessage = serde_json::from_value(full_message("m1")).unwrap();
        let message = native.normalize().unwrap();

        assert_eq!(message.thread_id, "t1");
        assert_eq!(message.subject, "Status");
        assert_eq!(message.body.as_deref(), Some("<p>html</p>"));
        assert_eq!(message.from.address, "jane@example.com");
        assert_eq!(message.from.name.as_deref(), Some("Jane Doe"));
        assert_eq!(message.to.len(), 2);
        assert_eq!(message.sent_at.unix_timestamp(), 1_700_000_000);
        assert!(message.labels.contains(SystemLabel::Unread));
        assert!(message.has_attachments);
        assert_eq!(message.attachments[0].id, "m1_report.pdf");
        assert_eq!(message.internet_message_id.as_deref(), Some("<abc@mail.example.com>"));
    }

    #[test]
    fn test_normalize_without_body_uses_snippet() {
        let mut value = full_message("m2");
        value["payload"]["parts"] = json!([]);
        let native: GmailMessage = serde_json::from_value(value).unwrap();
        assert_eq!(native.normalize().unwrap().body.as_deref(), Some("Hello there"));
    }

    #[test]
    fn test_normalize_missing_from_is_malformed() {
        let mut value = full_message("m3");
        value["payload"]["headers"] = json!([{"name": "Subject", "value": "x"}]);
        let native: GmailMessage = serde_json::from_value(value).unwrap();
        assert!(matches!(native.normalize(), Err(TernError::MalformedMessage { .. })));
    }

    #[test]
    fn test_normalize_missing_internal_date_is_malformed() {
        let mut value = full_message("m4");
        value.as_object_mut().unwrap().remove("internalDate");
        value["payload"]["headers"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": "Date", "value": "Tue, 14 Nov 2023 22:13:20 +0000"}));
        let native: GmailMessage = serde_json::from_value(value).unwrap();
        assert!(matches!(native.normalize(), Err(TernError::MalformedMessage { .. })));
    }

    #[tokio::test]
    async fn test_bootstrap_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/profile", BASE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "emailAddress": "jane@example.com",
                "historyId": "500"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/messages", BASE)))
            .and(query_param("q", "newer_than:30d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{"id": "m1", "threadId": "t1"}, {"id": "gone", "threadId": "t2"}, {"id": "bad", "threadId": "t3"}],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/messages/m1", BASE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(full_message("m1")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/messages/gone", BASE)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/messages/bad", BASE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "bad", "threadId": "t3"})))
            .mount(&server)
            .await;

        let request = ListRequest {
            page_size: 50,
            since: Some(OffsetDateTime::now_utc() - time::Duration::days(30)),
            ..Default::default()
        };
        let page = provider(&server).await.list_messages(&request).await.unwrap();

        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.malformed, 1);
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));
        assert_eq!(page.next_cursor.as_deref(), Some("500"));
    }

    #[tokio::test]
    async fn test_history_page_dedups_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/history", BASE)))
            .and(query_param("startHistoryId", "500"))
            .and(query_param("historyTypes", "messageAdded"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "history": [
                    {"id": "501", "messagesAdded": [{"message": {"id": "m1"}}]},
                    {"id": "502", "messagesAdded": [{"message": {"id": "m1"}}]}
                ],
                "historyId": "502"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/messages/m1", BASE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(full_message("m1")))
            .expect(1)
            .mount(&server)
            .await;

        let request = ListRequest {
            cursor: Some("500".into()),
            page_size: 50,
            ..Default::default()
        };
        let page = provider(&server).await.list_messages(&request).await.unwrap();

        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.next_page_token, None);
        assert_eq!(page.next_cursor.as_deref(), Some("502"));
    }

    #[tokio::test]
    async fn test_expired_history_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/history", BASE)))
            .respond_with(ResponseTemplate::new(404).set_body_string("Requested entity was not found."))
            .mount(&server)
            .await;

        let request = ListRequest {
            cursor: Some("1".into()),
            page_size: 50,
            ..Default::default()
        };
        let err = provider(&server).await.list_messages(&request).await.unwrap_err();
        assert!(matches!(err, TernError::CursorExpired(_)));
    }

    #[tokio::test]
    async fn test_send_message_posts_raw_mime() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/profile", BASE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"emailAddress": "jane@example.com"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/messages/send", BASE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "sent1", "threadId": "t9"})))
            .expect(1)
            .mount(&server)
            .await;

        let params = SendParams {
            to: vec![EmailAddress::new(None, "bob@example.com")],
            subject: "Hi Bob".into(),
            body: "<p>Hi</p>".into(),
            thread_id: Some("t9".into()),
            ..Default::default()
        };
        let sent = provider(&server).await.send_message(&params).await.unwrap();
        assert_eq!(sent.id.as_deref(), Some("sent1"));

        let requests = server.received_requests().await.unwrap();
        let send = requests.iter().find(|r| r.url.path().ends_with("/messages/send")).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&send.body).unwrap();
        assert_eq!(body["threadId"], "t9");
        let raw = normalize::decode_base64url(body["raw"].as_str().unwrap()).unwrap();
        assert!(raw.contains("From: jane@example.com"));
        assert!(raw.contains("Subject: Hi Bob"));
    }
}
