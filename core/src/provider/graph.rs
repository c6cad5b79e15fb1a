//! Microsoft Graph adapter
//!
//! Sync uses the inbox delta query. The page token is the full
//! `@odata.nextLink` and the cursor is the `@odata.deltaLink` handed out on
//! the last page of a round.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use super::executor::RequestExecutor;
use super::{join_url, ListRequest, MailProvider, MessagePage, Profile};
use crate::account::ProviderKind;
use crate::error::{TernError, TernResult};
use crate::message::{AttachmentMeta, EmailAddress, EmailMessage, LabelSet, SendParams, SentMessage, SystemLabel};
use crate::normalize::{self, NativeMessage};

const MESSAGE_FIELDS: &str = "id,conversationId,subject,body,bodyPreview,from,toRecipients,ccRecipients,\
bccRecipients,replyTo,sentDateTime,receivedDateTime,isRead,isDraft,hasAttachments,importance,flag,\
parentFolderId,internetMessageId";

const ATTACHMENT_FIELDS: &str = "id,name,contentType,size,isInline";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphEmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRecipient {
    pub email_address: GraphEmailAddress,
}

impl GraphRecipient {
    fn to_address(&self) -> EmailAddress {
        EmailAddress::new(self.email_address.name.as_deref(), &self.email_address.address)
    }

    fn from_address(addr: &EmailAddress) -> Self {
        Self {
            email_address: GraphEmailAddress {
                name: addr.name.clone(),
                address: addr.address.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphBody {
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFlag {
    #[serde(default)]
    pub flag_status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphAttachment {
    pub name: Option<String>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_inline: bool,
    pub content_id: Option<String>,
}

/// Graph `message` resource as returned by the delta query
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMessage {
    #[serde(default)]
    pub id: String,
    pub conversation_id: Option<String>,
    pub subject: Option<String>,
    pub body: Option<GraphBody>,
    pub body_preview: Option<String>,
    pub from: Option<GraphRecipient>,
    #[serde(default)]
    pub to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    pub cc_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    pub bcc_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    pub reply_to: Vec<GraphRecipient>,
    pub sent_date_time: Option<String>,
    pub received_date_time: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default)]
    pub has_attachments: bool,
    pub importance: Option<String>,
    pub flag: Option<GraphFlag>,
    pub parent_folder_id: Option<String>,
    pub internet_message_id: Option<String>,
    /// Set on delta entries for messages that left the folder
    #[serde(rename = "@removed")]
    pub removed: Option<serde_json::Value>,
    /// Filled in separately when `has_attachments` is set
    #[serde(skip)]
    pub attachments: Vec<GraphAttachment>,
}

#[derive(Debug, Deserialize)]
struct DeltaResponse {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentList {
    #[serde(default)]
    value: Vec<GraphAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphProfile {
    mail: Option<String>,
    user_principal_name: Option<String>,
    display_name: Option<String>,
}

/// Map folder, read state, importance and flag onto canonical labels
pub fn map_labels(message: &GraphMessage) -> LabelSet {
    let mut labels = Vec::new();

    let folder = message.parent_folder_id.as_deref().unwrap_or_default().to_lowercase();
    if folder.contains("sentitems") {
        labels.push(SystemLabel::Sent);
    } else if folder.contains("drafts") {
        labels.push(SystemLabel::Draft);
    } else if folder.contains("junkemail") {
        labels.push(SystemLabel::Junk);
    } else if folder.contains("deleteditems") {
        labels.push(SystemLabel::Trash);
    } else {
        labels.push(SystemLabel::Inbox);
    }

    if message.is_draft {
        labels.push(SystemLabel::Draft);
    }
    if !message.is_read {
        labels.push(SystemLabel::Unread);
    }
    if message.importance.as_deref() == Some("high") {
        labels.push(SystemLabel::Important);
    }
    if message
        .flag
        .as_ref()
        .map_or(false, |f| f.flag_status.eq_ignore_ascii_case("flagged"))
    {
        labels.push(SystemLabel::Flagged);
    }

    LabelSet::from_labels(labels)
}

impl NativeMessage for GraphMessage {
    fn native_id(&self) -> &str {
        &self.id
    }

    fn normalize(&self) -> TernResult<EmailMessage> {
        if self.id.is_empty() {
            return Err(TernError::malformed("<unknown>", "missing id"));
        }
        let received_at = self.received_date_time.as_deref().and_then(normalize::parse_rfc3339);
        let sent_at = self.sent_date_time.as_deref().and_then(normalize::parse_rfc3339);
        let received_at = received_at
            .or(sent_at)
            .ok_or_else(|| TernError::malformed(&self.id, "no sent or received time"))?;
        let from = self
            .from
            .as_ref()
            .filter(|f| !f.email_address.address.is_empty())
            .map(GraphRecipient::to_address)
            .ok_or_else(|| TernError::malformed(&self.id, "missing sender"))?;

        let body = self
            .body
            .as_ref()
            .map(|b| b.content.clone())
            .filter(|c| !c.trim().is_empty());
        let attachments: Vec<AttachmentMeta> = self
            .attachments
            .iter()
            .filter_map(|att| {
                let name = att.name.as_deref().filter(|n| !n.is_empty())?;
                let mime = att.content_type.as_deref().unwrap_or("application/octet-stream");
                let mut meta = AttachmentMeta::new(&self.id, name, mime, att.size, att.is_inline);
                meta.content_id = att.content_id.clone();
                Some(meta)
            })
            .collect();

        Ok(EmailMessage {
            id: self.id.clone(),
            thread_id: self.conversation_id.clone().unwrap_or_else(|| self.id.clone()),
            subject: normalize::subject_or_default(self.subject.as_deref()),
            body: normalize::body_or_snippet(body, self.body_preview.as_deref()),
            snippet: self.body_preview.clone(),
            sent_at: sent_at.unwrap_or(received_at),
            received_at,
            from,
            to: self.to_recipients.iter().map(GraphRecipient::to_address).collect(),
            cc: self.cc_recipients.iter().map(GraphRecipient::to_address).collect(),
            bcc: self.bcc_recipients.iter().map(GraphRecipient::to_address).collect(),
            reply_to: self.reply_to.iter().map(GraphRecipient::to_address).collect(),
            labels: map_labels(self),
            has_attachments: self.has_attachments || !attachments.is_empty(),
            attachments,
            internet_message_id: self.internet_message_id.clone(),
            in_reply_to: None,
            references: None,
            folder_id: self.parent_folder_id.clone(),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InternetHeader {
    name: &'static str,
    value: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingMessage {
    subject: String,
    body: GraphBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<GraphRecipient>,
    to_recipients: Vec<GraphRecipient>,
    cc_recipients: Vec<GraphRecipient>,
    bcc_recipients: Vec<GraphRecipient>,
    reply_to: Vec<GraphRecipient>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    internet_message_headers: Vec<InternetHeader>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMailRequest {
    message: OutgoingMessage,
    save_to_sent_items: bool,
}

/// Microsoft Graph adapter bound to one access token
pub struct GraphProvider {
    executor: RequestExecutor,
    base: url::Url,
    token: String,
}

impl GraphProvider {
    /// `base` is the versioned root, e.g. `https://graph.microsoft.com/v1.0`
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

    /// Links handed back by Graph must point at the API we talk to
    fn check_link(&self, link: &str) -> TernResult<String> {
        let parsed = url::Url::parse(link)?;
        if parsed.origin() != self.base.origin() {
            return Err(TernError::validation(format!("Refusing to follow link to {}", parsed.origin().ascii_serialization())));
        }
        Ok(link.to_string())
    }

    async fn fetch_delta(&self, url: &str, query: &[(&str, String)], page_size: u32) -> TernResult<DeltaResponse> {
        debug!("GET {}", url);
        let prefer = format!("odata.maxpagesize={}", page_size.max(1));
        let response = self
            .executor
            .send(|| {
                self.executor
                    .client()
                    .get(url)
                    .bearer_auth(&self.token)
                    .header("Prefer", prefer.as_str())
                    .query(query)
            })
            .await?;
        Ok(response.json().await?)
    }

    /// Attachment metadata for one message. A message deleted since it was
    /// listed keeps no attachments; every other failure aborts the page.
    async fn fetch_attachments(&self, message_id: &str) -> TernResult<Vec<GraphAttachment>> {
        let url = self.url(&format!("me/messages/{}/attachments", message_id));
        let query = [("$select", ATTACHMENT_FIELDS.to_string())];
        match self.executor.get_json::<AttachmentList>(&url, &self.token, &query).await {
            Ok(list) => Ok(list.value),
            Err(TernError::NotFound(e)) => {
                warn!("Attachments of Graph message {} are gone: {}", message_id, e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_message(&self, id: &str) -> TernResult<GraphMessage> {
        let url = self.url(&format!("me/messages/{}", id));
        let mut message: GraphMessage = self
            .executor
            .get_json(&url, &self.token, &[("$select", MESSAGE_FIELDS.to_string())])
            .await?;
        if message.has_attachments {
            message.attachments = self.fetch_attachments(&message.id).await?;
        }
        Ok(message)
    }
}

#[async_trait]
impl MailProvider for GraphProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Microsoft
    }

    async fn get_profile(&self) -> TernResult<Profile> {
        let profile: GraphProfile = self.executor.get_json(&self.url("me"), &self.token, &[]).await?;
        let email = profile
            .mail
            .or(profile.user_principal_name)
            .ok_or_else(|| TernError::validation("Graph profile has no mailbox address"))?;
        Ok(Profile {
            email,
            display_name: profile.display_name,
        })
    }

    async fn list_messages(&self, request: &ListRequest) -> TernResult<MessagePage> {
        let response = if let Some(page_token) = &request.page_token {
            self.fetch_delta(&self.check_link(page_token)?, &[], request.page_size).await?
        } else if let Some(delta_link) = &request.cursor {
            self.fetch_delta(&self.check_link(delta_link)?, &[], request.page_size).await?
        } else {
            let mut query = vec![("$select", MESSAGE_FIELDS.to_string())];
            if let Some(since) = request.since {
                let since = since - time::Duration::nanoseconds(since.nanosecond() as i64);
                let since = since
                    .format(&Rfc3339)
                    .map_err(|e| TernError::validation(format!("Invalid sync window: {}", e)))?;
                query.push(("$filter", format!("receivedDateTime ge {}", since)));
            }
            let url = self.url("me/mailFolders/inbox/messages/delta");
            self.fetch_delta(&url, &query, request.page_size).await?
        };

        let mut natives = Vec::with_capacity(response.value.len());
        for mut message in response.value {
            if message.removed.is_some() {
                debug!("Ignoring removal of Graph message {}", message.id);
                continue;
            }
            if message.has_attachments && !message.id.is_empty() {
                message.attachments = self.fetch_attachments(&message.id).await?;
            }
            natives.push(message);
        }

        let (messages, malformed) = normalize::normalize_all(&natives);
        Ok(MessagePage {
            messages,
            next_page_token: response.next_link,
            next_cursor: response.delta_link,
            malformed,
        })
    }

    async fn get_message_detail(&self, id: &str) -> TernResult<EmailMessage> {
        self.fetch_message(id).await?.normalize()
    }

    async fn send_message(&self, params: &SendParams) -> TernResult<SentMessage> {
        if params.to.is_empty() && params.cc.is_empty() && params.bcc.is_empty() {
            return Err(TernError::validation("Message has no recipients"));
        }

        let mut headers = Vec::new();
        if let Some(in_reply_to) = &params.in_reply_to {
            headers.push(InternetHeader {
                name: "In-Reply-To",
                value: in_reply_to.clone(),
            });
        }
        if !params.references.is_empty() {
            headers.push(InternetHeader {
                name: "References",
                value: params.references.join(" "),
            });
        }

        let recipients =
            |list: &[EmailAddress]| -> Vec<GraphRecipient> { list.iter().map(GraphRecipient::from_address).collect() };
        let request = SendMailRequest {
            message: OutgoingMessage {
                subject: params.subject.clone(),
                body: GraphBody {
                    content_type: "html".to_string(),
                    content: params.body.clone(),
                },
                from: params.from.as_ref().map(GraphRecipient::from_address),
                to_recipients: recipients(&params.to),
                cc_recipients: recipients(&params.cc),
                bcc_recipients: recipients(&params.bcc),
                reply_to: recipients(&params.reply_to),
                internet_message_headers: headers,
            },
            save_to_sent_items: true,
        };

        self.executor
            .post_no_content(&self.url("me/sendMail"), &self.token, &request)
            .await?;
        Ok(SentMessage { id: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::executor::tests::test_executor;
    use serde_json::json;
    use time::OffsetDateTime;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn graph_message(id: &str, has_attachments: bool) -> serde_json::Value {
        json!({
            "id": id,
            "conversationId": "conv1",
            "subject": "Lunch?",
            "body": {"contentType": "html", "content": "<p>Lunch?</p>"},
            "bodyPreview": "Lunch?",
            "from": {"emailAddress": {"name": "Jane", "address": "Jane@Contoso.com"}},
            "toRecipients": [{"emailAddress": {"name": "Bob", "address": "bob@contoso.com"}}],
            "sentDateTime": "2024-03-01T10:00:00Z",
            "receivedDateTime": "2024-03-01T10:00:05Z",
            "isRead": false,
            "hasAttachments": has_attachments,
            "importance": "high",
            "flag": {"flagStatus": "flagged"},
            "parentFolderId": "AAMkAGI2Inbox",
            "internetMessageId": "<m@contoso.com>"
        })
    }

    fn provider(server: &MockServer) -> GraphProvider {
        GraphProvider::new(test_executor(), &format!("{}/v1.0", server.uri()), "token").unwrap()
    }

    #[test]
    fn test_label_mapping() {
        let native: GraphMessage = serde_json::from_value(graph_message("g1", false)).unwrap();
        let labels = map_labels(&native);
        assert!(labels.contains(SystemLabel::Inbox));
        assert!(labels.contains(SystemLabel::Unread));
        assert!(labels.contains(SystemLabel::Important));
        assert!(labels.contains(SystemLabel::Flagged));

        let mut value = graph_message("g2", false);
        value["parentFolderId"] = json!("JunkEmail");
        value["isRead"] = json!(true);
        value["importance"] = json!("normal");
        value["flag"] = json!({"flagStatus": "notFlagged"});
        let native: GraphMessage = serde_json::from_value(value).unwrap();
        let labels = map_labels(&native);
        assert_eq!(labels.iter().collect::<Vec<_>>(), vec![SystemLabel::Junk]);
    }

    #[test]
    fn test_normalize() {
        let native: GraphMessage = serde_json::from_value(graph_message("g1", false)).unwrap();
        let message = native.normalize().unwrap();
        assert_eq!(message.thread_id, "conv1");
        assert_eq!(message.from.address, "jane@contoso.com");
        assert_eq!(message.body.as_deref(), Some("<p>Lunch?</p>"));
        assert_eq!(message.received_at.unix_timestamp() - message.sent_at.unix_timestamp(), 5);
        assert_eq!(message.folder_id.as_deref(), Some("AAMkAGI2Inbox"));
    }

    #[tokio::test]
    async fn test_delta_paging_and_attachments() {
        let server = MockServer::start().await;
        let delta_path = "/v1.0/me/mailFolders/inbox/messages/delta";
        let next_link = format!("{}{}?$skiptoken=abc", server.uri(), delta_path);
        let delta_link = format!("{}{}?$deltatoken=xyz", server.uri(), delta_path);

        Mock::given(method("GET"))
            .and(path(delta_path))
            .and(query_param("$skiptoken", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [graph_message("g2", false), {"id": "g0", "@removed": {"reason": "deleted"}}],
                "@odata.deltaLink": delta_link
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(delta_path))
            .and(header("Prefer", "odata.maxpagesize=25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [graph_message("g1", true)],
                "@odata.nextLink": next_link
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages/g1/attachments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "a1", "name": "menu.pdf", "contentType": "application/pdf", "size": 300, "isInline": false}]
            })))
            .mount(&server)
            .await;

        let graph = provider(&server);
        let first = graph
            .list_messages(&ListRequest {
                page_size: 25,
                since: Some(OffsetDateTime::now_utc() - time::Duration::days(30)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.messages[0].attachments[0].id, "g1_menu.pdf");
        assert_eq!(first.next_page_token.as_deref(), Some(next_link.as_str()));
        assert_eq!(first.next_cursor, None);

        let second = graph
            .list_messages(&ListRequest {
                page_token: first.next_page_token.clone(),
                page_size: 25,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.messages.len(), 1);
        assert_eq!(second.next_page_token, None);
        assert_eq!(second.next_cursor.as_deref(), Some(delta_link.as_str()));
    }

    async fn list_with_attachment_status(status: u16) -> TernResult<MessagePage> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/mailFolders/inbox/messages/delta"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [graph_message("g1", true)],
                "@odata.deltaLink": format!("{}/v1.0/delta?$deltatoken=1", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages/g1/attachments"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        provider(&server)
            .list_messages(&ListRequest {
                page_size: 10,
                ..Default::default()
            })
            .await
    }

    #[tokio::test]
    async fn test_vanished_attachments_keep_message() {
        let page = list_with_attachment_status(404).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.messages[0].has_attachments);
        assert!(page.messages[0].attachments.is_empty());
        assert!(page.next_cursor.is_some());
    }

    #[tokio::test]
    async fn test_attachment_auth_failures_abort_the_page() {
        let err = list_with_attachment_status(401).await.unwrap_err();
        assert!(matches!(err, TernError::AuthExpired(_)));

        let err = list_with_attachment_status(403).await.unwrap_err();
        assert!(matches!(err, TernError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_expired_delta_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/mailFolders/inbox/messages/delta"))
            .respond_with(ResponseTemplate::new(410).set_body_string("SyncStateNotFound"))
            .mount(&server)
            .await;

        let cursor = format!("{}/v1.0/me/mailFolders/inbox/messages/delta?$deltatoken=old", server.uri());
        let err = provider(&server)
            .list_messages(&ListRequest {
                cursor: Some(cursor),
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TernError::CursorExpired(_)));
    }

    #[tokio::test]
    async fn test_foreign_page_link_is_rejected() {
        let server = MockServer::start().await;
        let err = provider(&server)
            .list_messages(&ListRequest {
                page_token: Some("https://evil.example.com/delta?$skiptoken=1".into()),
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TernError::Validation(_)));
    }

    #[tokio::test]
    async fn test_send_mail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/sendMail"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let params = SendParams {
            to: vec![EmailAddress::new(Some("Bob"), "bob@contoso.com")],
            subject: "Re: Lunch?".into(),
            body: "<p>Sure</p>".into(),
            in_reply_to: Some("<m@contoso.com>".into()),
            ..Default::default()
        };
        let sent = provider(&server).send_message(&params).await.unwrap();
        assert_eq!(sent.id, None);

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["saveToSentItems"], true);
        assert_eq!(body["message"]["toRecipients"][0]["emailAddress"]["address"], "bob@contoso.com");
        assert_eq!(body["message"]["internetMessageHeaders"][0]["name"], "In-Reply-To");
    }
}
