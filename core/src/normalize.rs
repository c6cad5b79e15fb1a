//! Normalization of provider wire formats into the canonical message model

use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::error::TernResult;
use crate::message::{AttachmentMeta, EmailAddress, EmailMessage};

/// Subject used when a message has none
pub const NO_SUBJECT: &str = "(No subject)";

/// Base64url with optional padding, as Gmail emits it
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A provider-native message that can be normalized.
///
/// Each provider deserializes its own wire type and implements this trait, so
/// provider-specific fields never leak past the adapter.
pub trait NativeMessage {
    /// Provider message id, used in logs when normalization fails
    fn native_id(&self) -> &str;

    /// Convert into the canonical model
    fn normalize(&self) -> TernResult<EmailMessage>;
}

/// A node of a MIME tree as exposed by a provider
pub trait MimePart: Sized {
    fn mime_type(&self) -> &str;
    fn filename(&self) -> Option<&str>;
    fn size(&self) -> u64;
    /// Decoded body of this part, if it carries one inline
    fn body_text(&self) -> Option<String>;
    fn children(&self) -> &[Self];
}

/// Normalize a page of native messages, dropping the malformed ones.
///
/// Returns the canonical messages and the number skipped.
pub fn normalize_all<M: NativeMessage>(natives: &[M]) -> (Vec<EmailMessage>, usize) {
    let mut messages = Vec::with_capacity(natives.len());
    let mut malformed = 0;

    for native in natives {
        match native.normalize() {
            Ok(message) => messages.push(message),
            Err(e) => {
                warn!("Skipping malformed message {}: {}", native.native_id(), e);
                malformed += 1;
            }
        }
    }

    (messages, malformed)
}

/// Parse a single mailbox such as `Jane <jane@x.com>` or `jane@x.com`.
///
/// Text that does not look like an address is kept verbatim as the address.
pub fn parse_address(raw: &str) -> EmailAddress {
    let raw = raw.trim();

    if let Ok(list) = mailparse::addrparse(raw) {
        if let Some(mailparse::MailAddr::Single(info)) = list.first() {
            if list.len() == 1 && !info.addr.is_empty() {
                let mut address = EmailAddress::new(info.display_name.as_deref(), &info.addr);
                address.raw = raw.to_string();
                return address;
            }
        }
    }

    naive_address(raw)
}

/// Split an address header into mailboxes
pub fn parse_address_list(header: &str) -> Vec<EmailAddress> {
    let header = header.trim();
    if header.is_empty() {
        return Vec::new();
    }

    match mailparse::addrparse(header) {
        Ok(list) if !list.is_empty() => {
            let mut addresses = Vec::new();
            for entry in list.iter() {
                match entry {
                    mailparse::MailAddr::Single(info) => {
                        addresses.push(EmailAddress::new(info.display_name.as_deref(), &info.addr));
                    }
                    mailparse::MailAddr::Group(group) => {
                        for info in &group.addrs {
                            addresses.push(EmailAddress::new(info.display_name.as_deref(), &info.addr));
                        }
                    }
                }
            }
            addresses
        }
        _ => header
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(naive_address)
            .collect(),
    }
}

fn naive_address(raw: &str) -> EmailAddress {
    if let (Some(open), true) = (raw.rfind('<'), raw.ends_with('>')) {
        let address = raw[open + 1..raw.len() - 1].trim();
        if !address.is_empty() {
            let name = raw[..open].trim().trim_matches('"').trim();
            let name = (!name.is_empty() && !name.eq_ignore_ascii_case(address)).then(|| name.to_string());
            return EmailAddress {
                name,
                address: address.to_lowercase(),
                raw: raw.to_string(),
            };
        }
    }

    EmailAddress {
        name: None,
        address: raw.to_lowercase(),
        raw: raw.to_string(),
    }
}

/// Decode base64url (padded or not) into UTF-8 text
pub fn decode_base64url(data: &str) -> Option<String> {
    let bytes = URL_SAFE_LENIENT.decode(data.trim()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Encode bytes as unpadded base64url
pub fn encode_base64url(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

/// Pick the preferred body of a MIME tree: HTML first, then plain text.
///
/// Each pass walks the tree depth-first and stops at the first match.
pub fn extract_body<P: MimePart>(root: &P) -> Option<String> {
    find_part_body(root, "text/html").or_else(|| find_part_body(root, "text/plain"))
}

fn find_part_body<P: MimePart>(part: &P, mime_type: &str) -> Option<String> {
    if part.mime_type().eq_ignore_ascii_case(mime_type) {
        if let Some(body) = part.body_text().filter(|b| !b.is_empty()) {
            return Some(body);
        }
    }
    part.children()
        .iter()
        .find_map(|child| find_part_body(child, mime_type))
}

/// Collect attachment metadata from every part with a filename and content
pub fn collect_attachments<P: MimePart>(message_id: &str, root: &P) -> Vec<AttachmentMeta> {
    let mut attachments = Vec::new();
    walk_attachments(message_id, root, &mut attachments);
    attachments
}

fn walk_attachments<P: MimePart>(message_id: &str, part: &P, out: &mut Vec<AttachmentMeta>) {
    if let Some(name) = part.filename().filter(|n| !n.is_empty()) {
        if part.size() > 0 {
            out.push(AttachmentMeta::new(message_id, name, part.mime_type(), part.size(), false));
        }
    }
    for child in part.children() {
        walk_attachments(message_id, child, out);
    }
}

/// Body to store: the extracted body, or the snippet when there is none
pub fn body_or_snippet(body: Option<String>, snippet: Option<&str>) -> Option<String> {
    body.filter(|b| !b.trim().is_empty())
        .or_else(|| snippet.filter(|s| !s.is_empty()).map(str::to_string))
}

/// Subject to store, never empty
pub fn subject_or_default(subject: Option<&str>) -> String {
    subject
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(NO_SUBJECT)
        .to_string()
}

/// Timestamp from epoch milliseconds
pub fn from_epoch_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).ok()
}

/// Timestamp from an RFC 3339 string
pub fn parse_rfc3339(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}
