//! RFC 2822 message composition for providers that accept raw MIME

use lettre::message::{header::ContentType, Mailbox};
use lettre::Message;

use crate::error::{TernError, TernResult};
use crate::message::{EmailAddress, SendParams};

/// Build the raw RFC 2822 bytes of an outgoing HTML message.
///
/// `default_from` is used when the caller did not pick a sender. Bcc
/// recipients are kept in the headers since the provider reads them from
/// the raw message.
pub fn compose_rfc2822(params: &SendParams, default_from: &EmailAddress) -> TernResult<Vec<u8>> {
    if params.to.is_empty() && params.cc.is_empty() && params.bcc.is_empty() {
        return Err(TernError::validation("Message has no recipients"));
    }

    let from = params.from.as_ref().unwrap_or(default_from);
    let mut builder = Message::builder()
        .from(to_mailbox(from)?)
        .subject(params.subject.clone())
        .keep_bcc();

    for addr in &params.to {
        builder = builder.to(to_mailbox(addr)?);
    }

    for addr in &params.cc {
        builder = builder.cc(to_mailbox(addr)?);
    }

    for addr in &params.bcc {
        builder = builder.bcc(to_mailbox(addr)?);
    }

    for addr in &params.reply_to {
        builder = builder.reply_to(to_mailbox(addr)?);
    }

    if let Some(in_reply_to) = &params.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }

    if !params.references.is_empty() {
        builder = builder.references(params.references.join(" "));
    }

    let message = builder
        .header(ContentType::TEXT_HTML)
        .body(params.body.clone())?;

    Ok(message.formatted())
}

fn to_mailbox(addr: &EmailAddress) -> TernResult<Mailbox> {
    Ok(Mailbox::new(addr.name.clone(), addr.address.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SendParams {
        SendParams {
            to: vec![EmailAddress::new(Some("Bob"), "bob@example.com")],
            bcc: vec![EmailAddress::new(None, "hidden@example.com")],
            subject: "Quarterly report".into(),
            body: "<p>See attached</p>".into(),
            in_reply_to: Some("<abc@mail.example.com>".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_compose_headers() {
        let me = EmailAddress::new(Some("Jane"), "jane@example.com");
        let raw = String::from_utf8(compose_rfc2822(&params(), &me).unwrap()).unwrap();

        assert!(raw.contains("From: Jane <jane@example.com>"));
        assert!(raw.contains("To: Bob <bob@example.com>"));
        assert!(raw.contains("Bcc: hidden@example.com"));
        assert!(raw.contains("Subject: Quarterly report"));
        assert!(raw.contains("In-Reply-To: <abc@mail.example.com>"));
        assert!(raw.contains("Content-Type: text/html"));
    }

    #[test]
    fn test_compose_requires_recipients() {
        let me = EmailAddress::new(None, "jane@example.com");
        let params = SendParams {
            subject: "empty".into(),
            ..Default::default()
        };
        assert!(matches!(compose_rfc2822(&params, &me), Err(TernError::Validation(_))));
    }

    #[test]
    fn test_compose_rejects_bad_address() {
        let me = EmailAddress::new(None, "jane@example.com");
        let mut params = params();
        params.to = vec![EmailAddress::new(None, "not an address")];
        assert!(matches!(compose_rfc2822(&params, &me), Err(TernError::AddressParsing(_))));
    }
}
