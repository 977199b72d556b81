//! Rebuilds the outbound MIME message with `lettre`.
//!
//! The submitted message is never forwarded verbatim: headers are rebuilt
//! from the parsed fields, the (already rewritten) bodies and attachments are
//! re-encoded and the tracking headers are added.

use lettre::{
    Address, Message,
    message::{
        Attachment as AttachmentPart, Mailbox, MultiPart, SinglePart,
        header::{ContentType, Header, HeaderName, HeaderValue},
    },
};
use smtpflow_common::tracking::TrackingId;

use crate::{
    error::ComposeError,
    message::{Contact, OutboundMessage},
    relay::RelayEnvelope,
};

macro_rules! text_header {
    ($ty:ident, $name:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $ty(pub String);

        impl Header for $ty {
            fn name() -> HeaderName {
                HeaderName::new_from_ascii_str($name)
            }

            fn parse(value: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
                Ok(Self(value.to_owned()))
            }

            fn display(&self) -> HeaderValue {
                HeaderValue::new(Self::name(), self.0.clone())
            }
        }
    };
}

text_header!(TrackingHeader, "X-SMTPFlow-ID");
text_header!(MailerHeader, "X-Mailer");
text_header!(ListUnsubscribeHeader, "List-Unsubscribe");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeSettings {
    /// Public base URL of the tracking front door.
    pub base_url: String,
    /// Domain of the `bounce+{id}@` envelope sender.
    pub bounce_domain: String,
}

/// A message ready for the relay.
#[derive(Debug, Clone)]
pub struct Composed {
    pub envelope: RelayEnvelope,
    pub message: Vec<u8>,
}

/// Build the outbound message.
///
/// `sender` is the visible From. `recipients` are the envelope recipients;
/// when empty the To and Cc headers are used instead, and when the message
/// has no To header the envelope recipients fill it.
pub fn compose(
    message: &OutboundMessage,
    sender: &Contact,
    recipients: &[String],
    tracking_id: &TrackingId,
    settings: &ComposeSettings,
) -> Result<Composed, ComposeError> {
    let recipients: Vec<String> = if recipients.is_empty() {
        message
            .to
            .iter()
            .chain(&message.cc)
            .map(|contact| contact.email.clone())
            .collect()
    } else {
        recipients.to_vec()
    };

    if recipients.is_empty() {
        return Err(ComposeError::NoRecipients);
    }

    let envelope = RelayEnvelope {
        sender: tracking_id.bounce_address(&settings.bounce_domain),
        recipients: recipients
            .iter()
            .map(|recipient| address(recipient).map(|address| address.to_string()))
            .collect::<Result<_, _>>()?,
    };
    address(&envelope.sender)?;

    let mut builder = Message::builder()
        .from(mailbox(sender)?)
        .subject(message.subject.clone())
        .header(TrackingHeader(tracking_id.to_string()))
        .header(MailerHeader(format!(
            "smtpflow/{}",
            env!("CARGO_PKG_VERSION")
        )))
        .header(ListUnsubscribeHeader(format!(
            "<{}/unsubscribe/{tracking_id}>",
            settings.base_url.trim_end_matches('/')
        )));

    if message.to.is_empty() {
        for recipient in &recipients {
            builder = builder.to(mailbox(&Contact::new(recipient.clone()))?);
        }
    } else {
        for to in &message.to {
            builder = builder.to(mailbox(to)?);
        }
    }

    for cc in &message.cc {
        builder = builder.cc(mailbox(cc)?);
    }

    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(mailbox(reply_to)?);
    }

    let body = Body::of(message);
    let built = if message.attachments.is_empty() {
        match body {
            Body::Single(part) => builder.singlepart(part),
            Body::Alternative(parts) => builder.multipart(parts),
        }
    } else {
        let mut mixed = match body {
            Body::Single(part) => MultiPart::mixed().singlepart(part),
            Body::Alternative(parts) => MultiPart::mixed().multipart(parts),
        };

        for attachment in &message.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|err| ComposeError::Build(err.to_string()))?;

            mixed = mixed.singlepart(
                AttachmentPart::new(attachment.filename.clone())
                    .body(attachment.content.clone(), content_type),
            );
        }

        builder.multipart(mixed)
    };

    let built = built.map_err(|err| ComposeError::Build(err.to_string()))?;

    Ok(Composed {
        envelope,
        message: built.formatted(),
    })
}

enum Body {
    Single(SinglePart),
    Alternative(MultiPart),
}

impl Body {
    fn of(message: &OutboundMessage) -> Self {
        match (&message.text, &message.html) {
            (Some(text), Some(html)) => {
                Self::Alternative(MultiPart::alternative_plain_html(text.clone(), html.clone()))
            }
            (None, Some(html)) => Self::Single(SinglePart::html(html.clone())),
            (Some(text), None) => Self::Single(SinglePart::plain(text.clone())),
            (None, None) => Self::Single(SinglePart::plain(String::new())),
        }
    }
}

fn address(email: &str) -> Result<Address, ComposeError> {
    email
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .parse()
        .map_err(|_| ComposeError::InvalidAddress(email.to_owned()))
}

fn mailbox(contact: &Contact) -> Result<Mailbox, ComposeError> {
    Ok(Mailbox::new(contact.name.clone(), address(&contact.email)?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::message::Attachment;

    fn settings() -> ComposeSettings {
        ComposeSettings {
            base_url: "https://mail.test/".into(),
            bounce_domain: "bounces.test".into(),
        }
    }

    fn id() -> TrackingId {
        "0123456789abcdef0123456789abcdef".parse().unwrap()
    }

    fn headers(composed: &Composed) -> String {
        let text = String::from_utf8(composed.message.clone()).unwrap();
        text.split("\r\n\r\n").next().unwrap().to_owned()
    }

    #[test]
    fn envelope_uses_bounce_sender() {
        let message = OutboundMessage {
            to: vec![Contact::new("bob@example.test")],
            subject: "Hi".into(),
            text: Some("Hello".into()),
            ..OutboundMessage::default()
        };

        let composed = compose(
            &message,
            &Contact::new("alice@example.test").with_name(Some("Alice".into())),
            &["bob@example.test".into(), "hidden@example.test".into()],
            &id(),
            &settings(),
        )
        .unwrap();

        assert_eq!(
            composed.envelope,
            RelayEnvelope {
                sender: "bounce+0123456789abcdef0123456789abcdef@bounces.test".into(),
                recipients: vec!["bob@example.test".into(), "hidden@example.test".into()],
            }
        );

        let headers = headers(&composed);
        assert!(headers.contains("From: Alice <alice@example.test>"));
        assert!(headers.contains("To: bob@example.test"));
        assert!(!headers.contains("hidden@example.test"));
        assert!(headers.contains("X-SMTPFlow-ID: 0123456789abcdef0123456789abcdef"));
        assert!(headers.contains(concat!("X-Mailer: smtpflow/", env!("CARGO_PKG_VERSION"))));
        assert!(headers.contains(
            "List-Unsubscribe: <https://mail.test/unsubscribe/0123456789abcdef0123456789abcdef>"
        ));
    }

    #[test]
    fn header_recipients_used_when_envelope_is_empty() {
        let message = OutboundMessage {
            to: vec![Contact::new("bob@example.test")],
            cc: vec![Contact::new("carol@example.test")],
            html: Some("<p>Hi</p>".into()),
            ..OutboundMessage::default()
        };

        let composed = compose(
            &message,
            &Contact::new("alice@example.test"),
            &[],
            &id(),
            &settings(),
        )
        .unwrap();

        assert_eq!(
            composed.envelope.recipients,
            vec!["bob@example.test".to_owned(), "carol@example.test".to_owned()]
        );
        assert!(headers(&composed).contains("Cc: carol@example.test"));
    }

    #[test]
    fn alternative_and_attachments() {
        let message = OutboundMessage {
            subject: "Report".into(),
            text: Some("plain body".into()),
            html: Some("<p>html body</p>".into()),
            attachments: vec![Attachment {
                filename: "report.csv".into(),
                content_type: "text/csv".into(),
                content: b"a,b\n".to_vec(),
            }],
            ..OutboundMessage::default()
        };

        let composed = compose(
            &message,
            &Contact::new("alice@example.test"),
            &["bob@example.test".into()],
            &id(),
            &settings(),
        )
        .unwrap();
        let text = String::from_utf8(composed.message).unwrap();

        assert!(text.contains("multipart/mixed"));
        assert!(text.contains("multipart/alternative"));
        assert!(text.contains("report.csv"));
        assert!(text.contains("To: bob@example.test"));
    }

    #[test]
    fn rejects_missing_and_invalid_recipients() {
        let message = OutboundMessage::default();
        let sender = Contact::new("alice@example.test");

        assert!(matches!(
            compose(&message, &sender, &[], &id(), &settings()),
            Err(ComposeError::NoRecipients)
        ));
        assert!(matches!(
            compose(&message, &sender, &["not an address".into()], &id(), &settings()),
            Err(ComposeError::InvalidAddress(_))
        ));
        assert!(matches!(
            compose(
                &message,
                &Contact::new("nobody"),
                &["bob@example.test".into()],
                &id(),
                &settings()
            ),
            Err(ComposeError::InvalidAddress(_))
        ));
    }
}
