//! The parsed form of a submitted message.
//!
//! SMTP clients hand over raw RFC 5322 bytes which are parsed with
//! `mailparse`; the HTTP API builds an [`OutboundMessage`] directly. Parsing
//! never fails: unparseable input is relayed as a plain-text body holding the
//! raw text.

use std::fmt;

use mailparse::{DispositionType, MailAddr, MailHeader, MailHeaderMap, ParsedMail};
use smtpflow_common::internal;

/// A mailbox with an optional display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: Option<String>,
    pub email: String,
}

impl Contact {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name.filter(|name| !name.trim().is_empty());
        self
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name:?} <{}>", self.email),
            None => f.write_str(&self.email),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.content.len())
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: Option<Contact>,
    pub to: Vec<Contact>,
    pub cc: Vec<Contact>,
    pub reply_to: Option<Contact>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl OutboundMessage {
    /// Parse the DATA of an SMTP transaction.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        match mailparse::parse_mail(raw) {
            Ok(parsed) => Self::from_parsed(&parsed),
            Err(err) => {
                internal!(level = DEBUG, "Relaying unparseable message as text: {err}");
                Self {
                    text: Some(String::from_utf8_lossy(raw).into_owned()),
                    ..Self::default()
                }
            }
        }
    }

    fn from_parsed(mail: &ParsedMail<'_>) -> Self {
        let headers = &mail.headers;
        let mut message = Self {
            from: contacts(headers, "From").into_iter().next(),
            to: contacts(headers, "To"),
            cc: contacts(headers, "Cc"),
            reply_to: contacts(headers, "Reply-To").into_iter().next(),
            subject: headers.get_first_value("Subject").unwrap_or_default(),
            ..Self::default()
        };

        message.collect(mail);
        message
    }

    fn collect(&mut self, part: &ParsedMail<'_>) {
        if !part.subparts.is_empty() {
            for sub in &part.subparts {
                self.collect(sub);
            }
            return;
        }

        let disposition = part.get_content_disposition();
        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        let inline = disposition.disposition != DispositionType::Attachment;

        if inline && mimetype == "text/plain" && self.text.is_none() {
            self.text = part.get_body().ok();
            return;
        }

        if inline && mimetype == "text/html" && self.html.is_none() {
            self.html = part.get_body().ok();
            return;
        }

        match part.get_body_raw() {
            Ok(content) => {
                let filename = disposition
                    .params
                    .get("filename")
                    .or_else(|| part.ctype.params.get("name"))
                    .cloned()
                    .unwrap_or_else(|| format!("attachment-{}", self.attachments.len() + 1));

                self.attachments.push(Attachment {
                    filename,
                    content_type: mimetype,
                    content,
                });
            }
            Err(err) => {
                internal!(level = DEBUG, "Dropping undecodable {mimetype} part: {err}");
            }
        }
    }
}

fn contacts(headers: &[MailHeader<'_>], name: &str) -> Vec<Contact> {
    headers
        .get_all_headers(name)
        .into_iter()
        .filter_map(|header| mailparse::addrparse_header(header).ok())
        .flat_map(|list| flatten(list.iter()))
        .collect()
}

fn flatten<'a>(addresses: impl Iterator<Item = &'a MailAddr>) -> Vec<Contact> {
    addresses
        .flat_map(|address| match address {
            MailAddr::Single(single) => vec![single.clone()],
            MailAddr::Group(group) => group.addrs.clone(),
        })
        .map(|single| Contact::new(single.addr).with_name(single.display_name))
        .collect()
}
