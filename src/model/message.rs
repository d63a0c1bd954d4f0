//! Captured messages: identity, envelope, raw bytes and the lazily parsed view.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::model::address::EmailAddress;
use crate::parser::header::{decode_charset, Headers};
use crate::parser::mime;

/// Store-assigned message identity. Starts at 1 and is never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(MessageId)
    }
}

/// SMTP envelope of one mail transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    /// Reverse path from `MAIL FROM`. Empty for the null sender `<>`.
    pub sender: String,
    /// Forward paths from `RCPT TO`, never empty.
    pub recipients: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(
        sender: impl Into<String>,
        recipients: Vec<String>,
    ) -> std::result::Result<Self, IngestError> {
        if recipients.is_empty() {
            return Err(IngestError::Rejected("no recipients".into()));
        }
        Ok(Self {
            sender: sender.into(),
            recipients,
            received_at: Utc::now(),
        })
    }
}

/// A captured message as held by the store.
///
/// The raw bytes never change after construction. The parsed view is computed
/// on first access and shared by every later caller.
#[derive(Debug)]
pub struct Message {
    id: MessageId,
    envelope: Envelope,
    raw: Box<[u8]>,
    created_at: DateTime<Utc>,
    subject: String,
    content_type: String,
    header_from: Option<EmailAddress>,
    parsed: OnceLock<Result<Arc<ParsedView>>>,
}

impl Message {
    /// Prepare a message for insertion. Only the header block is read here.
    pub(crate) fn new(envelope: Envelope, raw: Vec<u8>) -> Self {
        let (head, _) = mime::split_head_body(&raw);
        let headers = Headers::parse(head);
        let header_from = headers
            .get("from")
            .and_then(|from| EmailAddress::parse_list(from).into_iter().next());

        Self {
            id: MessageId(0),
            subject: headers.subject(),
            content_type: headers.content_type(),
            header_from,
            envelope,
            raw: raw.into_boxed_slice(),
            created_at: Utc::now(),
            parsed: OnceLock::new(),
        }
    }

    /// Give the message its identity. Called under the store's write lock,
    /// so `created_at` never decreases as ids increase.
    pub(crate) fn assign_id(&mut self, id: MessageId) {
        self.id = id;
        self.created_at = Utc::now();
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The message exactly as it was submitted.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// Parsed structure, computed once. Concurrent first calls converge on
    /// the same result.
    pub fn parsed(&self) -> Result<Arc<ParsedView>> {
        self.parsed
            .get_or_init(|| mime::parse(&self.raw).map(Arc::new))
            .clone()
    }

    /// Sender for display: the envelope sender, or the `From:` address when
    /// the envelope carried the null reverse path.
    pub fn sender(&self) -> String {
        if !self.envelope.sender.is_empty() {
            return self.envelope.sender.clone();
        }
        self.header_from
            .as_ref()
            .map(|a| a.address.clone())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            id: self.id,
            sender: self.sender(),
            recipients: self.envelope.recipients.clone(),
            subject: self.subject.clone(),
            size: self.size(),
            content_type: self.content_type.clone(),
            created_at: self.created_at,
        }
    }
}

/// One row of the message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSummary {
    pub id: MessageId,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub size: usize,
    #[serde(rename = "type")]
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

/// Structured view of a message, derived from its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedView {
    pub headers: Headers,
    /// Lowercased top-level content type (`text/plain` when absent).
    pub content_type: String,
    /// Leaf parts in document order; `parts[i].index == i`.
    pub parts: Vec<Part>,
}

impl ParsedView {
    pub fn part(&self, index: usize) -> Option<&Part> {
        self.parts.get(index)
    }

    pub fn part_by_cid(&self, cid: &str) -> Option<&Part> {
        let cid = cid.trim_start_matches('<').trim_end_matches('>');
        self.parts
            .iter()
            .find(|p| p.content_id.as_deref() == Some(cid))
    }

    /// First `text/plain` body part that is not an attachment.
    pub fn plain(&self) -> Option<&Part> {
        self.parts
            .iter()
            .find(|p| !p.is_attachment() && p.content_type == "text/plain")
    }

    /// First HTML body part that is not an attachment.
    pub fn html(&self) -> Option<&Part> {
        self.parts.iter().find(|p| {
            !p.is_attachment()
                && (p.content_type == "text/html" || p.content_type == "application/xhtml+xml")
        })
    }

    pub fn attachments(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|p| p.is_attachment())
    }
}

/// One addressable leaf of a message body, transfer-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub index: usize,
    /// Lowercased MIME type, e.g. `image/png`.
    pub content_type: String,
    pub charset: Option<String>,
    /// Lowercased `Content-Disposition` value (`inline`, `attachment`).
    pub disposition: Option<String>,
    pub filename: Option<String>,
    /// `Content-ID` without angle brackets.
    pub content_id: Option<String>,
    pub body: Vec<u8>,
}

impl Part {
    pub fn is_attachment(&self) -> bool {
        self.disposition.as_deref() == Some("attachment") || self.filename.is_some()
    }

    /// `Content-Type` value to serve this part with, charset included.
    pub fn mime_type(&self) -> String {
        match &self.charset {
            Some(cs) => format!("{}; charset={cs}", self.content_type),
            None => self.content_type.clone(),
        }
    }

    /// Body decoded to text using the declared charset (UTF-8 by default).
    pub fn text(&self) -> String {
        decode_charset(self.charset.as_deref().unwrap_or("utf-8"), &self.body)
    }

    pub fn summary(&self) -> PartSummary {
        PartSummary {
            index: self.index,
            content_type: self.content_type.clone(),
            filename: self.filename.clone(),
            cid: self.content_id.clone(),
            size: self.body.len(),
            attachment: self.is_attachment(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartSummary {
    pub index: usize,
    #[serde(rename = "type")]
    pub content_type: String,
    pub filename: Option<String>,
    pub cid: Option<String>,
    pub size: usize,
    pub attachment: bool,
}

/// Store change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Event {
    Added(MessageId),
    Removed(MessageId),
    /// Every message was deleted at once; ids in ascending order.
    Cleared(Vec<MessageId>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: &str, raw: &str) -> Message {
        let envelope = Envelope::new(sender, vec!["to@example.com".into()]).unwrap();
        Message::new(envelope, raw.as_bytes().to_vec())
    }

    #[test]
    fn test_envelope_requires_recipients() {
        assert!(matches!(
            Envelope::new("a@b.c", vec![]),
            Err(IngestError::Rejected(_))
        ));
    }

    #[test]
    fn test_summary_reads_headers() {
        let msg = message(
            "a@b.c",
            "Subject: =?UTF-8?B?SG9sYQ==?=\r\nContent-Type: text/html\r\n\r\n<p>x</p>",
        );
        let summary = msg.summary();
        assert_eq!(summary.subject, "Hola");
        assert_eq!(summary.content_type, "text/html");
        assert_eq!(summary.size, msg.raw().len());
    }

    #[test]
    fn test_null_sender_falls_back_to_from_header() {
        let msg = message("", "From: Robot <robot@example.com>\r\n\r\nbody");
        assert_eq!(msg.sender(), "robot@example.com");
    }

    #[test]
    fn test_parsed_view_is_memoized() {
        let msg = message("a@b.c", "Subject: x\n\nHello");
        let first = msg.parsed().unwrap();
        let second = msg.parsed().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_message_id_from_str() {
        assert_eq!("42".parse::<MessageId>().unwrap(), MessageId(42));
        assert!("x".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_event_json() {
        let json = serde_json::to_string(&Event::Added(MessageId(3))).unwrap();
        assert_eq!(json, r#"{"type":"added","id":3}"#);

        let cleared = Event::Cleared(vec![MessageId(1), MessageId(2)]);
        let json = serde_json::to_string(&cleared).unwrap();
        assert_eq!(json, r#"{"type":"cleared","id":[1,2]}"#);
    }
}
