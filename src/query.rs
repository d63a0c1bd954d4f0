//! Query side: reads, renders and deletes captured messages for a viewer.
//!
//! [`QueryAdapter`] exposes one method per capability. [`QueryRequest`] and
//! [`QueryAdapter::handle`] give a web front end a transport-agnostic way to
//! dispatch a decoded route and get back status, content type and body.

use std::collections::VecDeque;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::model::message::{Event, Message, MessageId, MessageSummary, Part, PartSummary};
use crate::parser::header::{parse_date, Headers};
use crate::parser::mime::split_head_body;
use crate::store::{MessageStore, Subscription};

/// Content type used for raw message source.
pub const SOURCE_CONTENT_TYPE: &str = "text/plain";
/// Content type used for `.eml` downloads.
pub const EML_CONTENT_TYPE: &str = "message/rfc822";

/// Full metadata of one message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageDetail {
    #[serde(flatten)]
    pub summary: MessageSummary,
    pub headers: Headers,
    /// Parsed `Date:` header, if present and readable.
    pub date: Option<DateTime<Utc>>,
    /// Representations available: always `source`, plus `html`/`plain`.
    pub formats: Vec<&'static str>,
    pub parts: Vec<PartSummary>,
    pub attachments: Vec<PartSummary>,
    /// `true` when the body structure could not be parsed and only the
    /// source is available.
    pub degraded: bool,
}

/// Bytes of one representation of a message, with the type to serve them as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartBody {
    pub content_type: String,
    /// Suggested download name.
    pub filename: Option<String>,
    pub body: Vec<u8>,
    /// Raw source served in place of a part that could not be parsed.
    pub degraded: bool,
}

impl PartBody {
    fn from_part(part: Part) -> Self {
        Self {
            content_type: part.mime_type(),
            filename: part.filename,
            body: part.body,
            degraded: false,
        }
    }

    fn raw_fallback(message: &Message) -> Self {
        Self {
            content_type: SOURCE_CONTENT_TYPE.to_string(),
            filename: None,
            body: message.raw().to_vec(),
            degraded: true,
        }
    }
}

/// A live-update notification rendered for viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveUpdate {
    Add { message: MessageSummary },
    Remove { id: MessageId },
}

/// Stream of [`LiveUpdate`]s for one viewer. Dropping it unsubscribes.
pub struct LiveUpdates {
    subscription: Subscription,
    store: Arc<MessageStore>,
    /// Removals still to hand out from a `Cleared` event.
    pending: VecDeque<MessageId>,
}

impl LiveUpdates {
    fn render(&mut self, event: Event) -> Option<LiveUpdate> {
        match event {
            // Already deleted again: its `Removed` event follows
            Event::Added(id) => self.store.get(id).ok().map(|m| LiveUpdate::Add {
                message: m.summary(),
            }),
            Event::Removed(id) => Some(LiveUpdate::Remove { id }),
            Event::Cleared(ids) => {
                self.pending.extend(ids);
                self.next_pending()
            }
        }
    }

    fn next_pending(&mut self) -> Option<LiveUpdate> {
        self.pending.pop_front().map(|id| LiveUpdate::Remove { id })
    }

    /// Wait up to `timeout` for the next update.
    ///
    /// `Disconnected` means the stream is over (the viewer fell behind or
    /// the store went away); the caller should drop it.
    pub fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> std::result::Result<LiveUpdate, RecvTimeoutError> {
        if let Some(update) = self.next_pending() {
            return Ok(update);
        }
        loop {
            let event = self.subscription.recv_timeout(timeout)?;
            if let Some(update) = self.render(event) {
                return Ok(update);
            }
        }
    }

    pub fn is_overflowed(&self) -> bool {
        self.subscription.is_overflowed()
    }
}

impl Iterator for LiveUpdates {
    type Item = LiveUpdate;

    fn next(&mut self) -> Option<LiveUpdate> {
        if let Some(update) = self.next_pending() {
            return Some(update);
        }
        loop {
            let event = self.subscription.recv()?;
            if let Some(update) = self.render(event) {
                return Some(update);
            }
        }
    }
}

/// A decoded viewer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRequest {
    List,
    Message(MessageId),
    Plain(MessageId),
    Html(MessageId),
    Source(MessageId),
    Eml(MessageId),
    Part { id: MessageId, index: usize },
    PartByCid { id: MessageId, cid: String },
    Delete(MessageId),
    DeleteAll,
    Updates,
}

impl QueryRequest {
    /// Map an HTTP-style method and path onto a request.
    ///
    /// ```
    /// use mailsnare::query::QueryRequest;
    /// use mailsnare::model::message::MessageId;
    ///
    /// assert_eq!(
    ///     QueryRequest::from_route("GET", "/messages/3.plain"),
    ///     Some(QueryRequest::Plain(MessageId(3)))
    /// );
    /// ```
    pub fn from_route(method: &str, path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or_default();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        match (method.to_ascii_uppercase().as_str(), segments.as_slice()) {
            ("GET", ["messages"]) => Some(Self::List),
            ("DELETE", ["messages"]) => Some(Self::DeleteAll),
            ("GET", ["messages", "updates"]) => Some(Self::Updates),
            ("GET", ["messages", file]) => {
                let (id, format) = file.rsplit_once('.')?;
                let id = id.parse().ok()?;
                match format {
                    "json" => Some(Self::Message(id)),
                    "plain" => Some(Self::Plain(id)),
                    "html" => Some(Self::Html(id)),
                    "source" => Some(Self::Source(id)),
                    "eml" => Some(Self::Eml(id)),
                    _ => None,
                }
            }
            ("DELETE", ["messages", id]) => id.parse().ok().map(Self::Delete),
            ("GET", ["messages", id, "parts", "cid", cid]) if !cid.is_empty() => {
                Some(Self::PartByCid {
                    id: id.parse().ok()?,
                    cid: (*cid).to_string(),
                })
            }
            ("GET", ["messages", id, "parts", index]) => Some(Self::Part {
                id: id.parse().ok()?,
                index: index.parse().ok()?,
            }),
            _ => None,
        }
    }
}

/// Rendered answer to a [`QueryRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    /// HTTP-style status: 200, 204, 404, 500 or 503.
    pub status: u16,
    pub content_type: String,
    pub filename: Option<String>,
    pub body: Vec<u8>,
    pub degraded: bool,
}

impl QueryResponse {
    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status: 200,
                content_type: "application/json".to_string(),
                filename: None,
                body,
                degraded: false,
            },
            Err(e) => Self::text(500, &e.to_string()),
        }
    }

    fn text(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            filename: None,
            body: message.as_bytes().to_vec(),
            degraded: false,
        }
    }

    fn no_content() -> Self {
        Self {
            status: 204,
            content_type: "text/plain".to_string(),
            filename: None,
            body: Vec::new(),
            degraded: false,
        }
    }

    fn from_body(body: PartBody) -> Self {
        Self {
            status: 200,
            content_type: body.content_type,
            filename: body.filename,
            body: body.body,
            degraded: body.degraded,
        }
    }

    fn from_error(error: StoreError) -> Self {
        let status = match &error {
            e if e.is_not_found() => 404,
            StoreError::Unavailable => 503,
            _ => 500,
        };
        Self::text(status, &error.to_string())
    }
}

/// Outcome of [`QueryAdapter::handle`].
pub enum Reply {
    Response(QueryResponse),
    /// The caller keeps this open and forwards updates until the viewer leaves.
    Updates(LiveUpdates),
}

/// Read/delete access to the store for viewers.
#[derive(Debug, Clone)]
pub struct QueryAdapter {
    store: Arc<MessageStore>,
}

impl QueryAdapter {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<MessageSummary>> {
        self.store.list()
    }

    pub fn message(&self, id: MessageId) -> Result<MessageDetail> {
        let message = self.store.get(id)?;
        let summary = message.summary();

        match message.parsed() {
            Ok(view) => {
                let mut formats = vec!["source"];
                if view.html().is_some() {
                    formats.push("html");
                }
                if view.plain().is_some() {
                    formats.push("plain");
                }
                Ok(MessageDetail {
                    summary,
                    date: view.headers.get("date").and_then(parse_date),
                    headers: view.headers.clone(),
                    formats,
                    parts: view.parts.iter().map(Part::summary).collect(),
                    attachments: view.attachments().map(Part::summary).collect(),
                    degraded: false,
                })
            }
            Err(StoreError::ParseFailed(reason)) => {
                warn!(%id, %reason, "Serving message metadata without parts");
                let headers = Headers::parse(split_head_body(message.raw()).0);
                Ok(MessageDetail {
                    summary,
                    date: headers.get("date").and_then(parse_date),
                    headers,
                    formats: vec!["source"],
                    parts: Vec::new(),
                    attachments: Vec::new(),
                    degraded: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Part `index` of message `id` with its content type.
    pub fn part(&self, id: MessageId, index: usize) -> Result<PartBody> {
        self.with_part(id, |_| self.store.get_part(id, index))
    }

    pub fn part_by_cid(&self, id: MessageId, cid: &str) -> Result<PartBody> {
        self.with_part(id, |_| self.store.get_part_by_cid(id, cid))
    }

    /// The first plain-text body part.
    pub fn plain(&self, id: MessageId) -> Result<PartBody> {
        self.with_part(id, |message| {
            message
                .parsed()?
                .plain()
                .cloned()
                .ok_or_else(|| StoreError::PartNotFound {
                    id,
                    part: "plain".into(),
                })
        })
    }

    /// The first HTML body part, with `cid:` references pointed at the
    /// part route so inline images resolve.
    pub fn html(&self, id: MessageId) -> Result<PartBody> {
        let mut body = self.with_part(id, |message| {
            message
                .parsed()?
                .html()
                .cloned()
                .ok_or_else(|| StoreError::PartNotFound {
                    id,
                    part: "html".into(),
                })
        })?;

        if !body.degraded {
            let charset = body
                .content_type
                .split_once("charset=")
                .map(|(_, cs)| cs.trim().to_string())
                .unwrap_or_else(|| "utf-8".to_string());
            let html = crate::parser::header::decode_charset(&charset, &body.body);
            let html = rewrite_cid_links(&html, &format!("/messages/{id}/parts/cid/"));
            body.body = html.into_bytes();
            body.content_type = "text/html; charset=utf-8".to_string();
        }
        Ok(body)
    }

    /// Raw message exactly as received.
    pub fn source(&self, id: MessageId) -> Result<PartBody> {
        let message = self.store.get(id)?;
        Ok(PartBody {
            content_type: SOURCE_CONTENT_TYPE.to_string(),
            filename: None,
            body: message.raw().to_vec(),
            degraded: false,
        })
    }

    /// Raw message as a `.eml` download.
    pub fn eml(&self, id: MessageId) -> Result<PartBody> {
        let message = self.store.get(id)?;
        Ok(PartBody {
            content_type: EML_CONTENT_TYPE.to_string(),
            filename: Some(format!("{id}.eml")),
            body: message.raw().to_vec(),
            degraded: false,
        })
    }

    pub fn delete(&self, id: MessageId) -> Result<()> {
        self.store.delete(id)
    }

    pub fn delete_all(&self) -> Result<usize> {
        self.store.delete_all()
    }

    /// Subscribe to live updates. Drop the returned stream on disconnect.
    pub fn updates(&self) -> LiveUpdates {
        LiveUpdates {
            subscription: self.store.subscribe(),
            store: Arc::clone(&self.store),
            pending: VecDeque::new(),
        }
    }

    /// Run a decoded request and render the result.
    pub fn handle(&self, request: QueryRequest) -> Reply {
        debug!(?request, "Handling query");
        let result = match request {
            QueryRequest::List => self.list().map(|list| QueryResponse::json(&list)),
            QueryRequest::Message(id) => self.message(id).map(|m| QueryResponse::json(&m)),
            QueryRequest::Plain(id) => self.plain(id).map(QueryResponse::from_body),
            QueryRequest::Html(id) => self.html(id).map(QueryResponse::from_body),
            QueryRequest::Source(id) => self.source(id).map(QueryResponse::from_body),
            QueryRequest::Eml(id) => self.eml(id).map(QueryResponse::from_body),
            QueryRequest::Part { id, index } => {
                self.part(id, index).map(QueryResponse::from_body)
            }
            QueryRequest::PartByCid { id, cid } => {
                self.part_by_cid(id, &cid).map(QueryResponse::from_body)
            }
            QueryRequest::Delete(id) => self.delete(id).map(|()| QueryResponse::no_content()),
            QueryRequest::DeleteAll => self
                .delete_all()
                .map(|count| QueryResponse::json(&serde_json::json!({ "count": count }))),
            QueryRequest::Updates => return Reply::Updates(self.updates()),
        };
        Reply::Response(result.unwrap_or_else(QueryResponse::from_error))
    }

    /// Fetch a part via `lookup`, serving the raw source instead when the
    /// message structure cannot be parsed.
    fn with_part<F>(&self, id: MessageId, lookup: F) -> Result<PartBody>
    where
        F: FnOnce(&Message) -> Result<Part>,
    {
        let message = self.store.get(id)?;
        match lookup(&message) {
            Ok(part) => Ok(PartBody::from_part(part)),
            Err(StoreError::ParseFailed(reason)) => {
                warn!(%id, %reason, "Serving raw source in place of unparseable part");
                Ok(PartBody::raw_fallback(&message))
            }
            Err(e) => Err(e),
        }
    }
}

/// Point `src`/`href` attribute values that start with `cid:` at `prefix`.
fn rewrite_cid_links(html: &str, prefix: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut copied = 0;
    let mut pos = 0;
    while let Some(found) = lower[pos..].find("cid:") {
        let at = pos + found;
        if is_link_attribute(&lower[..at]) {
            out.push_str(&html[copied..at]);
            out.push_str(prefix);
            copied = at + "cid:".len();
        }
        pos = at + "cid:".len();
    }
    out.push_str(&html[copied..]);
    out
}

/// `true` if `before` ends with ` src=` or ` href=`, optionally quoted.
fn is_link_attribute(before: &str) -> bool {
    let before = before.strip_suffix(['"', '\'']).unwrap_or(before);
    let Some(before) = before.trim_end().strip_suffix('=') else {
        return false;
    };
    let before = before.trim_end();
    ["src", "href"].iter().any(|name| {
        before
            .strip_suffix(name)
            .is_some_and(|rest| rest.ends_with(char::is_whitespace))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::Envelope;

    fn adapter_with(raw: &str) -> (QueryAdapter, MessageId) {
        let store = Arc::new(MessageStore::default());
        let envelope = Envelope::new("from@example.com", vec!["to@example.com".into()]).unwrap();
        let id = store.insert(envelope, raw.as_bytes().to_vec()).unwrap();
        (QueryAdapter::new(store), id)
    }

    const ALTERNATIVE: &str = "Subject: Alt\r\n\
Content-Type: multipart/alternative; boundary=\"sep\"\r\n\
\r\n\
--sep\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain text\r\n\
--sep\r\n\
Content-Type: text/html\r\n\
\r\n\
<img src=\"cid:logo\">\r\n\
--sep--\r\n";

    #[test]
    fn test_routes() {
        let id = MessageId(7);
        let cases = [
            ("GET", "/messages", Some(QueryRequest::List)),
            ("DELETE", "/messages", Some(QueryRequest::DeleteAll)),
            ("GET", "/messages/updates", Some(QueryRequest::Updates)),
            ("GET", "/messages/7.json", Some(QueryRequest::Message(id))),
            ("GET", "/messages/7.html", Some(QueryRequest::Html(id))),
            ("GET", "/messages/7.source?x=1", Some(QueryRequest::Source(id))),
            ("GET", "/messages/7.eml", Some(QueryRequest::Eml(id))),
            ("delete", "/messages/7", Some(QueryRequest::Delete(id))),
            (
                "GET",
                "/messages/7/parts/2",
                Some(QueryRequest::Part { id, index: 2 }),
            ),
            (
                "GET",
                "/messages/7/parts/cid/logo@x",
                Some(QueryRequest::PartByCid {
                    id,
                    cid: "logo@x".into(),
                }),
            ),
            ("GET", "/messages/7.exe", None),
            ("GET", "/messages/abc.json", None),
            ("POST", "/messages", None),
        ];
        for (method, path, expected) in cases {
            assert_eq!(QueryRequest::from_route(method, path), expected, "{method} {path}");
        }
    }

    #[test]
    fn test_formats_and_parts() {
        let (adapter, id) = adapter_with(ALTERNATIVE);
        let detail = adapter.message(id).unwrap();
        assert_eq!(detail.formats, vec!["source", "html", "plain"]);
        assert_eq!(detail.parts.len(), 2);
        assert!(detail.attachments.is_empty());
        assert_eq!(detail.summary.subject, "Alt");

        let plain = adapter.plain(id).unwrap();
        assert_eq!(plain.content_type, "text/plain; charset=utf-8");
        assert_eq!(plain.body, b"plain text");
    }

    #[test]
    fn test_html_rewrites_cid_links() {
        let (adapter, id) = adapter_with(ALTERNATIVE);
        let html = adapter.html(id).unwrap();
        let text = String::from_utf8(html.body).unwrap();
        assert_eq!(text, format!("<img src=\"/messages/{id}/parts/cid/logo\">"));
    }

    #[test]
    fn test_html_keeps_cid_in_text() {
        let raw = "Content-Type: text/html\r\n\r\n\
<p>Reference cid:logo in text</p><img SRC='cid:logo'><a href = \"cid:doc\">doc</a>";
        let (adapter, id) = adapter_with(raw);
        let html = adapter.html(id).unwrap();
        let text = String::from_utf8(html.body).unwrap();
        assert_eq!(
            text,
            format!(
                "<p>Reference cid:logo in text</p><img SRC='/messages/{id}/parts/cid/logo'>\
<a href = \"/messages/{id}/parts/cid/doc\">doc</a>"
            )
        );
    }

    #[test]
    fn test_source_and_eml() {
        let (adapter, id) = adapter_with("Subject: s\r\n\r\nbody");
        let source = adapter.source(id).unwrap();
        assert_eq!(source.content_type, SOURCE_CONTENT_TYPE);
        assert_eq!(source.body, b"Subject: s\r\n\r\nbody");
        let eml = adapter.eml(id).unwrap();
        assert_eq!(eml.content_type, EML_CONTENT_TYPE);
        assert_eq!(eml.filename, Some(format!("{id}.eml")));
    }

    #[test]
    fn test_missing_html_is_not_found() {
        let (adapter, id) = adapter_with("Subject: s\r\n\r\nbody");
        assert!(adapter.html(id).unwrap_err().is_not_found());
        match adapter.handle(QueryRequest::Html(id)) {
            Reply::Response(r) => assert_eq!(r.status, 404),
            Reply::Updates(_) => panic!("expected a response"),
        }
    }

    #[test]
    fn test_unparseable_message_degrades() {
        let mut raw = String::from("Subject: deep\nContent-Type: multipart/mixed; boundary=b0\n\n");
        for level in 1..=crate::parser::mime::MAX_DEPTH + 2 {
            raw.push_str(&format!(
                "--b{}\nContent-Type: multipart/mixed; boundary=b{level}\n\n",
                level - 1
            ));
        }
        let (adapter, id) = adapter_with(&raw);

        let detail = adapter.message(id).unwrap();
        assert!(detail.degraded);
        assert_eq!(detail.formats, vec!["source"]);
        assert_eq!(detail.summary.subject, "deep");

        let part = adapter.part(id, 0).unwrap();
        assert!(part.degraded);
        assert_eq!(part.body, raw.as_bytes());
    }

    #[test]
    fn test_handle_delete_and_list() {
        let (adapter, id) = adapter_with("Subject: s\r\n\r\nbody");
        match adapter.handle(QueryRequest::Delete(id)) {
            Reply::Response(r) => assert_eq!(r.status, 204),
            Reply::Updates(_) => panic!("expected a response"),
        }
        match adapter.handle(QueryRequest::Delete(id)) {
            Reply::Response(r) => assert_eq!(r.status, 404),
            Reply::Updates(_) => panic!("expected a response"),
        }
        match adapter.handle(QueryRequest::List) {
            Reply::Response(r) => {
                assert_eq!(r.content_type, "application/json");
                assert_eq!(r.body, b"[]");
            }
            Reply::Updates(_) => panic!("expected a response"),
        }
    }

    #[test]
    fn test_live_update_json() {
        let update = LiveUpdate::Remove { id: MessageId(4) };
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r#"{"type":"remove","id":4}"#
        );
    }
}
