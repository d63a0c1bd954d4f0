//! MIME decomposition: flattens a message into an indexed list of leaf parts.
//!
//! Structure and transfer decoding come from `mail-parser`. Multipart
//! containers are walked recursively and their leaves appended in document
//! order, so a part's index is its position in that flattened list.
//! Malformed structure degrades to a single opaque part instead of failing.

use mail_parser::{MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::model::message::{ParsedView, Part};
use crate::parser::header::Headers;

/// Maximum multipart nesting depth (to prevent runaway recursion on adversarial input).
pub const MAX_DEPTH: usize = 10;

/// Parse a raw message into headers, top-level content type and parts.
///
/// Only a multipart container beyond [`MAX_DEPTH`] whose closing delimiter is
/// missing is a hard failure; every other defect degrades.
pub fn parse(raw: &[u8]) -> Result<ParsedView> {
    let (head, body) = split_head_body(raw);
    let headers = Headers::parse(head);
    let content_type = headers.content_type();

    let is_multipart = content_type.starts_with("multipart/");

    let message = MessageParser::default().parse(raw);
    let parts = match message.as_ref().filter(|m| !m.parts.is_empty()) {
        Some(message) if is_multipart && !boundary_found(&message.parts[0], body) => {
            warn!(
                content_type = %content_type,
                "Multipart boundary missing or never found, treating body as one part"
            );
            vec![plain_part(body)]
        }
        Some(message) => {
            let mut parts = Vec::new();
            collect_parts(&message.parts, raw, 0, 0, &mut parts)?;
            parts
        }
        None => {
            debug!("No MIME structure found, keeping the body as one part");
            vec![plain_part(body)]
        }
    };

    debug!(parts = parts.len(), content_type = %content_type, "Parsed message");
    Ok(ParsedView {
        headers,
        content_type,
        parts,
    })
}

/// Split a message (or body part) into its header block and body.
///
/// Without a blank line the whole input is headers and the body is empty.
pub fn split_head_body(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(rest) = data.strip_prefix(b"\r\n") {
        return (&data[..0], rest);
    }
    if let Some(rest) = data.strip_prefix(b"\n") {
        return (&data[..0], rest);
    }

    for i in 0..data.len() {
        if data[i] != b'\n' {
            continue;
        }
        let head = &data[..i];
        let head = head.strip_suffix(b"\r").unwrap_or(head);
        match &data[i + 1..] {
            [b'\n', ..] => return (head, &data[i + 2..]),
            [b'\r', b'\n', ..] => return (head, &data[i + 3..]),
            _ => {}
        }
    }
    (data, &data[data.len()..])
}

/// Walk part `id` of a parsed message, appending its leaves to `out`.
fn collect_parts(
    all: &[MessagePart<'_>],
    raw: &[u8],
    id: usize,
    depth: usize,
    out: &mut Vec<Part>,
) -> Result<()> {
    let Some(part) = all.get(id) else {
        return Ok(());
    };

    match &part.body {
        PartType::Multipart(_) if depth >= MAX_DEPTH => {
            let start = part.offset_body as usize;
            let closing = boundary(part).map(|b| format!("--{b}--"));
            let tail = raw.get(start..).unwrap_or_default();
            if !closing.is_some_and(|c| contains(tail, c.as_bytes())) {
                return Err(StoreError::ParseFailed(format!(
                    "unterminated multipart boundary nested deeper than {MAX_DEPTH} levels"
                )));
            }
            warn!(depth, "Multipart nesting too deep, keeping container opaque");
            let body = raw
                .get(start..part.offset_end as usize)
                .unwrap_or_default()
                .to_vec();
            let index = out.len();
            out.push(leaf(part, mime_type(part), body, index));
        }
        PartType::Multipart(children) => {
            for &child in children {
                collect_parts(all, raw, child, depth + 1, out)?;
            }
        }
        _ => {
            let content_type = mime_type(part);
            let index = out.len();
            if content_type.starts_with("multipart/") {
                debug!(index, "Nested multipart without usable boundary, keeping as text");
                let body = raw
                    .get(part.offset_body as usize..part.offset_end as usize)
                    .unwrap_or_default()
                    .to_vec();
                out.push(plain_leaf(part, body, index));
            } else {
                out.push(leaf(part, content_type, part.contents().to_vec(), index));
            }
        }
    }
    Ok(())
}

fn boundary<'a>(part: &'a MessagePart<'_>) -> Option<&'a str> {
    part.content_type()
        .and_then(|ct| ct.attribute("boundary"))
        .filter(|b| !b.is_empty())
}

/// `true` if `part` declares a boundary and a delimiter line for it occurs in `body`.
fn boundary_found(part: &MessagePart<'_>, body: &[u8]) -> bool {
    boundary(part).is_some_and(|b| contains(body, format!("--{b}").as_bytes()))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Lowercased `type/subtype`, defaulting to `text/plain`.
fn mime_type(part: &MessagePart<'_>) -> String {
    part.content_type()
        .and_then(|ct| ct.subtype().map(|sub| format!("{}/{sub}", ct.ctype())))
        .map(|ct| ct.to_ascii_lowercase())
        .unwrap_or_else(|| "text/plain".to_string())
}

/// Build a leaf from a decoded `mail-parser` part.
fn leaf(part: &MessagePart<'_>, content_type: String, body: Vec<u8>, index: usize) -> Part {
    // Text bodies come back from mail-parser already converted to UTF-8
    let charset = match part.body {
        PartType::Text(_) | PartType::Html(_) => Some("utf-8".to_string()),
        _ => part
            .content_type()
            .and_then(|ct| ct.attribute("charset"))
            .map(str::to_ascii_lowercase),
    };

    Part {
        index,
        content_type,
        charset,
        disposition: part
            .content_disposition()
            .map(|d| d.ctype().to_ascii_lowercase()),
        filename: part.attachment_name().map(str::to_string),
        content_id: part.content_id().map(|cid| {
            cid.trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string()
        }),
        body,
    }
}

fn plain_leaf(part: &MessagePart<'_>, body: Vec<u8>, index: usize) -> Part {
    Part {
        charset: None,
        ..leaf(part, "text/plain".to_string(), body, index)
    }
}

/// The whole body as one `text/plain` part.
fn plain_part(body: &[u8]) -> Part {
    Part {
        index: 0,
        content_type: "text/plain".to_string(),
        charset: None,
        disposition: None,
        filename: None,
        content_id: None,
        body: body.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_part_plain() {
        let view = parse(b"Subject: Hi\r\n\r\nHello").unwrap();
        assert_eq!(view.content_type, "text/plain");
        assert_eq!(view.parts.len(), 1);
        assert_eq!(view.parts[0].content_type, "text/plain");
        assert_eq!(view.parts[0].body, b"Hello");
    }

    #[test]
    fn test_split_head_body_lf_and_crlf() {
        assert_eq!(
            split_head_body(b"A: b\n\nbody"),
            (&b"A: b"[..], &b"body"[..])
        );
        assert_eq!(
            split_head_body(b"A: b\r\n\r\nbody"),
            (&b"A: b"[..], &b"body"[..])
        );
        assert_eq!(split_head_body(b"\r\nbody"), (&b""[..], &b"body"[..]));
        assert_eq!(split_head_body(b"A: b"), (&b"A: b"[..], &b""[..]));
    }

    #[test]
    fn test_multipart_text_and_attachment() {
        let raw = b"Content-Type: multipart/mixed; boundary=XYZ\r\n\
\r\n\
preamble\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
Body text\r\n\
--XYZ\r\n\
Content-Type: application/pdf; name=doc.pdf\r\n\
Content-Disposition: attachment; filename=\"doc.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--XYZ--\r\n\
epilogue\r\n";
        let view = parse(raw).unwrap();
        assert_eq!(view.content_type, "multipart/mixed");
        assert_eq!(view.parts.len(), 2);
        assert_eq!(view.parts[0].body, b"Body text");
        assert!(!view.parts[0].is_attachment());
        assert_eq!(view.parts[1].index, 1);
        assert_eq!(view.parts[1].content_type, "application/pdf");
        assert_eq!(view.parts[1].filename.as_deref(), Some("doc.pdf"));
        assert_eq!(view.parts[1].body, b"%PDF-");
        assert!(view.parts[1].is_attachment());
    }

    #[test]
    fn test_nested_multipart_flattened_in_order() {
        let raw = b"Content-Type: multipart/mixed; boundary=outer\n\
\n\
--outer\n\
Content-Type: multipart/alternative; boundary=inner\n\
\n\
--inner\n\
Content-Type: text/plain\n\
\n\
plain\n\
--inner\n\
Content-Type: text/html\n\
\n\
<p>html</p>\n\
--inner--\n\
--outer\n\
Content-Type: image/png\n\
Content-ID: <logo@x>\n\
\n\
PNG\n\
--outer--\n";
        let view = parse(raw).unwrap();
        let types: Vec<_> = view.parts.iter().map(|p| p.content_type.as_str()).collect();
        assert_eq!(types, vec!["text/plain", "text/html", "image/png"]);
        assert_eq!(view.parts[2].content_id.as_deref(), Some("logo@x"));
        assert_eq!(view.parts[2].index, 2);
    }

    #[test]
    fn test_missing_boundary_degrades_to_single_part() {
        let raw = b"Content-Type: multipart/mixed; boundary=nowhere\r\n\r\nJust some text\r\n";
        let view = parse(raw).unwrap();
        assert_eq!(view.parts.len(), 1);
        assert_eq!(view.parts[0].content_type, "text/plain");
        assert_eq!(view.parts[0].body, b"Just some text\r\n");
    }

    #[test]
    fn test_multipart_without_boundary_param() {
        let view = parse(b"Content-Type: multipart/mixed\n\nbody").unwrap();
        assert_eq!(view.parts.len(), 1);
        assert_eq!(view.parts[0].body, b"body");
    }

    #[test]
    fn test_unterminated_multipart_keeps_what_it_has() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\n\n--b\n\nfirst\n--b\n\nsecond";
        let view = parse(raw).unwrap();
        assert_eq!(view.parts.len(), 2);
        assert_eq!(view.parts[1].body, b"second");
    }

    fn nested(depth: usize, terminated: bool) -> Vec<u8> {
        let mut raw = String::from("Content-Type: multipart/mixed; boundary=b0\n\n");
        for level in 1..=depth {
            raw.push_str(&format!(
                "--b{}\nContent-Type: multipart/mixed; boundary=b{level}\n\n",
                level - 1
            ));
        }
        raw.push_str(&format!("--b{depth}\n\ninnermost\n"));
        if terminated {
            for level in (0..=depth).rev() {
                raw.push_str(&format!("--b{level}--\n"));
            }
        }
        raw.into_bytes()
    }

    #[test]
    fn test_deep_terminated_nesting_degrades() {
        let view = parse(&nested(MAX_DEPTH + 3, true)).unwrap();
        assert_eq!(view.parts.len(), 1);
        assert!(view.parts[0].content_type.starts_with("multipart/"));
    }

    #[test]
    fn test_deep_unterminated_nesting_fails() {
        let err = parse(&nested(MAX_DEPTH + 3, false)).unwrap_err();
        assert!(matches!(err, StoreError::ParseFailed(_)));
    }

    #[test]
    fn test_parse_is_deterministic() {
        let raw = nested(3, true);
        assert_eq!(parse(&raw).unwrap(), parse(&raw).unwrap());
    }

    #[test]
    fn test_quoted_printable_part() {
        let raw = b"Content-Type: text/plain; charset=UTF-8\n\
Content-Transfer-Encoding: quoted-printable\n\
\n\
caf=C3=A9";
        let view = parse(raw).unwrap();
        assert_eq!(view.parts[0].charset.as_deref(), Some("utf-8"));
        assert_eq!(view.parts[0].text(), "café");
    }

    #[test]
    fn test_rfc2231_filename() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\n\
\n\
--b\n\
Content-Type: text/plain\n\
Content-Disposition: attachment; filename*=utf-8''na%C3%AFve.txt\n\
\n\
contents\n\
--b--\n";
        let view = parse(raw).unwrap();
        assert_eq!(view.parts.len(), 1);
        assert_eq!(view.parts[0].filename.as_deref(), Some("na\u{ef}ve.txt"));
        assert_eq!(view.parts[0].disposition.as_deref(), Some("attachment"));
        assert!(view.parts[0].is_attachment());
    }

    #[test]
    fn test_latin1_body_converted_to_utf8() {
        let view = parse(b"Content-Type: text/plain; charset=iso-8859-1\n\ncaf\xe9").unwrap();
        assert_eq!(view.parts[0].charset.as_deref(), Some("utf-8"));
        assert_eq!(view.parts[0].text(), "caf\u{e9}");
    }
}
