//! Parsed-message contract consumed during intake.
//!
//! The mail server's MIME parser produces a [`Part`] tree; this module walks
//! it to build the webhook [`Structure`](crate::payload::Structure), extract
//! readable text, and answer header questions. Media types and subtypes are
//! lowercase throughout.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::payload::{NameAddress, Structure};

/// An address from a parsed message header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    /// Display name, may be empty.
    pub name: String,
    pub user: String,
    pub host: String,
}

/// Parsed message envelope: the common headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub subject: String,
    pub message_id: String,
    pub in_reply_to: String,
    pub date: Option<DateTime<Utc>>,
}

/// One node of a parsed MIME message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Part {
    /// Lowercase, e.g. "multipart".
    pub media_type: String,
    /// Lowercase, e.g. "report".
    pub media_subtype: String,
    pub content_type_params: BTreeMap<String, String>,
    pub content_id: String,
    /// Lowercase disposition, e.g. "attachment", or empty.
    pub content_disposition: String,
    /// Filename from the disposition parameters, or empty.
    pub filename: String,
    /// Size of the decoded body.
    pub decoded_size: u64,
    /// Only set on the top-level part.
    pub envelope: Option<Envelope>,
    /// Raw header name/value pairs, values unfolded.
    pub headers: Vec<(String, String)>,
    /// Decoded body for leaf parts.
    pub body: String,
    pub parts: Vec<Part>,
}

impl Part {
    pub fn new(media_type: &str, media_subtype: &str) -> Part {
        Part {
            media_type: media_type.to_ascii_lowercase(),
            media_subtype: media_subtype.to_ascii_lowercase(),
            ..Part::default()
        }
    }

    /// First value of a header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, by case-insensitive name.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Whether this part is a multipart/report whose second subpart is a
    /// (possibly internationalized) delivery status.
    pub(crate) fn is_dsn_report(&self) -> bool {
        self.media_type == "multipart"
            && self.media_subtype == "report"
            && self.parts.len() >= 2
            && self.parts[1].media_type == "message"
            && (self.parts[1].media_subtype == "delivery-status"
                || self.parts[1].media_subtype == "global-delivery-status")
    }

    /// The webhook structure for this part and its children.
    pub(crate) fn structure(&self) -> Structure {
        Structure {
            content_type: format!("{}/{}", self.media_type, self.media_subtype),
            content_type_params: self.content_type_params.clone(),
            content_id: self.content_id.clone(),
            content_disposition: self.content_disposition.to_ascii_lowercase(),
            filename: self.filename.clone(),
            decoded_size: self.decoded_size,
            parts: self.parts.iter().map(|p| p.structure()).collect(),
        }
    }
}

/// First text/plain and text/html bodies in the part tree, each capped at
/// `limit` bytes.
pub(crate) fn readable_parts(p: &Part, limit: usize) -> (String, String) {
    let mut text = String::new();
    let mut html = String::new();
    collect_readable(p, limit, &mut text, &mut html);
    (text, html)
}

fn collect_readable(p: &Part, limit: usize, text: &mut String, html: &mut String) {
    if p.media_type == "text" {
        if p.media_subtype == "plain" && text.is_empty() {
            *text = truncate_at_char(&p.body, limit).to_string();
        } else if p.media_subtype == "html" && html.is_empty() {
            *html = truncate_at_char(&p.body, limit).to_string();
        }
        return;
    }
    for sub in &p.parts {
        collect_readable(sub, limit, text, html);
        if !text.is_empty() && !html.is_empty() {
            return;
        }
    }
}

/// Longest prefix of at most `limit` bytes ending on a char boundary.
fn truncate_at_char(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Message-IDs referenced by one or more References header values, each
/// returned including `<>`.
pub(crate) fn referenced_ids(values: &[&str]) -> Vec<String> {
    let mut ids = Vec::new();
    for v in values {
        let mut rest = *v;
        while let Some(open) = rest.find('<') {
            let Some(close) = rest[open..].find('>') else {
                break;
            };
            let id = &rest[open..open + close + 1];
            if id.len() > 2 {
                ids.push(id.to_string());
            }
            rest = &rest[open + close + 1..];
        }
    }
    ids
}

/// Whether headers indicate an automated message: mailing-list or precedence
/// headers, or Auto-Submitted other than "no".
pub(crate) fn is_automated(p: &Part) -> bool {
    for name in ["List-Id", "List-Unsubscribe", "List-Unsubscribe-Post", "Precedence"] {
        if p.header(name).is_some_and(|v| !v.is_empty()) {
            return true;
        }
    }
    if let Some(v) = p.header("Auto-Submitted") {
        let v = v.trim();
        if !v.is_empty() && !v.eq_ignore_ascii_case("no") {
            return true;
        }
    }
    false
}

/// `user@host` with the host normalized to lowercase, the form used in
/// webhook payloads.
pub(crate) fn format_address(a: &Address) -> String {
    format!("{}@{}", a.user, a.host.to_ascii_lowercase())
}

pub(crate) fn addresses(l: &[Address]) -> Vec<NameAddress> {
    l.iter()
        .map(|a| NameAddress {
            name: a.name.clone(),
            address: format_address(a),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_part(subtype: &str, body: &str) -> Part {
        Part {
            body: body.to_string(),
            decoded_size: body.len() as u64,
            ..Part::new("text", subtype)
        }
    }

    #[test]
    fn structure_walk() {
        let mut root = Part::new("multipart", "alternative");
        root.content_type_params.insert("boundary".into(), "x".into());
        root.parts.push(text_part("plain", "hi"));
        root.parts.push(text_part("html", "<p>hi</p>"));

        let s = root.structure();
        assert_eq!(s.content_type, "multipart/alternative");
        assert_eq!(s.content_type_params.get("boundary").map(String::as_str), Some("x"));
        assert_eq!(s.parts.len(), 2);
        assert_eq!(s.parts[0].content_type, "text/plain");
        assert_eq!(s.parts[0].decoded_size, 2);
        assert!(s.parts[0].parts.is_empty());
    }

    #[test]
    fn readable_picks_first_text_and_html() {
        let mut root = Part::new("multipart", "alternative");
        root.parts.push(text_part("plain", "first"));
        root.parts.push(text_part("plain", "second"));
        root.parts.push(text_part("html", "<b>first</b>"));

        let (text, html) = readable_parts(&root, 1024);
        assert_eq!(text, "first");
        assert_eq!(html, "<b>first</b>");
    }

    #[test]
    fn readable_respects_limit_and_char_boundary() {
        let p = text_part("plain", "aé"); // 'é' is 2 bytes starting at offset 1
        let (text, _) = readable_parts(&p, 2);
        assert_eq!(text, "a");

        let (text, _) = readable_parts(&text_part("plain", "abc"), 2);
        assert_eq!(text, "ab");
    }

    #[test]
    fn references_extraction() {
        let ids = referenced_ids(&["<a@x> <b@y>", "junk <c@z>trailing"]);
        assert_eq!(ids, vec!["<a@x>", "<b@y>", "<c@z>"]);
        assert!(referenced_ids(&["no ids here"]).is_empty());
        assert!(referenced_ids(&["<>"]).is_empty());
    }

    #[test]
    fn automated_detection() {
        let mut p = text_part("plain", "x");
        assert!(!is_automated(&p));

        p.headers.push(("List-Id".into(), "<l.example>".into()));
        assert!(is_automated(&p));

        let mut p = text_part("plain", "x");
        p.headers.push(("Auto-Submitted".into(), "no".into()));
        assert!(!is_automated(&p));
        p.headers.clear();
        p.headers.push(("Auto-Submitted".into(), "auto-replied".into()));
        assert!(is_automated(&p));
    }

    #[test]
    fn dsn_report_detection() {
        let mut p = Part::new("multipart", "report");
        assert!(!p.is_dsn_report());
        p.parts.push(text_part("plain", "human readable"));
        p.parts.push(Part::new("message", "delivery-status"));
        assert!(p.is_dsn_report());

        p.parts[1] = Part::new("message", "global-delivery-status");
        assert!(p.is_dsn_report());

        p.parts[1] = Part::new("message", "rfc822");
        assert!(!p.is_dsn_report());
    }

    #[test]
    fn address_formatting() {
        let a = Address {
            name: "Ms Example".into(),
            user: "me".into(),
            host: "EXAMPLE.Org".into(),
        };
        assert_eq!(format_address(&a), "me@example.org");
        let l = addresses(&[a]);
        assert_eq!(l[0].name, "Ms Example");
        assert_eq!(l[0].address, "me@example.org");
    }
}
