//! Decoding of message/delivery-status parts (RFC 3464).
//!
//! A delivery-status body is a sequence of header groups separated by blank
//! lines: one per-message group, then one group per recipient. Only the
//! fields the webhook flow consumes are extracted.

use thiserror::Error;

/// Action field of a per-recipient group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Failed,
    Delayed,
    Delivered,
    Relayed,
    Expanded,
    /// An action value outside RFC 3464's enumeration.
    Other(String),
}

impl Action {
    fn parse(s: &str) -> Action {
        match s.to_ascii_lowercase().as_str() {
            "failed" => Action::Failed,
            "delayed" => Action::Delayed,
            "delivered" => Action::Delivered,
            "relayed" => Action::Relayed,
            "expanded" => Action::Expanded,
            other => Action::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Action::Failed => "failed",
            Action::Delayed => "delayed",
            Action::Delivered => "delivered",
            Action::Relayed => "relayed",
            Action::Expanded => "expanded",
            Action::Other(s) => s,
        }
    }
}

/// One per-recipient group of a delivery status notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipient {
    pub final_recipient: String,
    pub action: String,
    /// Status code like "5.1.1", or empty.
    pub status: String,
    /// Diagnostic-Code value when its type is smtp, or empty.
    pub diagnostic_code_smtp: String,
}

impl Recipient {
    pub fn action(&self) -> Action {
        Action::parse(&self.action)
    }
}

/// A decoded delivery status notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dsn {
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Error)]
pub enum DsnError {
    #[error("delivery-status without header groups")]
    Empty,
    #[error("per-recipient group without action field")]
    MissingAction,
}

/// Decode a message/delivery-status body.
pub fn decode(body: &str) -> Result<Dsn, DsnError> {
    let groups = header_groups(body);
    if groups.is_empty() {
        return Err(DsnError::Empty);
    }

    // The first group holds per-message fields, the rest are per-recipient.
    let mut recipients = Vec::new();
    for group in &groups[1..] {
        let mut r = Recipient::default();
        for (name, value) in group {
            match name.to_ascii_lowercase().as_str() {
                "final-recipient" => r.final_recipient = strip_address_type(value),
                "action" => {
                    // The action may carry a comment, keep the first token.
                    r.action = value
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_ascii_lowercase();
                }
                "status" => {
                    r.status = value.split_whitespace().next().unwrap_or_default().to_string();
                }
                "diagnostic-code" => {
                    if let Some((scheme, rest)) = value.split_once(';') {
                        if scheme.trim().eq_ignore_ascii_case("smtp") {
                            r.diagnostic_code_smtp = rest.trim().to_string();
                        }
                    }
                }
                _ => {}
            }
        }
        if r == Recipient::default() {
            // Trailing blank lines produce empty groups, skip them.
            continue;
        }
        if r.action.is_empty() {
            return Err(DsnError::MissingAction);
        }
        recipients.push(r);
    }

    Ok(Dsn { recipients })
}

/// Split a header-group body into groups of unfolded (name, value) fields.
fn header_groups(body: &str) -> Vec<Vec<(String, String)>> {
    let mut groups = Vec::new();
    let mut group: Vec<(String, String)> = Vec::new();
    for line in body.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if !group.is_empty() {
                groups.push(std::mem::take(&mut group));
            }
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous field.
            if let Some((_, value)) = group.last_mut() {
                value.push(' ');
                value.push_str(line.trim_start());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            group.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    if !group.is_empty() {
        groups.push(group);
    }
    groups
}

/// Drop the "rfc822;" style address-type prefix of an address field.
fn strip_address_type(value: &str) -> String {
    match value.split_once(';') {
        Some((_, addr)) => addr.trim().to_string(),
        None => value.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Reporting-MTA: dns; mail.remote.example\n\
        Arrival-Date: Mon, 1 Apr 2024 10:00:00 +0000\n\
        \n\
        Final-Recipient: rfc822; bob@remote.example\n\
        Action: failed\n\
        Status: 5.1.1\n\
        Diagnostic-Code: smtp; 550 5.1.1 no such user\n";

    #[test]
    fn decode_single_recipient() {
        let dsn = decode(SAMPLE).unwrap();
        assert_eq!(dsn.recipients.len(), 1);
        let r = &dsn.recipients[0];
        assert_eq!(r.final_recipient, "bob@remote.example");
        assert_eq!(r.action(), Action::Failed);
        assert_eq!(r.status, "5.1.1");
        assert_eq!(r.diagnostic_code_smtp, "550 5.1.1 no such user");
    }

    #[test]
    fn decode_crlf_and_continuation() {
        let body = "Reporting-MTA: dns; m\r\n\r\nAction: delayed\r\nDiagnostic-Code: smtp;\r\n 451 4.4.1 timeout\r\nStatus: 4.4.1\r\n";
        let dsn = decode(body).unwrap();
        assert_eq!(dsn.recipients.len(), 1);
        assert_eq!(dsn.recipients[0].action(), Action::Delayed);
        assert_eq!(dsn.recipients[0].diagnostic_code_smtp, "451 4.4.1 timeout");
    }

    #[test]
    fn decode_multiple_recipients() {
        let body = "Reporting-MTA: dns; m\n\nAction: failed\nStatus: 5.0.0\n\nAction: delivered\nStatus: 2.0.0\n";
        let dsn = decode(body).unwrap();
        assert_eq!(dsn.recipients.len(), 2);
        assert_eq!(dsn.recipients[1].action(), Action::Delivered);
    }

    #[test]
    fn non_smtp_diagnostic_ignored() {
        let body = "Reporting-MTA: dns; m\n\nAction: failed\nDiagnostic-Code: x-unix; 1\n";
        let dsn = decode(body).unwrap();
        assert!(dsn.recipients[0].diagnostic_code_smtp.is_empty());
    }

    #[test]
    fn unknown_action() {
        let body = "Reporting-MTA: dns; m\n\nAction: bounced (never heard of it)\n";
        let dsn = decode(body).unwrap();
        assert_eq!(dsn.recipients[0].action(), Action::Other("bounced".into()));
    }

    #[test]
    fn missing_action_is_error() {
        let body = "Reporting-MTA: dns; m\n\nFinal-Recipient: rfc822; x@y\n";
        assert!(matches!(decode(body), Err(DsnError::MissingAction)));
    }

    #[test]
    fn empty_body_is_error() {
        assert!(matches!(decode(""), Err(DsnError::Empty)));
    }
}
