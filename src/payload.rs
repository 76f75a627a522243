//! JSON bodies delivered to webhook endpoints.
//!
//! Two payload kinds exist: [`Outgoing`] for delivery-status events about
//! messages we sent, and [`Incoming`] for messages we received. There is no
//! type tag in the JSON; receivers know which kind to expect from the URL the
//! webhook was configured under. Maps and lists are always present in the
//! serialized form, never null.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::OutgoingEvent;

/// Webhook payload about the delivery of an outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outgoing {
    /// Payload schema version.
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "Event")]
    pub event: OutgoingEvent,
    /// Whether this event was derived from an incoming delivery status
    /// notification.
    #[serde(rename = "DSN")]
    pub dsn: bool,
    /// Whether processing this event added addresses to the suppression list.
    #[serde(rename = "Suppressing")]
    pub suppressing: bool,
    #[serde(rename = "QueueMsgID")]
    pub queue_msg_id: u64,
    #[serde(rename = "FromID")]
    pub from_id: String,
    #[serde(rename = "MessageID")]
    pub message_id: String,
    #[serde(rename = "Subject")]
    pub subject: String,
    #[serde(rename = "WebhookQueued")]
    pub webhook_queued: DateTime<Utc>,
    /// SMTP status code, or 0 when unknown.
    #[serde(rename = "SMTPCode")]
    pub smtp_code: u16,
    /// Enhanced status code like "5.1.1", or empty.
    #[serde(rename = "SMTPEnhancedCode")]
    pub smtp_enhanced_code: String,
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Extra")]
    pub extra: BTreeMap<String, String>,
}

/// Webhook payload about an incoming message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Incoming {
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "From")]
    pub from: Vec<NameAddress>,
    #[serde(rename = "To")]
    pub to: Vec<NameAddress>,
    #[serde(rename = "CC")]
    pub cc: Vec<NameAddress>,
    /// From the message header, typically absent for incoming messages.
    #[serde(rename = "BCC")]
    pub bcc: Vec<NameAddress>,
    #[serde(rename = "ReplyTo")]
    pub reply_to: Vec<NameAddress>,
    #[serde(rename = "Subject")]
    pub subject: String,
    /// Including `<>`.
    #[serde(rename = "MessageID")]
    pub message_id: String,
    #[serde(rename = "InReplyTo")]
    pub in_reply_to: String,
    /// Message-IDs of referenced messages, including `<>`.
    #[serde(rename = "References")]
    pub references: Vec<String>,
    /// From the Date header.
    #[serde(rename = "Date")]
    pub date: Option<DateTime<Utc>>,

    /// Contents of the first text part, newlines normalized to LF.
    #[serde(rename = "Text")]
    pub text: String,
    /// Contents of the first HTML part, newlines normalized to LF.
    #[serde(rename = "HTML")]
    pub html: String,
    #[serde(rename = "Structure")]
    pub structure: Structure,
    #[serde(rename = "Meta")]
    pub meta: IncomingMeta,
}

/// Name and email address from a message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameAddress {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
}

/// MIME part tree of an incoming message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    /// Lowercase, e.g. "text/plain".
    #[serde(rename = "ContentType")]
    pub content_type: String,
    #[serde(rename = "ContentTypeParams")]
    pub content_type_params: BTreeMap<String, String>,
    #[serde(rename = "ContentID")]
    pub content_id: String,
    /// Lowercase, e.g. "attachment".
    #[serde(rename = "ContentDisposition")]
    pub content_disposition: String,
    #[serde(rename = "Filename")]
    pub filename: String,
    #[serde(rename = "DecodedSize")]
    pub decoded_size: u64,
    #[serde(rename = "Parts")]
    pub parts: Vec<Structure>,
}

/// Details about the incoming delivery itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomingMeta {
    /// Message id in the account store, usable with further message APIs.
    #[serde(rename = "MsgID")]
    pub msg_id: u64,
    /// Envelope sender, empty for DSN-like service messages.
    #[serde(rename = "MailFrom")]
    pub mail_from: String,
    #[serde(rename = "MailFromValidated")]
    pub mail_from_validated: bool,
    #[serde(rename = "MsgFromValidated")]
    pub msg_from_validated: bool,
    #[serde(rename = "RcptTo")]
    pub rcpt_to: String,
    #[serde(rename = "DKIMVerifiedDomains")]
    pub dkim_verified_domains: Vec<String>,
    #[serde(rename = "RemoteIP")]
    pub remote_ip: String,
    #[serde(rename = "Received")]
    pub received: DateTime<Utc>,
    #[serde(rename = "MailboxName")]
    pub mailbox_name: String,
    /// Whether this message looks machine-generated: empty envelope sender,
    /// list or precedence headers, Auto-Submitted, or a multipart/report.
    #[serde(rename = "Automated")]
    pub automated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn outgoing_field_names() {
        let out = Outgoing {
            version: 0,
            event: OutgoingEvent::Failed,
            dsn: true,
            suppressing: true,
            queue_msg_id: 102,
            from_id: "MDEy".into(),
            message_id: "<x@mox.example>".into(),
            subject: "subject of original message".into(),
            webhook_queued: Utc.with_ymd_and_hms(2024, 3, 27, 0, 0, 0).unwrap(),
            smtp_code: 554,
            smtp_enhanced_code: "5.4.0".into(),
            error: "timeout connecting to host".into(),
            extra: BTreeMap::from([("userid".to_string(), "456".to_string())]),
        };
        let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&out).unwrap()).unwrap();
        let obj = v.as_object().unwrap();
        for key in [
            "Version",
            "Event",
            "DSN",
            "Suppressing",
            "QueueMsgID",
            "FromID",
            "MessageID",
            "Subject",
            "WebhookQueued",
            "SMTPCode",
            "SMTPEnhancedCode",
            "Error",
            "Extra",
        ] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(obj.len(), 13);
        assert_eq!(v["Event"], "failed");
        assert_eq!(v["DSN"], true);
        assert_eq!(v["SMTPCode"], 554);
        assert_eq!(v["Extra"]["userid"], "456");

        let back: Outgoing = serde_json::from_value(v).unwrap();
        assert_eq!(back, out);
    }

    #[test]
    fn incoming_empty_collections_serialize_as_empty() {
        let incoming = Incoming::default();
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&incoming).unwrap()).unwrap();
        assert!(v["From"].as_array().unwrap().is_empty());
        assert!(v["CC"].as_array().unwrap().is_empty());
        assert!(v["References"].as_array().unwrap().is_empty());
        assert!(v["Structure"]["ContentTypeParams"].as_object().unwrap().is_empty());
        assert!(v["Structure"]["Parts"].as_array().unwrap().is_empty());
        assert!(v["Meta"]["DKIMVerifiedDomains"].as_array().unwrap().is_empty());
        assert!(v["Date"].is_null());
        assert_eq!(v["HTML"], "");
        assert_eq!(v["Meta"]["Automated"], false);
    }

    #[test]
    fn incoming_field_names() {
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&Incoming::default()).unwrap()).unwrap();
        let obj = v.as_object().unwrap();
        for key in [
            "Version",
            "From",
            "To",
            "CC",
            "BCC",
            "ReplyTo",
            "Subject",
            "MessageID",
            "InReplyTo",
            "References",
            "Date",
            "Text",
            "HTML",
            "Structure",
            "Meta",
        ] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        let meta = v["Meta"].as_object().unwrap();
        for key in [
            "MsgID",
            "MailFrom",
            "MailFromValidated",
            "MsgFromValidated",
            "RcptTo",
            "DKIMVerifiedDomains",
            "RemoteIP",
            "Received",
            "MailboxName",
            "Automated",
        ] {
            assert!(meta.contains_key(key), "missing Meta.{key}");
        }
        let s = v["Structure"].as_object().unwrap();
        for key in [
            "ContentType",
            "ContentTypeParams",
            "ContentID",
            "ContentDisposition",
            "Filename",
            "DecodedSize",
            "Parts",
        ] {
            assert!(s.contains_key(key), "missing Structure.{key}");
        }
    }
}
