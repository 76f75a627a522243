//! Turning delivery events and incoming messages into queued webhooks.
//!
//! Two entry points: [`Engine::outgoing_hook`] is called by the outbound
//! queue when a message produces a trackable event, and [`Engine::incoming`]
//! after an inbound message was accepted and stored. An inbound message that
//! is a DSN about an earlier send (correlated through the from-id in the
//! recipient local part) produces an outgoing-event webhook; everything else
//! produces an incoming-message webhook.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::SuppressionCheck;
use crate::dispatcher::Engine;
use crate::dsn;
use crate::error::Error;
use crate::mime::{self, Part};
use crate::payload::{Incoming, IncomingMeta, Outgoing};
use crate::types::{Hook, MsgResult, OutgoingEvent};

/// Descriptor of an outgoing queue message producing a delivery event.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMsg {
    /// Queue message id.
    pub id: u64,
    pub from_id: String,
    pub message_id: String,
    pub subject: String,
    pub extra: BTreeMap<String, String>,
    pub sender_account: String,
    /// Error of the most recent delivery result, carried into the payload.
    pub last_error: String,
}

/// Delivery metadata of an accepted inbound message.
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    /// Message id in the account store.
    pub id: u64,
    /// SMTP MAIL FROM, empty for DSN-like service messages.
    pub mail_from: String,
    pub mail_from_validated: bool,
    pub msg_from_validated: bool,
    pub rcpt_to_localpart: String,
    pub rcpt_to_domain: String,
    pub dkim_verified_domains: Vec<String>,
    pub remote_ip: String,
    pub received: DateTime<Utc>,
}

impl Engine {
    /// Queue a webhook for a delivery event of an outgoing message. The
    /// caller resolves the account's webhook URL, authorization and event
    /// subscription; `code` and `secode` are the final SMTP status, when
    /// known. Any pending webhook for the same queue message is superseded.
    pub fn outgoing_hook(
        &self,
        m: &OutgoingMsg,
        url: &str,
        authorization: &str,
        event: OutgoingEvent,
        suppressing: bool,
        code: u16,
        secode: &str,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let data = Outgoing {
            version: 0,
            event,
            dsn: false,
            suppressing,
            queue_msg_id: m.id,
            from_id: m.from_id.clone(),
            message_id: m.message_id.clone(),
            subject: m.subject.clone(),
            webhook_queued: now,
            smtp_code: code,
            smtp_enhanced_code: smtp_enhanced_code(code, secode),
            error: m.last_error.clone(),
            extra: m.extra.clone(),
        };
        let payload = serde_json::to_string(&data)?;

        let mut h = Hook {
            id: 0,
            queue_msg_id: m.id,
            from_id: m.from_id.clone(),
            message_id: m.message_id.clone(),
            subject: m.subject.clone(),
            extra: m.extra.clone(),
            account: m.sender_account.clone(),
            url: url.to_string(),
            authorization: authorization.to_string(),
            is_incoming: false,
            outgoing_event: Some(event),
            payload,
            submitted: now,
            attempts: 0,
            next_attempt: now,
            results: Vec::new(),
        };
        let keep = crate::config::retired_keep(self.accounts(), &m.sender_account);
        self.inner().store.add_hook(&mut h, now, keep)?;
        debug!(
            webhookid = h.id,
            msgid = m.id,
            account = %m.sender_account,
            url,
            event = %event,
            "queued webhook for outgoing delivery event"
        );
        self.kick();
        Ok(())
    }

    /// Process an inbound message for webhooks. A DSN correlated to a
    /// previously sent message (through the from-id embedded in the recipient
    /// local part) yields an outgoing delivery-status webhook; any other
    /// message yields an incoming-message webhook. Either may be dropped
    /// silently when the account has no matching webhook configured.
    pub fn incoming(
        &self,
        account: &str,
        message_id: &str,
        m: &IncomingMessage,
        part: &Part,
        mailbox_name: &str,
    ) -> Result<(), Error> {
        let now = Utc::now();

        // If the recipient localpart carries a from-id after a catch-all
        // separator, this may be a delivery report about an earlier send.
        // Only non-empty suffixes correlate.
        let mut from_id = String::new();
        if let Some(domconf) = self.accounts().domain(&m.rcpt_to_domain) {
            if let Some(sep) = domconf.localpart_catchall_separators.first() {
                if let Some((_, suffix)) = m.rcpt_to_localpart.split_once(sep.as_str()) {
                    from_id = suffix.to_string();
                }
            }
        }

        let mut data: Option<Outgoing> = None;
        let mut queue_msg_id = 0;
        let mut subject = String::new();
        let mut outgoing_event = OutgoingEvent::Unrecognized;
        if !from_id.is_empty() {
            match self.inner().store.msg_retired_by_from_id(&from_id)? {
                None => {
                    debug!(msgid = m.id, fromid = %from_id, "no original message found for fromid");
                }
                Some(mut mr) => {
                    debug!(
                        msgid = m.id,
                        fromid = %from_id,
                        "processing incoming message about previous delivery for webhooks"
                    );
                    let report = self.classify_report(account, &mr, part)?;
                    outgoing_event = report.event;

                    // Record this message on the original delivery.
                    mr.last_activity = now;
                    mr.results.push(MsgResult {
                        start: now,
                        code: report.code,
                        secode: report.secode.clone(),
                        error: report.result_error,
                        success: report.result_success,
                    });
                    self.inner().store.update_msg_retired(&mr)?;

                    queue_msg_id = mr.id;
                    subject = mr.subject.clone();
                    data = Some(Outgoing {
                        version: 0,
                        event: report.event,
                        dsn: report.is_dsn,
                        suppressing: report.suppressing,
                        queue_msg_id: mr.id,
                        from_id: from_id.clone(),
                        message_id: mr.message_id.clone(),
                        subject: mr.subject.clone(),
                        webhook_queued: now,
                        smtp_code: report.code,
                        smtp_enhanced_code: smtp_enhanced_code(report.code, &report.secode),
                        error: String::new(),
                        extra: mr.extra.clone(),
                    });
                }
            }
        }

        let Some(acc) = self.accounts().account(account) else {
            return Ok(());
        };

        let hook_url;
        let authorization;
        let is_incoming;
        let payload;
        if let Some(out) = data {
            let Some(cfg) = acc.outgoing_webhook else {
                return Ok(());
            };
            if !cfg.events.is_empty() && !cfg.events.iter().any(|e| e == out.event.as_str()) {
                debug!(event = %out.event, "not sending webhook, account not subscribed for event");
                return Ok(());
            }
            payload = serde_json::to_string(&out)?;
            hook_url = cfg.url;
            authorization = cfg.authorization;
            is_incoming = false;
        } else {
            let Some(cfg) = acc.incoming_webhook else {
                return Ok(());
            };
            debug!(msgid = m.id, "composing webhook for incoming message");

            let mut incoming = Incoming {
                version: 0,
                structure: part.structure(),
                meta: IncomingMeta {
                    msg_id: m.id,
                    mail_from: m.mail_from.clone(),
                    mail_from_validated: m.mail_from_validated,
                    msg_from_validated: m.msg_from_validated,
                    rcpt_to: if m.rcpt_to_domain.is_empty() {
                        String::new()
                    } else {
                        format!("{}@{}", m.rcpt_to_localpart, m.rcpt_to_domain)
                    },
                    dkim_verified_domains: m.dkim_verified_domains.clone(),
                    remote_ip: m.remote_ip.clone(),
                    received: m.received,
                    mailbox_name: mailbox_name.to_string(),
                    automated: false,
                },
                ..Incoming::default()
            };
            if let Some(env) = &part.envelope {
                subject = env.subject.clone();
                incoming.from = mime::addresses(&env.from);
                incoming.to = mime::addresses(&env.to);
                incoming.cc = mime::addresses(&env.cc);
                incoming.bcc = mime::addresses(&env.bcc);
                incoming.reply_to = mime::addresses(&env.reply_to);
                incoming.subject = env.subject.clone();
                incoming.message_id = env.message_id.clone();
                incoming.in_reply_to = env.in_reply_to.clone();
                incoming.date = env.date;
            }
            incoming.references = mime::referenced_ids(&part.header_values("References"));

            // Empty SMTP MAIL FROM indicates some kind of service message;
            // list and precedence headers indicate mailing or marketing
            // lists; a report content-type indicates a DSN or MDN.
            incoming.meta.automated = m.mail_from.is_empty()
                || mime::is_automated(part)
                || (part.media_type == "multipart" && part.media_subtype == "report");

            let (text, html) = mime::readable_parts(part, 1024 * 1024);
            incoming.text = text.replace("\r\n", "\n");
            incoming.html = html.replace("\r\n", "\n");

            payload = serde_json::to_string(&incoming)?;
            hook_url = cfg.url;
            authorization = cfg.authorization;
            is_incoming = true;
        }

        let mut h = Hook {
            id: 0,
            queue_msg_id,
            from_id,
            message_id: message_id.to_string(),
            subject,
            extra: BTreeMap::new(),
            account: account.to_string(),
            url: hook_url,
            authorization,
            is_incoming,
            outgoing_event: if is_incoming { None } else { Some(outgoing_event) },
            payload,
            submitted: now,
            attempts: 0,
            next_attempt: now,
            results: Vec::new(),
        };
        self.inner()
            .store
            .add_hook(&mut h, now, acc.keep_retired_webhook_period)?;
        debug!(
            webhookid = h.id,
            msgid = queue_msg_id,
            account,
            url = %h.url,
            event = %h.event_tag(),
            "queued webhook for incoming message"
        );
        self.kick();
        Ok(())
    }

    /// Classify a message correlated to an earlier send: a proper DSN yields
    /// a delivery event (running failed deliveries by the suppression list),
    /// anything else stays `unrecognized`.
    fn classify_report(
        &self,
        account: &str,
        mr: &crate::types::MsgRetired,
        part: &Part,
    ) -> Result<Report, Error> {
        let mut report = Report {
            event: OutgoingEvent::Unrecognized,
            is_dsn: false,
            suppressing: false,
            code: 0,
            secode: String::new(),
            result_error: "incoming message".into(),
            result_success: false,
        };

        if !part.is_dsn_report() {
            // Some kind of delivery-related event, but not one we recognize.
            report.result_error = "incoming message not a dsn".into();
            return Ok(report);
        }
        report.is_dsn = true;

        let decoded = match dsn::decode(&part.parts[1].body) {
            Ok(d) => d,
            Err(err) => {
                info!(msgid = mr.id, %err, "parsing dsn message for webhook");
                report.result_error = format!("parsing incoming dsn: {err}");
                return Ok(report);
            }
        };
        if decoded.recipients.len() != 1 {
            info!(
                msgid = mr.id,
                nrecipients = decoded.recipients.len(),
                "dsn message for webhook does not have exactly one dsn recipient"
            );
            report.result_error = format!(
                "incoming dsn has {} recipients, expecting 1",
                decoded.recipients.len()
            );
            return Ok(report);
        }

        let rcpt = &decoded.recipients[0];
        if !rcpt.diagnostic_code_smtp.is_empty() {
            let (code, secode) = parse_smtp_codes(&rcpt.diagnostic_code_smtp);
            report.code = code;
            report.secode = secode;
        }
        if report.code == 0 && !rcpt.status.is_empty() {
            if let Some(rest) = rcpt.status.strip_prefix("4.") {
                report.code = 400;
                report.secode = rest.to_string();
            } else if let Some(rest) = rcpt.status.strip_prefix("5.") {
                report.code = 500;
                report.secode = rest.to_string();
            }
        }
        debug!(
            action = %rcpt.action,
            dsncode = report.code,
            dsnsecode = %report.secode,
            "incoming dsn message"
        );

        match rcpt.action() {
            dsn::Action::Failed => {
                report.event = OutgoingEvent::Failed;
                if report.code != 0 {
                    let check = SuppressionCheck {
                        msg_id: mr.id,
                        account: account.to_string(),
                        recipient: mr.recipient.clone(),
                        code: report.code,
                        secode: report.secode.clone(),
                        source: "DSN".into(),
                    };
                    let suppressed = self.inner().suppression.process(&check)?;
                    report.suppressing = !suppressed.is_empty();
                } else {
                    debug!(msgid = mr.id, "no code/secode in dsn for failed delivery");
                }
            }
            dsn::Action::Delayed => report.event = OutgoingEvent::Delayed,
            dsn::Action::Delivered => {
                report.event = OutgoingEvent::Delivered;
                report.result_success = true;
            }
            dsn::Action::Relayed => {
                report.event = OutgoingEvent::Relayed;
                report.result_success = true;
            }
            dsn::Action::Expanded => {
                report.event = OutgoingEvent::Expanded;
                report.result_success = true;
            }
            dsn::Action::Other(action) => {
                info!(msgid = mr.id, %action, "unrecognized dsn action");
            }
        }
        Ok(report)
    }
}

struct Report {
    event: OutgoingEvent,
    is_dsn: bool,
    suppressing: bool,
    code: u16,
    secode: String,
    result_error: String,
    result_success: bool,
}

/// "5.1.1"-style enhanced code from a status code and its detail part.
fn smtp_enhanced_code(code: u16, secode: &str) -> String {
    if secode.is_empty() {
        String::new()
    } else {
        format!("{}.{}", code / 100, secode)
    }
}

/// Extract `(code, secode)` from an smtp Diagnostic-Code value like
/// "550 5.1.1 no such user".
fn parse_smtp_codes(line: &str) -> (u16, String) {
    let mut parts = line.split_whitespace();
    let Some(first) = parts.next() else {
        return (0, String::new());
    };
    if first.len() != 3 {
        return (0, String::new());
    }
    let Ok(code) = first.parse::<u16>() else {
        return (0, String::new());
    };
    if code >= 600 {
        return (0, String::new());
    }
    let secode = parts
        .next()
        .and_then(|s| {
            if s.starts_with("4.") || s.starts_with("5.") {
                Some(s[2..].to_string())
            } else {
                None
            }
        })
        .unwrap_or_default();
    (code, secode)
}
