use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event tag for webhooks about outgoing deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutgoingEvent {
    /// Message accepted by the remote server.
    Delivered,
    /// Message dropped because the recipient is on the suppression list.
    Suppressed,
    /// Delivery is delayed, will be retried.
    Delayed,
    /// Delivery failed permanently.
    Failed,
    /// Message relayed onwards without final confirmation.
    Relayed,
    /// Address expanded to multiple recipients.
    Expanded,
    /// Delivery canceled by the admin.
    Canceled,
    /// A delivery report arrived that we could not interpret.
    Unrecognized,
}

impl OutgoingEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutgoingEvent::Delivered => "delivered",
            OutgoingEvent::Suppressed => "suppressed",
            OutgoingEvent::Delayed => "delayed",
            OutgoingEvent::Failed => "failed",
            OutgoingEvent::Relayed => "relayed",
            OutgoingEvent::Expanded => "expanded",
            OutgoingEvent::Canceled => "canceled",
            OutgoingEvent::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for OutgoingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker error of a [`HookResult`] whose attempt has not completed yet.
pub(crate) const RESULT_ERROR_DELIVERING: &str = "delivering";

/// A webhook call about a delivery. Tried with backoff until it succeeds or
/// the attempts run out, then moved to [`HookRetired`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    /// Store-assigned, monotonic, never reused.
    pub id: u64,
    /// Originating outgoing queue message. Zero for hooks about incoming messages.
    pub queue_msg_id: u64,
    /// Token embedded in the envelope return-path of the outgoing message, used
    /// to correlate incoming DSNs. Empty for plain incoming messages.
    pub from_id: String,
    /// Message-ID of the outgoing or incoming message, including `<>`.
    pub message_id: String,
    pub subject: String,
    /// Free-form data carried over from the original submission.
    pub extra: BTreeMap<String, String>,

    pub account: String,
    /// Taken from the account configuration when the webhook is scheduled.
    pub url: String,
    /// Optional value for the Authorization request header.
    pub authorization: String,
    pub is_incoming: bool,
    /// Set iff `is_incoming` is false.
    pub outgoing_event: Option<OutgoingEvent>,
    /// Serialized JSON body to submit.
    pub payload: String,

    pub submitted: DateTime<Utc>,
    pub attempts: u32,
    pub next_attempt: DateTime<Utc>,
    pub results: Vec<HookResult>,
}

impl Hook {
    /// Event tag for logging and filtering, with "incoming" for incoming hooks.
    pub fn event_tag(&self) -> &str {
        if self.is_incoming {
            "incoming"
        } else {
            self.outgoing_event.map(|e| e.as_str()).unwrap_or("")
        }
    }

    pub fn last_result(&self) -> Option<&HookResult> {
        self.results.last()
    }

    /// The retired form of this hook, for insertion in the same transaction
    /// that removes the pending record.
    pub(crate) fn retired(
        &self,
        success: bool,
        last_activity: DateTime<Utc>,
        keep_until: DateTime<Utc>,
    ) -> HookRetired {
        HookRetired {
            id: self.id,
            queue_msg_id: self.queue_msg_id,
            from_id: self.from_id.clone(),
            message_id: self.message_id.clone(),
            subject: self.subject.clone(),
            extra: self.extra.clone(),
            account: self.account.clone(),
            url: self.url.clone(),
            authorization: !self.authorization.is_empty(),
            is_incoming: self.is_incoming,
            outgoing_event: self.outgoing_event,
            payload: self.payload.clone(),
            submitted: self.submitted,
            superseded_by_id: 0,
            attempts: self.attempts,
            results: self.results.clone(),
            success,
            last_activity,
            keep_until,
        }
    }
}

/// Result of a single attempt to deliver a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    pub start: DateTime<Utc>,
    /// Wall-clock time of the HTTP transaction, as integer nanoseconds.
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    /// URL as used for this attempt.
    pub url: String,
    pub success: bool,
    /// HTTP status code, 0 for transport errors.
    pub code: u16,
    pub error: String,
    /// At most 512 bytes of the HTTP response body.
    pub response: String,
}

/// A hook that was delivered, failed, superseded or canceled, kept according
/// to the account retention period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookRetired {
    /// Same as the original [`Hook::id`].
    pub id: u64,
    pub queue_msg_id: u64,
    pub from_id: String,
    pub message_id: String,
    pub subject: String,
    pub extra: BTreeMap<String, String>,

    pub account: String,
    pub url: String,
    /// Whether the request carried an Authorization header. The value itself
    /// is not retained.
    pub authorization: bool,
    pub is_incoming: bool,
    pub outgoing_event: Option<OutgoingEvent>,
    pub payload: String,

    pub submitted: DateTime<Utc>,
    /// If non-zero, the id of a newer hook for the same originating message
    /// that displaced this one.
    pub superseded_by_id: u64,
    pub attempts: u32,
    pub results: Vec<HookResult>,

    pub success: bool,
    pub last_activity: DateTime<Utc>,
    pub keep_until: DateTime<Utc>,
}

impl HookRetired {
    pub fn event_tag(&self) -> &str {
        if self.is_incoming {
            "incoming"
        } else {
            self.outgoing_event.map(|e| e.as_str()).unwrap_or("")
        }
    }

    pub fn last_result(&self) -> Option<&HookResult> {
        self.results.last()
    }
}

/// Retired outgoing message, kept around so incoming DSNs can be correlated
/// back to the original send through its from-id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgRetired {
    pub id: u64,
    /// Token from the envelope return-path local part. Unique when non-empty.
    pub from_id: String,
    pub message_id: String,
    pub subject: String,
    pub extra: BTreeMap<String, String>,
    pub sender_account: String,
    /// Envelope recipient, for suppression-list checks.
    pub recipient: String,
    pub last_activity: DateTime<Utc>,
    pub results: Vec<MsgResult>,
}

/// Result entry on a retired outgoing message, appended when a delivery report
/// about it arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgResult {
    pub start: DateTime<Utc>,
    pub code: u16,
    pub secode: String,
    pub error: String,
    pub success: bool,
}

/// Serialize a std `Duration` as integer nanoseconds, an exact JSON form.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}
