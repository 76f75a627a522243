//! Per-account webhook configuration and the collaborator services the
//! intake path consults. The mail server proper owns account storage and the
//! suppression list; this crate only consumes them through [`Accounts`] and
//! [`Suppression`].

use std::collections::HashMap;
use std::time::Duration;

use crate::error::Error;

/// Webhook endpoint for incoming messages.
#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    pub url: String,
    /// Opaque value for the Authorization request header, may be empty.
    pub authorization: String,
}

/// Webhook endpoint for outgoing delivery events.
#[derive(Debug, Clone, Default)]
pub struct OutgoingWebhookConfig {
    pub url: String,
    pub authorization: String,
    /// Event tags the account subscribed to. Empty means all events.
    pub events: Vec<String>,
}

/// Webhook-relevant slice of an account's configuration.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub incoming_webhook: Option<WebhookConfig>,
    pub outgoing_webhook: Option<OutgoingWebhookConfig>,
    /// How long retired webhooks are kept for operator inspection. Zero
    /// disables retention.
    pub keep_retired_webhook_period: Duration,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            incoming_webhook: None,
            outgoing_webhook: None,
            keep_retired_webhook_period: DEFAULT_KEEP_RETIRED,
        }
    }
}

/// Webhook-relevant slice of a domain's configuration.
#[derive(Debug, Clone, Default)]
pub struct DomainConfig {
    /// Separators splitting a catch-all local part into base address and
    /// from-id suffix, in order of preference.
    pub localpart_catchall_separators: Vec<String>,
}

/// Retention period used when the account is unknown.
pub(crate) const DEFAULT_KEEP_RETIRED: Duration = Duration::from_secs(7 * 24 * 3600);

/// Read access to account and domain configuration.
pub trait Accounts: Send + Sync {
    fn account(&self, name: &str) -> Option<AccountConfig>;
    fn domain(&self, domain: &str) -> Option<DomainConfig>;
}

/// Retention period for retired webhooks of an account.
pub(crate) fn retired_keep(accounts: &dyn Accounts, account: &str) -> Duration {
    accounts
        .account(account)
        .map(|a| a.keep_retired_webhook_period)
        .unwrap_or(DEFAULT_KEEP_RETIRED)
}

/// A failed-delivery report to run by the suppression list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppressionCheck {
    /// Retired queue message the report is about.
    pub msg_id: u64,
    pub account: String,
    /// Envelope recipient of the original message.
    pub recipient: String,
    pub code: u16,
    pub secode: String,
    /// Where the report came from, e.g. "DSN".
    pub source: String,
}

/// The suppression-list service of the mail server.
pub trait Suppression: Send + Sync {
    /// Process a failure report. Returns ids of queue messages whose
    /// recipients were newly added to the suppression list.
    fn process(&self, check: &SuppressionCheck) -> Result<Vec<u64>, Error>;
}

/// Fixed in-memory configuration, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticAccounts {
    pub accounts: HashMap<String, AccountConfig>,
    pub domains: HashMap<String, DomainConfig>,
}

impl Accounts for StaticAccounts {
    fn account(&self, name: &str) -> Option<AccountConfig> {
        self.accounts.get(name).cloned()
    }

    fn domain(&self, domain: &str) -> Option<DomainConfig> {
        self.domains.get(domain).cloned()
    }
}

/// Suppression service that never suppresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSuppression;

impl Suppression for NoSuppression {
    fn process(&self, _check: &SuppressionCheck) -> Result<Vec<u64>, Error> {
        Ok(Vec::new())
    }
}
