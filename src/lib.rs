//! Persistent webhook delivery queue for a mail server.
//!
//! This crate schedules, delivers and retires HTTP webhooks about mail
//! deliveries: events for outgoing messages (delivered, failed, delayed, …)
//! and notifications for incoming messages. Incoming DSNs are correlated back
//! to the original send and reported as outgoing delivery events.
//!
//! ## Guarantees
//! - Durability across restarts: hooks live in an embedded store
//! - At-least-once delivery with bounded backoff (1m doubling up to 16h,
//!   then one final attempt after 32h)
//! - At most one in-flight delivery per destination URL
//! - At most one pending hook per originating outgoing message; newer
//!   events supersede older pending ones without losing their history
//! - Retired hooks are kept for inspection until their retention lapses
//!
//! ## Non-Guarantees
//! - Exactly-once delivery: receivers must deduplicate on the webhook id
//! - Event ordering across different originating messages
//! - FIFO per destination URL; ordering is by next-attempt time
//!
//! Construct an [`Engine`] with a [`HookStore`] and the account
//! configuration, then feed it delivery events and incoming messages:
//!
//! ```no_run
//! use std::sync::Arc;
//! use hookqueue::{DispatcherConfig, Engine, HookStore, NoSuppression, StaticAccounts};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), hookqueue::Error> {
//! let store = HookStore::open("data/hooks.db")?;
//! let accounts = Arc::new(StaticAccounts::default());
//! let mut engine = Engine::start(
//!     store,
//!     accounts,
//!     Arc::new(NoSuppression),
//!     DispatcherConfig::default(),
//! )?;
//! // engine.outgoing_hook(...) / engine.incoming(...)
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod admin;
mod config;
mod dispatcher;
pub mod dsn;
mod error;
mod intake;
pub mod mime;
mod payload;
mod store;
mod types;
mod worker;

pub use admin::{
    HookFilter, HookRetiredFilter, HookRetiredSort, HookRetiredSortField, HookSort, HookSortField,
};
pub use config::{
    AccountConfig, Accounts, DomainConfig, NoSuppression, OutgoingWebhookConfig, StaticAccounts,
    Suppression, SuppressionCheck, WebhookConfig,
};
pub use dispatcher::{DispatcherConfig, Engine};
pub use error::{Error, StoreError};
pub use intake::{IncomingMessage, OutgoingMsg};
pub use payload::{Incoming, IncomingMeta, NameAddress, Outgoing, Structure};
pub use store::HookStore;
pub use types::{Hook, HookResult, HookRetired, MsgResult, MsgRetired, OutgoingEvent};
pub use worker::REQUEST_DURATION_BUCKETS;
