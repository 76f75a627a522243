use thiserror::Error;

/// Errors surfaced from intake and admin entry points.
///
/// Operator-facing callers get a short human message via `Display`; programmatic
/// callers should branch on [`Error::code`].
#[derive(Debug, Error)]
pub enum Error {
    /// The persistent store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid operator input, e.g. an unparseable filter duration or sort field.
    #[error("{0}")]
    Usage(String),

    /// Marshalling a webhook payload failed.
    #[error("composing webhook payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The suppression-list collaborator failed.
    #[error("suppression check: {0}")]
    Suppression(String),

    /// Building the shared HTTP client failed.
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Stable error tag: "user" for operator-induced errors, "server" otherwise.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Usage(_) => "user",
            _ => "server",
        }
    }
}

/// Storage-layer failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opening database: {0}")]
    Open(#[from] redb::DatabaseError),

    #[error("transaction: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("opening table: {0}")]
    Table(#[from] redb::TableError),

    #[error("commit: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("storage: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("decoding stored record: {0}")]
    Decode(#[from] serde_json::Error),

    /// The record was neither pending nor retired.
    #[error("record not found")]
    Absent,
}
