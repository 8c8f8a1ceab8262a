use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("no such mailbox {0}")]
    NoSuchMailbox(String),
    #[error("no such user {0}")]
    NoSuchUser(String),
    #[error("no such message")]
    NoSuchMessage,
    #[error("mailbox {0} already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("authentication failed for {0}")]
    AuthFailed(String),
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("store invariant violated: {0}")]
    Internal(String),
}
