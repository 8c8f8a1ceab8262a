use mailnest_store::StoreError;
use thiserror::Error;

/// Session-level failures. `Protocol`, `Io`, `ConnectionClosed` and
/// `Shutdown` terminate the session; everything else is translated
/// into a protocol reply and the session continues.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("command not valid in this state: {0}")]
    State(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("server shutting down")]
    Shutdown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the session can keep going after reporting this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::State(_) | Self::Store(_))
    }
}
