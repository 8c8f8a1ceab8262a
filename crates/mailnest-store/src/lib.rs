//! The shared in-memory mailbox store behind the SMTP, IMAP and POP3
//! front ends: users and credentials, hierarchical folders, messages
//! with flags and stable UIDs, folder change notifications, search
//! evaluation and the delivery pipeline.
pub mod delivery;
pub mod error;
pub mod folder;
pub mod message;
pub mod search;
pub mod store;
pub mod users;

pub use delivery::*;
pub use error::*;
pub use folder::*;
pub use message::*;
pub use search::*;
pub use store::*;
pub use users::*;
