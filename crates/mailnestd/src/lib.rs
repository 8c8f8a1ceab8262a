//! mailnest: an in-memory, multi-protocol mail server used as a test
//! double. One shared mailbox store is served simultaneously over
//! SMTP (sink), IMAP4rev1 and POP3, with optional TLS variants.
//!
//! Tests embed [`MailNest`]: start listeners, inject mail via SMTP or
//! the store API, await delivery with
//! [`MailNest::wait_for_incoming_email`], then assert through
//! IMAP/POP3 or [`MailNest::received_messages`].
pub mod codec;
pub mod config;
pub mod error;
mod imap;
pub mod lifecycle;
mod listener;
mod pop3;
mod sasl;
pub mod server;
mod smtp;
pub mod tls;

pub use config::{ListenerConfig, LoginMode, Protocol, ServerConfig, UserConfig};
pub use error::SessionError;
pub use server::MailNest;
