//! An anonymizing store-and-forward SMTP relay.
//!
//! Mail from the outside world is annotated and forwarded to a single
//! internal mailbox. Mail sent by authenticated internal users leaves
//! under a per-recipient pseudonym, so that external correspondents
//! never learn internal addresses.

pub mod allocation;
pub mod config;
pub mod connection;
pub mod dkim;
pub mod dnsbl;
pub mod error;
pub mod logging;
pub mod message;
pub mod pseudonym;
pub mod session;
pub mod smtp_server;
pub mod spf;
pub mod sqlite_store;
pub mod tls_helpers;
pub mod upstream;

#[cfg(test)]
pub(crate) mod test_util;
