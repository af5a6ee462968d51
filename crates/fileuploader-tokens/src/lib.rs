//! EXTJWT token acquisition for the file uploader.
//!
//! Uploads are authenticated by attaching a short-lived JSON Web Token that the chat server hands
//! out through the `EXTJWT` command. This crate acquires those tokens over a peer's message
//! stream, caches them while they are fresh, deduplicates concurrent requests for the same peer,
//! and remembers which peers do not know the command at all.
//!
//! The main entry point is [`TokenManager`](tokens::TokenManager). Connections are plugged in by
//! implementing the [`Peer`](protocol::Peer) trait.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod correlator;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod tokens;
pub mod uploads;
pub mod utils;

pub use error::TokenError;
pub use protocol::{Message, Peer};
pub use tokens::{Token, TokenLookup, TokenManager};
