//! Server-side WebSocket upgrade and session engine for the
//! [`monoio`](https://github.com/bytedance/monoio) runtime.
//!
//! The crate covers the server half of RFC 6455: validating and answering
//! the HTTP upgrade handshake, encoding and decoding frames, reassembling
//! fragmented messages, and running each accepted connection as its own
//! session task with bounded outgoing queues.

#![deny(
    missing_docs,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub mod error;
pub use error::{Error, RejectionKind, Result};

pub mod config;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod session;

// re-export bytes since used in `Message` API.
pub use bytes::Bytes;
pub use http;

pub use crate::{
    config::ServerConfig,
    handshake::server::{server_handshake, validate_upgrade, AcceptPolicy},
    protocol::{frame::Utf8Bytes, Connection, ConnectionConfig, Message},
    server::{accept, accept_with_config, Acceptor},
    session::{MessageStream, SessionConfig, SessionHandle},
};
