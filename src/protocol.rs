//! Generic WebSocket message stream.

pub mod connection;
pub mod frame;
pub mod message;

pub use connection::{Connection, ConnectionConfig};
pub use frame::CloseFrame;
pub use message::Message;
