//! WebSocket upgrade handshake control.

pub mod headers;
pub mod server;

use sha1::{Digest, Sha1};

/// Derives the `Sec-WebSocket-Accept` response header from a
/// `Sec-WebSocket-Key` request header.
///
/// The digest input is the raw key string as it appeared on the wire (the
/// base64 text itself, not its decoded bytes) concatenated with the protocol
/// GUID. A fresh hasher is used per call: the computation is pure and safe
/// under concurrent handshakes.
pub fn derive_accept_key(request_key: &[u8]) -> String {
    // ... field is constructed by concatenating /key/ ...
    // ... with the string "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" (RFC 6455)
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut sha1 = Sha1::default();
    sha1.update(request_key);
    sha1.update(WS_GUID);
    data_encoding::BASE64.encode(&sha1.finalize())
}
