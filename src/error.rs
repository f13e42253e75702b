//! Error taxonomy for the handshake, frame and session layers.

use std::{io, result, str};

use http::StatusCode;
use thiserror::Error;

use crate::protocol::frame::coding::Data;

/// A convenience alias for the crate's result type.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Possible WebSocket errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection is closed or got closed during the operation.
    ///
    /// Receiving this is part of the normal lifecycle and not a failure. It
    /// is returned exactly once per connection, when the close handshake has
    /// completed and the transport has been shut down.
    #[error("Connection closed normally")]
    ConnectionClosed,
    /// An operation was attempted on an already terminated connection.
    ///
    /// Unlike [`Error::ConnectionClosed`], this is a caller bug: the
    /// connection reported closure earlier and must not be used again.
    #[error("Trying to work with closed connection")]
    AlreadyClosed,
    /// Input-output error from the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// WebSocket protocol violation.
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// A buffer or payload limit was exceeded.
    #[error("Space limit exceeded: {0}")]
    Capacity(#[from] CapacityError),
    /// The upgrade request failed validation and was answered with an HTTP
    /// error response.
    #[error("Handshake rejected: {0}")]
    Rejected(RejectionKind),
    /// A text payload was not valid UTF-8.
    #[error("UTF-8 encoding error: {0}")]
    Utf8(String),
    /// HTTP type construction error.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
}

impl From<str::Utf8Error> for Error {
    fn from(err: str::Utf8Error) -> Self {
        Error::Utf8(err.to_string())
    }
}

impl From<simdutf8::basic::Utf8Error> for Error {
    fn from(_: simdutf8::basic::Utf8Error) -> Self {
        Error::Utf8("invalid utf-8 sequence".into())
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        Error::Protocol(ProtocolError::Httparse(err))
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Error::Http(err.into())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Error::Http(err.into())
    }
}

impl From<http::uri::InvalidUri> for Error {
    fn from(err: http::uri::InvalidUri) -> Self {
        Error::Http(err.into())
    }
}

/// A violation of the WebSocket wire protocol or of the handshake exchange.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Error)]
pub enum ProtocolError {
    /// The handshake request could not be parsed as HTTP.
    #[error("Failed to parse the handshake request: {0}")]
    Httparse(#[from] httparse::Error),
    /// The peer closed the transport before finishing the handshake.
    #[error("Handshake not finished")]
    HandshakeIncomplete,
    /// The handshake did not complete within the configured timeout.
    #[error("Handshake did not complete in time")]
    HandshakeTimedOut,
    /// The handshake request head exceeded the configured size limit without
    /// a terminating blank line.
    #[error("Handshake request exceeds the size limit")]
    OversizedHandshake,
    /// Bytes followed the request head before the 101 response was sent.
    #[error("Unexpected data after the handshake request")]
    JunkAfterRequest,
    /// The upgrade request method was not `GET`.
    #[error("The request method must be GET")]
    WrongHttpMethod,
    /// The upgrade request used an HTTP version below 1.1.
    #[error("The request version must be HTTP/1.1 or higher")]
    WrongHttpVersion,
    /// A client-to-server frame arrived without a mask key.
    #[error("Received an unmasked frame from the client")]
    UnmaskedClientFrame,
    /// Reserved frame-header bits were set without a negotiated extension.
    #[error("Reserved bits are non-zero")]
    ReservedBitsSet,
    /// A control frame used a reserved opcode.
    #[error("Unknown control frame type: {0}")]
    UnknownControlFrameType(u8),
    /// A data frame used a reserved opcode.
    #[error("Unknown data frame type: {0}")]
    UnknownDataFrameType(u8),
    /// A control frame had its fin bit cleared.
    #[error("Fragmented control frame")]
    FragmentedControlFrame,
    /// A control frame carried more than 125 payload bytes.
    #[error("Control frame too big (payload must be 125 bytes or less)")]
    ControlFrameTooBig,
    /// A continuation frame arrived with no message in progress.
    #[error("Continuation frame while there is nothing to continue")]
    UnexpectedContinueFrame,
    /// A new data frame arrived while a fragmented message was in progress.
    #[error("While waiting for more fragments received: {0}")]
    ExpectedFragment(Data),
    /// A close frame carried a one-byte payload, which cannot hold a code.
    #[error("Invalid close sequence")]
    InvalidCloseSequence,
    /// The transport reached EOF without a close handshake.
    #[error("Connection reset without closing handshake")]
    ResetWithoutClosingHandshake,
    /// A message was submitted after the close handshake started.
    #[error("Sending after closing is not allowed")]
    SendAfterClosing,
    /// A frame arrived after the close handshake completed.
    #[error("Remote sent frame after having sent a Close frame")]
    ReceivedAfterClosing,
}

/// A size limit was exceeded.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Error)]
pub enum CapacityError {
    /// An assembled message grew past the configured maximum.
    #[error("Message too long: {size} > {max_size}")]
    MessageTooLong {
        /// The size of the message that was attempted.
        size: usize,
        /// The configured maximum message size.
        max_size: usize,
    },
    /// A single frame declared a payload past the configured maximum. The
    /// declared length is checked before any payload byte is buffered.
    #[error("Frame too long: {size} > {max_size}")]
    FrameTooLong {
        /// The payload length declared in the frame header.
        size: usize,
        /// The configured maximum frame size.
        max_size: usize,
    },
}

/// Why an upgrade request was turned down.
///
/// The checks run in a fixed order (host, upgrade, connection, version, key,
/// origin) and the first failing check determines the kind, so a request with
/// several defects is always reported by its earliest one.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Error)]
pub enum RejectionKind {
    /// `Host` did not match the address the server is bound to.
    #[error("\"Host\" does not match the server address")]
    BadHost,
    /// `Upgrade` was missing or not `websocket`.
    #[error("\"Upgrade\" is not \"websocket\"")]
    BadUpgrade,
    /// `Connection` did not contain the `Upgrade` token.
    #[error("\"Connection\" does not contain the \"Upgrade\" token")]
    BadConnection,
    /// `Sec-WebSocket-Version` was not `13`.
    #[error("\"Sec-WebSocket-Version\" is not \"13\"")]
    UnsupportedVersion,
    /// `Sec-WebSocket-Key` was missing or not the base64 of 16 bytes.
    #[error("\"Sec-WebSocket-Key\" is missing or invalid")]
    BadKey,
    /// `Origin` was missing or not in the allowed set.
    #[error("\"Origin\" is not allowed")]
    BadOrigin,
}

impl RejectionKind {
    /// The HTTP status used to answer a request rejected for this reason.
    pub fn status(self) -> StatusCode {
        match self {
            RejectionKind::BadOrigin => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}
