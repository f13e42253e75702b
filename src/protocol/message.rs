//! WebSocket message types.

use std::fmt;

use bytes::Bytes;

use super::frame::{utf8::Incomplete, CloseFrame, Frame, Utf8Bytes};
use crate::error::{CapacityError, Error, Result};

/// An enum representing the various forms of a WebSocket message.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    /// A text WebSocket message.
    Text(Utf8Bytes),
    /// A binary WebSocket message.
    Binary(Bytes),
    /// A ping message with the specified payload.
    ///
    /// The payload here must have a length less than 125 bytes.
    Ping(Bytes),
    /// A pong message with the specified payload.
    ///
    /// The payload here must have a length less than 125 bytes.
    Pong(Bytes),
    /// A close message with the optional close frame.
    Close(Option<CloseFrame>),
    /// Raw frame. Note, that you're not going to get this value while reading
    /// the message.
    Frame(Frame),
}

impl Message {
    /// Creates a new text WebSocket message from a stringable.
    pub fn text<S>(string: S) -> Message
    where
        S: Into<Utf8Bytes>,
    {
        Message::Text(string.into())
    }

    /// Creates a new binary WebSocket message by converting to `Bytes`.
    pub fn binary<B>(bin: B) -> Message
    where
        B: Into<Bytes>,
    {
        Message::Binary(bin.into())
    }

    /// Indicates whether a message is a text message.
    pub fn is_text(&self) -> bool {
        matches!(*self, Message::Text(_))
    }

    /// Indicates whether a message is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(*self, Message::Binary(_))
    }

    /// Indicates whether a message is a ping message.
    pub fn is_ping(&self) -> bool {
        matches!(*self, Message::Ping(_))
    }

    /// Indicates whether a message is a pong message.
    pub fn is_pong(&self) -> bool {
        matches!(*self, Message::Pong(_))
    }

    /// Indicates whether a message is a close message.
    pub fn is_close(&self) -> bool {
        matches!(*self, Message::Close(_))
    }

    /// Gets the length of the WebSocket message.
    pub fn len(&self) -> usize {
        match *self {
            Message::Text(ref string) => string.len(),
            Message::Binary(ref data) | Message::Ping(ref data) | Message::Pong(ref data) => {
                data.len()
            }
            Message::Close(ref data) => data.as_ref().map(|d| d.reason.len()).unwrap_or(0),
            Message::Frame(ref frame) => frame.len(),
        }
    }

    /// Returns true if the WebSocket message has no content.
    /// For example, if the other side of the connection sent an empty string.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the message and returns it as binary data.
    pub fn into_data(self) -> Bytes {
        match self {
            Message::Text(utf8) => utf8.into(),
            Message::Binary(data) | Message::Ping(data) | Message::Pong(data) => data,
            Message::Close(None) => <_>::default(),
            Message::Close(Some(frame)) => frame.reason.into(),
            Message::Frame(frame) => frame.into_payload(),
        }
    }

    /// Attempts to consume the message and convert it to UTF-8 text.
    pub fn into_text(self) -> Result<Utf8Bytes> {
        match self {
            Message::Text(txt) => Ok(txt),
            Message::Binary(data) | Message::Ping(data) | Message::Pong(data) => {
                Ok(data.try_into()?)
            }
            Message::Close(None) => Ok(<_>::default()),
            Message::Close(Some(frame)) => Ok(frame.reason),
            Message::Frame(frame) => frame.into_text(),
        }
    }

    /// Attempts to get a &str from the message, converting binary data if
    /// it happens to be valid UTF-8.
    pub fn to_text(&self) -> Result<&str> {
        match *self {
            Message::Text(ref string) => Ok(string.as_str()),
            Message::Binary(ref data) | Message::Ping(ref data) | Message::Pong(ref data) => {
                Ok(simdutf8::basic::from_utf8(data)?)
            }
            Message::Close(None) => Ok(""),
            Message::Close(Some(ref frame)) => Ok(&frame.reason),
            Message::Frame(ref frame) => frame.to_text(),
        }
    }
}

impl From<String> for Message {
    #[inline]
    fn from(string: String) -> Self {
        Message::text(string)
    }
}

impl<'s> From<&'s str> for Message {
    #[inline]
    fn from(string: &'s str) -> Self {
        Message::text(string)
    }
}

impl<'b> From<&'b [u8]> for Message {
    #[inline]
    fn from(data: &'b [u8]) -> Self {
        Message::binary(Bytes::copy_from_slice(data))
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::binary(data)
    }
}

impl From<Vec<u8>> for Message {
    #[inline]
    fn from(data: Vec<u8>) -> Self {
        Message::binary(data)
    }
}

impl From<Message> for Bytes {
    #[inline]
    fn from(message: Message) -> Self {
        message.into_data()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        if let Ok(string) = self.to_text() {
            write!(f, "{string}")
        } else {
            write!(f, "Binary Data<length={}>", self.len())
        }
    }
}

/// Accumulates the fragments of one in-flight message until its final frame.
#[derive(Debug)]
pub(crate) enum FragmentBuffer {
    Text(TextCollector),
    Binary(Vec<u8>),
}

impl FragmentBuffer {
    /// Starts a text message assembly.
    pub fn text() -> Self {
        FragmentBuffer::Text(TextCollector::default())
    }

    /// Starts a binary message assembly.
    pub fn binary() -> Self {
        FragmentBuffer::Binary(Vec::new())
    }

    /// Bytes accumulated so far, counting any partial UTF-8 carry.
    pub fn len(&self) -> usize {
        match self {
            FragmentBuffer::Text(collector) => collector.len(),
            FragmentBuffer::Binary(buf) => buf.len(),
        }
    }

    /// Appends one fragment, enforcing the message size limit with
    /// overflow-safe accounting. Text fragments are UTF-8 validated as they
    /// stream in, so an invalid payload fails on the offending fragment.
    pub fn push(&mut self, fragment: impl AsRef<[u8]>, size_limit: Option<usize>) -> Result<()> {
        let max_size = size_limit.unwrap_or(usize::MAX);
        let current = self.len();
        let addition = fragment.as_ref().len();
        if current > max_size || addition > max_size - current {
            return Err(Error::Capacity(CapacityError::MessageTooLong {
                size: current + addition,
                max_size,
            }));
        }

        match self {
            FragmentBuffer::Text(collector) => collector.push(fragment.as_ref()),
            FragmentBuffer::Binary(buf) => {
                buf.extend_from_slice(fragment.as_ref());
                Ok(())
            }
        }
    }

    /// Finishes the assembly into a complete message.
    pub fn complete(self) -> Result<Message> {
        match self {
            FragmentBuffer::Text(collector) => Ok(Message::Text(collector.finish()?.into())),
            FragmentBuffer::Binary(buf) => Ok(Message::Binary(buf.into())),
        }
    }
}

/// Streaming UTF-8 accumulator: validates as data arrives and carries code
/// points split across fragment boundaries.
#[derive(Debug, Default)]
pub(crate) struct TextCollector {
    data: String,
    carry: Incomplete,
}

impl TextCollector {
    fn len(&self) -> usize {
        self.data.len().saturating_add(self.carry.len())
    }

    fn push(&mut self, mut input: &[u8]) -> Result<()> {
        if !self.carry.is_empty() {
            match self.carry.try_complete(input) {
                Some((Ok(text), rest)) => {
                    self.data.push_str(text);
                    input = rest;
                }
                Some((Err(bad), _)) => {
                    return Err(Error::Utf8(String::from_utf8_lossy(bad).into()));
                }
                None => return Ok(()),
            }
        }

        match simdutf8::compat::from_utf8(input) {
            Ok(text) => {
                self.data.push_str(text);
                Ok(())
            }

            Err(error) => {
                let (valid, after_valid) = input.split_at(error.valid_up_to());
                self.data
                    .push_str(unsafe { std::str::from_utf8_unchecked(valid) });

                match error.error_len() {
                    Some(invalid_len) => Err(Error::Utf8(
                        String::from_utf8_lossy(&after_valid[..invalid_len]).into(),
                    )),
                    None => {
                        self.carry = Incomplete::from_bytes(after_valid);
                        Ok(())
                    }
                }
            }
        }
    }

    fn finish(self) -> Result<String> {
        if !self.carry.is_empty() {
            return Err(Error::Utf8("incomplete utf-8 at end of message".into()));
        }
        Ok(self.data)
    }
}
