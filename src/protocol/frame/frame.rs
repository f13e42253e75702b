use std::fmt;

use bytes::{Bytes, BytesMut};

use super::{
    coding::{CloseCode, Control, OpCode},
    mask::generate_mask,
    utf8::Utf8Bytes,
};
use crate::error::{Error, ProtocolError, Result};

/// A close frame body: the status code plus a UTF-8 reason.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloseFrame {
    /// The reason as a code.
    pub code: CloseCode,
    /// The reason as text string.
    pub reason: Utf8Bytes,
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// The fixed part of a frame: everything except the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Indicates that the frame is the last one of a possibly fragmented message.
    pub is_final: bool,
    /// Reserved for protocol extensions.
    pub rsv1: bool,
    /// Reserved for protocol extensions.
    pub rsv2: bool,
    /// Reserved for protocol extensions.
    pub rsv3: bool,
    /// WebSocket protocol opcode.
    pub opcode: OpCode,
    /// A frame mask, if any.
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Creates a final, unmasked, extension-free header with the given opcode.
    pub fn new(opcode: OpCode) -> Self {
        Self {
            is_final: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
        }
    }

    /// Returns the on-wire size of the header for the given payload length.
    pub fn len(&self, payload_len: u64) -> usize {
        2 + LengthFormat::for_length(payload_len).extra_bytes()
            + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Appends the wire representation of the header to `dst`, declaring
    /// `length` payload bytes.
    pub(crate) fn format_into(&self, length: u64, dst: &mut BytesMut) {
        let code: u8 = self.opcode.into();
        let one = code
            | if self.is_final { 0x80 } else { 0 }
            | if self.rsv1 { 0x40 } else { 0 }
            | if self.rsv2 { 0x20 } else { 0 }
            | if self.rsv3 { 0x10 } else { 0 };

        let lenfmt = LengthFormat::for_length(length);
        let two = lenfmt.length_byte() | if self.mask.is_some() { 0x80 } else { 0 };

        dst.extend_from_slice(&[one, two]);
        match lenfmt {
            LengthFormat::U8(_) => {}
            LengthFormat::U16 => dst.extend_from_slice(&(length as u16).to_be_bytes()),
            LengthFormat::U64 => dst.extend_from_slice(&length.to_be_bytes()),
        }

        if let Some(ref mask) = self.mask {
            dst.extend_from_slice(mask);
        }
    }
}

/// How a payload length is encoded on the wire: seven bits inline, or an
/// extended 16-bit or 64-bit field.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LengthFormat {
    U8(u8),
    U16,
    U64,
}

impl LengthFormat {
    /// Picks the minimal format for the given length.
    pub fn for_length(length: u64) -> Self {
        match length {
            0..=125 => LengthFormat::U8(length as u8),
            126..=65535 => LengthFormat::U16,
            _ => LengthFormat::U64,
        }
    }

    /// The value of the low seven bits of the second header byte.
    pub fn length_byte(&self) -> u8 {
        match *self {
            LengthFormat::U8(b) => b,
            LengthFormat::U16 => 126,
            LengthFormat::U64 => 127,
        }
    }

    /// Extra header bytes taken by the extended length field.
    pub fn extra_bytes(&self) -> usize {
        match *self {
            LengthFormat::U8(_) => 0,
            LengthFormat::U16 => 2,
            LengthFormat::U64 => 8,
        }
    }

    /// Picks the format from the low seven bits of the second header byte.
    pub fn for_byte(byte: u8) -> Self {
        match byte & 0x7f {
            126 => LengthFormat::U16,
            127 => LengthFormat::U64,
            b => LengthFormat::U8(b),
        }
    }
}

/// A single frame: header plus payload.
///
/// Decoded frames always carry their payload unmasked, even when the header
/// still records the mask key they arrived with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub(crate) header: FrameHeader,
    pub(crate) payload: Bytes,
}

impl Frame {
    /// Returns the total on-wire length of the frame.
    pub fn len(&self) -> usize {
        self.header.len(self.payload.len() as u64) + self.payload.len()
    }

    /// Checks whether the frame is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a reference to the frame's header.
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Returns a mutable reference to the frame's header.
    pub fn header_mut(&mut self) -> &mut FrameHeader {
        &mut self.header
    }

    /// Returns a reference to the frame's payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Checks whether the frame carries a mask key.
    pub fn is_masked(&self) -> bool {
        self.header.mask.is_some()
    }

    /// Stamps the header with a fresh random mask key. Only meaningful for
    /// client-to-server frames; this crate's server side never calls it on
    /// outgoing frames.
    pub fn set_random_mask(&mut self) {
        self.header.mask = Some(generate_mask());
    }

    /// Consumes the frame into its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Consumes the frame into its payload as UTF-8 text.
    pub fn into_text(self) -> Result<Utf8Bytes> {
        self.payload.try_into()
    }

    /// Views the payload as UTF-8 text.
    pub fn to_text(&self) -> Result<&str> {
        Ok(simdutf8::basic::from_utf8(&self.payload)?)
    }

    /// Parses the frame as a close frame body.
    pub fn into_close(self) -> Result<Option<CloseFrame>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol(ProtocolError::InvalidCloseSequence)),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]).into();
                let reason = Utf8Bytes::try_from(self.payload.slice(2..))?;
                Ok(Some(CloseFrame { code, reason }))
            }
        }
    }

    /// Creates a data frame with the given opcode and fin bit.
    pub fn message(payload: impl Into<Bytes>, opcode: OpCode, is_final: bool) -> Frame {
        debug_assert!(
            matches!(opcode, OpCode::Data(_)),
            "Invalid opcode for data frame"
        );

        Frame {
            header: FrameHeader {
                is_final,
                ..FrameHeader::new(opcode)
            },
            payload: payload.into(),
        }
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader::new(OpCode::Control(Control::Ping)),
            payload: payload.into(),
        }
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader::new(OpCode::Control(Control::Pong)),
            payload: payload.into(),
        }
    }

    /// Creates a close frame, echoing the code and reason when given.
    pub fn close(msg: Option<CloseFrame>) -> Frame {
        let payload = if let Some(CloseFrame { code, reason }) = msg {
            let mut buf = BytesMut::with_capacity(reason.len() + 2);
            buf.extend_from_slice(&u16::from(code).to_be_bytes());
            buf.extend_from_slice(reason.as_bytes());
            buf.freeze()
        } else {
            Bytes::new()
        };

        Frame {
            header: FrameHeader::new(OpCode::Control(Control::Close)),
            payload,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<FRAME {} final={} len={}>",
            self.header.opcode,
            self.header.is_final,
            self.payload.len()
        )
    }
}
