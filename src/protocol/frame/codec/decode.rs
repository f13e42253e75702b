use bytes::{Buf, BytesMut};
use monoio_codec::{Decoded, Decoder};

use crate::{
    error::{CapacityError, Error, ProtocolError},
    protocol::frame::{mask::apply_mask, Frame, FrameHeader},
};

/// Decoder for client-to-server WebSocket frames.
///
/// Handles arbitrary chunk boundaries: a frame split across reads stays in
/// the accumulation buffer until the declared payload is complete. The
/// declared length is checked against the frame size limit before any
/// payload byte is buffered.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_size: Option<usize>,
    accept_unmasked: bool,
    ignore_reserved_bits: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(None, false, false)
    }
}

impl FrameDecoder {
    /// Creates a decoder with the given frame size limit and leniency toggles.
    pub fn new(
        max_frame_size: Option<usize>,
        accept_unmasked: bool,
        ignore_reserved_bits: bool,
    ) -> Self {
        Self {
            max_frame_size,
            accept_unmasked,
            ignore_reserved_bits,
        }
    }

    /// Sets the maximum payload size of a single frame.
    pub fn set_max_frame_size(&mut self, max_frame_size: Option<usize>) {
        self.max_frame_size = max_frame_size;
    }

    /// Sets whether unmasked client frames are tolerated.
    pub fn set_accept_unmasked(&mut self, accept_unmasked: bool) {
        self.accept_unmasked = accept_unmasked;
    }

    /// Sets whether non-zero reserved header bits are tolerated.
    pub fn set_ignore_reserved_bits(&mut self, ignore_reserved_bits: bool) {
        self.ignore_reserved_bits = ignore_reserved_bits;
    }

    /// Parses the frame header at the start of `src` without consuming it.
    ///
    /// Returns the header, its on-wire size and the declared payload length,
    /// or `None` when more bytes are needed.
    fn parse_header(src: &[u8]) -> Option<(FrameHeader, usize, u64)> {
        if src.len() < 2 {
            return None;
        }

        let (one, two) = (src[0], src[1]);
        let masked = two & 0x80 != 0;

        let mut cursor = 2;
        let length = match two & 0x7f {
            126 => {
                if src.len() < cursor + 2 {
                    return None;
                }
                let len = u16::from_be_bytes([src[2], src[3]]) as u64;
                cursor += 2;
                len
            }
            127 => {
                if src.len() < cursor + 8 {
                    return None;
                }
                let len = u64::from_be_bytes(src[2..10].try_into().unwrap());
                cursor += 8;
                len
            }
            b => b as u64,
        };

        let mask = if masked {
            if src.len() < cursor + 4 {
                return None;
            }
            let key = [src[cursor], src[cursor + 1], src[cursor + 2], src[cursor + 3]];
            cursor += 4;
            Some(key)
        } else {
            None
        };

        let header = FrameHeader {
            is_final: one & 0x80 != 0,
            rsv1: one & 0x40 != 0,
            rsv2: one & 0x20 != 0,
            rsv3: one & 0x10 != 0,
            opcode: (one & 0x0f).into(),
            mask,
        };

        Some((header, cursor, length))
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Frame>, Error> {
        let Some((header, header_len, length)) = Self::parse_header(src) else {
            return Ok(Decoded::Insufficient);
        };

        if !self.ignore_reserved_bits && (header.rsv1 || header.rsv2 || header.rsv3) {
            return Err(Error::Protocol(ProtocolError::ReservedBitsSet));
        }

        // The client MUST mask all frames that it sends to the server.
        // (RFC 6455)
        if header.mask.is_none() && !self.accept_unmasked {
            return Err(Error::Protocol(ProtocolError::UnmaskedClientFrame));
        }

        if let Some(max_size) = self.max_frame_size {
            if length > max_size as u64 {
                return Err(Error::Capacity(CapacityError::FrameTooLong {
                    size: length as usize,
                    max_size,
                }));
            }
        }

        let payload_len = length as usize;
        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(Decoded::Insufficient);
        }

        src.advance(header_len);
        let mut payload = src.split_to(payload_len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Decoded::Some(Frame {
            header,
            payload: payload.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::coding::{Control, Data, OpCode};

    fn lenient() -> FrameDecoder {
        FrameDecoder::new(None, true, false)
    }

    fn decode_one(decoder: &mut FrameDecoder, bytes: &[u8]) -> Result<Decoded<Frame>, Error> {
        decoder.decode(&mut BytesMut::from(bytes))
    }

    #[test]
    fn decodes_unmasked_text_when_lenient() {
        let frame = match decode_one(&mut lenient(), &[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'])
            .unwrap()
        {
            Decoded::Some(frame) => frame,
            other => panic!("unexpected: {other:?}"),
        };

        assert_eq!(frame.header().opcode, OpCode::Data(Data::Text));
        assert!(frame.header().is_final);
        assert_eq!(frame.payload().as_ref(), b"hello");
    }

    #[test]
    fn unmasks_client_payload() {
        // "abc" masked with [1, 1, 1, 1].
        let bytes = [0x82, 0x83, 1, 1, 1, 1, b'a' ^ 1, b'b' ^ 1, b'c' ^ 1];
        let frame = match decode_one(&mut FrameDecoder::default(), &bytes).unwrap() {
            Decoded::Some(frame) => frame,
            other => panic!("unexpected: {other:?}"),
        };

        assert!(frame.is_masked());
        assert_eq!(frame.payload().as_ref(), b"abc");
    }

    #[test]
    fn rejects_unmasked_client_frame() {
        let result = decode_one(&mut FrameDecoder::default(), &[0x81, 0x01, b'x']);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::UnmaskedClientFrame))
        ));
    }

    #[test]
    fn rejects_reserved_bits() {
        let result = decode_one(&mut lenient(), &[0xc1, 0x01, b'x']);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::ReservedBitsSet))
        ));
    }

    #[test]
    fn ignores_reserved_bits_when_configured() {
        let mut decoder = FrameDecoder::new(None, true, true);
        assert!(matches!(
            decode_one(&mut decoder, &[0xc1, 0x01, b'x']),
            Ok(Decoded::Some(_))
        ));
    }

    #[test]
    fn oversized_declaration_fails_before_payload_arrives() {
        let mut decoder = FrameDecoder::new(Some(16), true, false);
        // Header declares 64 KiB, but only the header is buffered.
        let result = decode_one(&mut decoder, &[0x82, 126, 0xff, 0xff]);
        assert!(matches!(
            result,
            Err(Error::Capacity(CapacityError::FrameTooLong {
                size: 65535,
                max_size: 16
            }))
        ));
    }

    #[test]
    fn partial_frames_wait_for_more_input() {
        let mut decoder = lenient();
        let mut buf = BytesMut::from(&[0x89u8, 0x02, 0x01][..]);
        assert!(matches!(
            decoder.decode(&mut buf).unwrap(),
            Decoded::Insufficient
        ));

        buf.extend_from_slice(&[0x02]);
        let frame = match decoder.decode(&mut buf).unwrap() {
            Decoded::Some(frame) => frame,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(frame.header().opcode, OpCode::Control(Control::Ping));
        assert_eq!(frame.payload().as_ref(), &[1, 2]);
    }

    #[test]
    fn extended_length_boundaries() {
        for (len, header) in [
            (125usize, vec![0x82, 125]),
            (126, vec![0x82, 126, 0, 126]),
            (65535, vec![0x82, 126, 0xff, 0xff]),
            (65536, vec![0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]),
        ] {
            let mut bytes = header;
            bytes.resize(bytes.len() + len, 0xab);
            let frame = match decode_one(&mut lenient(), &bytes).unwrap() {
                Decoded::Some(frame) => frame,
                other => panic!("unexpected for len {len}: {other:?}"),
            };
            assert_eq!(frame.payload().len(), len);
        }
    }
}
