use bytes::BytesMut;
use monoio_codec::Encoder;

use crate::{
    error::Error,
    protocol::frame::{mask::apply_mask, Frame},
};

/// Encoder for server-to-client WebSocket frames.
///
/// A frame is masked on the way out only when its header carries a mask key;
/// frames sent by the server never do (RFC 6455 forbids it), so the masking
/// path is exercised only by tests and tooling that forge client traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder;

impl Encoder<Frame> for FrameEncoder {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(frame.len());
        frame
            .header
            .format_into(frame.payload.len() as u64, dst);

        let payload_start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = frame.header.mask {
            apply_mask(&mut dst[payload_start..], mask);
        }

        Ok(())
    }
}
