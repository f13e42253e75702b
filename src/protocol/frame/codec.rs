//! WebSocket frame codec over a raw transport.

use bytes::BytesMut;
use monoio::io::{sink::Sink, stream::Stream, AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};
use monoio_codec::{Encoder, FramedRead};

use crate::{error::Error, protocol::frame::Frame};

mod decode;
pub use decode::FrameDecoder;

mod encode;
pub use encode::FrameEncoder;

/// Frame-level reader/writer for one transport.
///
/// Reads go through a [`FramedRead`] accumulation buffer so frames split
/// across arbitrary chunk boundaries reassemble transparently. Writes are
/// collected into a buffer that is flushed once it crosses the configured
/// watermark, or explicitly through [`Sink::flush`].
#[derive(Debug)]
pub struct FrameCodec<IO> {
    inner: FramedRead<IO, FrameDecoder>,
    write_buf: BytesMut,
    write_watermark: usize,
}

impl<IO> FrameCodec<IO> {
    /// Creates a new `FrameCodec`.
    pub fn new(
        io: IO,
        decoder: FrameDecoder,
        read_capacity: usize,
        write_watermark: usize,
    ) -> Self {
        Self {
            inner: FramedRead::with_capacity(io, decoder, read_capacity),
            write_buf: BytesMut::with_capacity(write_watermark),
            write_watermark,
        }
    }

    /// Creates a new `FrameCodec` from an existing `FramedRead`, keeping its
    /// read buffer. Used after the handshake so bytes the client pipelined
    /// behind the upgrade request are not lost.
    pub fn from_framed_read<C>(
        framed_read: FramedRead<IO, C>,
        decoder: FrameDecoder,
        write_watermark: usize,
    ) -> Self {
        Self {
            inner: framed_read.map_decoder(|_| decoder),
            write_buf: BytesMut::with_capacity(write_watermark),
            write_watermark,
        }
    }

    /// Sets the write-buffer watermark.
    pub fn set_write_watermark(&mut self, watermark: usize) {
        self.write_watermark = watermark;
    }

    /// Returns a reference to the underlying `IO`.
    pub fn get_ref(&self) -> &IO {
        self.inner.get_ref()
    }

    /// Returns a mutable reference to the underlying `IO`.
    pub fn get_mut(&mut self) -> &mut IO {
        self.inner.get_mut()
    }

    /// Consumes the `FrameCodec` and returns the underlying `IO`.
    pub fn into_inner(self) -> IO {
        self.inner.into_inner()
    }

    /// Returns a mutable reference to the frame decoder.
    pub fn decoder_mut(&mut self) -> &mut FrameDecoder {
        self.inner.decoder_mut()
    }

    #[inline]
    async fn flush(&mut self) -> std::io::Result<()>
    where
        IO: AsyncWriteRent,
    {
        if self.write_buf.is_empty() {
            return Ok(());
        }

        let buf = std::mem::replace(&mut self.write_buf, BytesMut::new());
        let (res, buf) = self.get_mut().write_all(buf).await;
        self.write_buf = buf;
        res?;

        self.write_buf.clear();
        self.get_mut().flush().await?;
        Ok(())
    }
}

impl<IO> Sink<Frame> for FrameCodec<IO>
where
    IO: AsyncWriteRent,
{
    type Error = Error;

    async fn send(&mut self, frame: Frame) -> Result<(), Self::Error> {
        if self.write_buf.len() > self.write_watermark {
            Self::flush(self).await?;
        }

        FrameEncoder.encode(frame, &mut self.write_buf)?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Self::flush(self).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        Self::flush(self).await?;
        self.get_mut().shutdown().await?;
        Ok(())
    }
}

impl<IO> Stream for FrameCodec<IO>
where
    IO: AsyncReadRent,
{
    type Item = Result<Frame, Error>;

    async fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().await
    }
}

#[cfg(test)]
mod tests {
    use monoio_codec::{Decoded, Decoder};

    use super::*;
    use crate::protocol::frame::coding::{Data, OpCode};

    #[test]
    fn frames_survive_encode_decode_at_length_boundaries() {
        // Boundaries of the 7/16/64-bit length encodings.
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload = vec![0x5au8; len];
            let frame = Frame::message(payload.clone(), OpCode::Data(Data::Binary), true);

            let mut wire = BytesMut::new();
            FrameEncoder.encode(frame, &mut wire).unwrap();

            let mut decoder = FrameDecoder::new(None, true, false);
            let decoded = match decoder.decode(&mut wire).unwrap() {
                Decoded::Some(frame) => frame,
                other => panic!("unexpected for len {len}: {other:?}"),
            };
            assert!(wire.is_empty());
            assert_eq!(decoded.header().opcode, OpCode::Data(Data::Binary));
            assert_eq!(decoded.payload().as_ref(), payload);
        }
    }
}
