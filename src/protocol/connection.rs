//! Frame-level state machine for one upgraded server connection.

use monoio::io::{sink::Sink, stream::Stream, AsyncReadRent, AsyncWriteRent};
use monoio_codec::FramedRead;

use crate::{
    error::{CapacityError, Error, ProtocolError, Result},
    protocol::{
        frame::{
            codec::{FrameCodec, FrameDecoder},
            coding::{CloseCode, Control, Data, OpCode},
            CloseFrame, Frame, Utf8Bytes,
        },
        message::{FragmentBuffer, Message},
    },
};

/// The configuration for an upgraded WebSocket connection.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// The initial capacity of the read buffer. This buffer is pre-allocated
    /// and can hold at least the specified number of bytes without requiring
    /// reallocation.
    ///
    /// The default value is 128 KiB.
    pub initial_read_capacity: usize,
    /// The target minimum size of the write buffer to reach before writing
    /// the data to the underlying stream.
    ///
    /// The default value is 128 KiB.
    ///
    /// If set to `0` each message will be eagerly written to the underlying
    /// stream. It is often more optimal to allow them to buffer a little,
    /// hence the default value.
    pub write_buffer_size: usize,
    /// The maximum size of an assembled incoming message. `None` means no
    /// size limit.
    ///
    /// The default value is 64 MiB, which should be reasonably big for all
    /// normal use-cases but small enough to prevent memory eating by a
    /// malicious user.
    pub max_message_size: Option<usize>,
    /// The maximum payload size of a single incoming frame. `None` means no
    /// size limit.
    ///
    /// The default value is 16 MiB.
    pub max_frame_size: Option<usize>,
    /// When set to `true`, unmasked frames from the client are accepted and
    /// handled.
    ///
    /// According to RFC 6455 the server must close the connection in such
    /// cases, however some popular client libraries send unmasked frames
    /// regardless. By default this option is `false`.
    pub accept_unmasked_frames: bool,
    /// When set to `true`, non-zero reserved header bits are tolerated
    /// instead of failing the connection. Useful when talking to peers that
    /// negotiated an extension out of band. Defaults to `false`.
    pub ignore_reserved_bits: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_read_capacity: 128 * 1024,
            write_buffer_size: 128 * 1024,
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            accept_unmasked_frames: false,
            ignore_reserved_bits: false,
        }
    }
}

impl ConnectionConfig {
    /// Sets [`Self::initial_read_capacity`].
    pub fn initial_read_capacity(mut self, initial_read_capacity: usize) -> Self {
        self.initial_read_capacity = initial_read_capacity;
        self
    }

    /// Sets [`Self::write_buffer_size`].
    pub fn write_buffer_size(mut self, write_buffer_size: usize) -> Self {
        self.write_buffer_size = write_buffer_size;
        self
    }

    /// Sets [`Self::max_message_size`].
    pub fn max_message_size(mut self, max_message_size: Option<usize>) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Sets [`Self::max_frame_size`].
    pub fn max_frame_size(mut self, max_frame_size: Option<usize>) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Sets [`Self::accept_unmasked_frames`].
    pub fn accept_unmasked_frames(mut self, accept_unmasked_frames: bool) -> Self {
        self.accept_unmasked_frames = accept_unmasked_frames;
        self
    }

    /// Sets [`Self::ignore_reserved_bits`].
    pub fn ignore_reserved_bits(mut self, ignore_reserved_bits: bool) -> Self {
        self.ignore_reserved_bits = ignore_reserved_bits;
        self
    }

    fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(
            self.max_frame_size,
            self.accept_unmasked_frames,
            self.ignore_reserved_bits,
        )
    }
}

/// The server end of one upgraded WebSocket connection.
///
/// Created by the handshake (or [`Connection::from_raw_socket`] when the
/// upgrade happened elsewhere), destroyed when the socket closes. Owns the
/// transport exclusively; nothing else reads or writes it concurrently.
#[derive(Debug)]
pub struct Connection<S>
where
    S: AsyncWriteRent + AsyncReadRent,
{
    codec: FrameCodec<S>,
    state: ConnState,
    fragments: Option<FragmentBuffer>,
    config: ConnectionConfig,
}

impl<S> Connection<S>
where
    S: AsyncWriteRent + AsyncReadRent,
{
    /// Wraps a raw socket that already completed the upgrade handshake.
    pub fn from_raw_socket(stream: S, config: Option<ConnectionConfig>) -> Self {
        let config = config.unwrap_or_default();
        let codec = FrameCodec::new(
            stream,
            config.decoder(),
            config.initial_read_capacity,
            config.write_buffer_size,
        );
        Self::with_codec(codec, config)
    }

    /// Takes over the framed reader used for the handshake, keeping any
    /// bytes the client sent behind the upgrade request.
    pub(crate) fn from_framed_read<C>(
        framed_read: FramedRead<S, C>,
        config: Option<ConnectionConfig>,
    ) -> Self {
        let config = config.unwrap_or_default();
        let codec =
            FrameCodec::from_framed_read(framed_read, config.decoder(), config.write_buffer_size);
        Self::with_codec(codec, config)
    }

    fn with_codec(codec: FrameCodec<S>, config: ConnectionConfig) -> Self {
        Self {
            codec,
            state: ConnState::Open,
            fragments: None,
            config,
        }
    }

    /// Changes the configuration.
    pub fn set_config(&mut self, set_func: impl FnOnce(&mut ConnectionConfig)) {
        set_func(&mut self.config);

        let decoder = self.codec.decoder_mut();
        decoder.set_max_frame_size(self.config.max_frame_size);
        decoder.set_accept_unmasked(self.config.accept_unmasked_frames);
        decoder.set_ignore_reserved_bits(self.config.ignore_reserved_bits);
        self.codec
            .set_write_watermark(self.config.write_buffer_size);
    }

    /// Reads the configuration.
    pub fn get_config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Checks if it is possible to read messages.
    ///
    /// Reading is impossible after receiving the peer's close frame. It is
    /// still possible after sending our close frame, since the peer may have
    /// data in flight from before it learns about the closure.
    pub fn can_read(&self) -> bool {
        self.state.can_read()
    }

    /// Checks if it is possible to write messages.
    ///
    /// Writing gets impossible as soon as the close handshake starts.
    pub fn can_write(&self) -> bool {
        self.state.is_open()
    }

    /// Reads the next message from the connection.
    ///
    /// Control frames are handled inline: pings are answered with an equal
    /// pong automatically, pongs and pings are also surfaced to the caller,
    /// and a close frame is echoed back once before being returned as
    /// [`Message::Close`]. Fragmented data frames are buffered until their
    /// final fragment and returned as one assembled message.
    pub async fn read(&mut self) -> Result<Message> {
        self.state.check_not_terminated()?;

        if !self.state.can_read() {
            // The peer's close frame has been answered already; the exchange
            // is complete and the server closes the TCP connection first.
            self.state = ConnState::Closed;
            self.codec.close().await?;
            return Err(Error::ConnectionClosed);
        }

        loop {
            let (message, reply) = self.advance().await?;
            if let Some(reply) = reply {
                self.send_frame(reply).await?;
                Sink::<Frame>::flush(&mut self.codec).await?;
            }

            if let Some(message) = message {
                return Ok(message);
            }
        }
    }

    /// Writes a message into the connection.
    ///
    /// Does **not** flush; see [`Connection::flush`].
    pub async fn write(&mut self, message: Message) -> Result<()> {
        self.state.check_not_terminated()?;

        if !self.state.is_open() {
            return Err(Error::Protocol(ProtocolError::SendAfterClosing));
        }

        let frame = match message {
            Message::Text(data) => Frame::message(data, OpCode::Data(Data::Text), true),
            Message::Binary(data) => Frame::message(data, OpCode::Data(Data::Binary), true),
            Message::Ping(data) => Frame::ping(data),
            Message::Pong(data) => Frame::pong(data),
            Message::Close(close) => return self.close(close).await,
            Message::Frame(frame) => frame,
        };

        self.send_frame(frame).await
    }

    /// Starts the close handshake.
    ///
    /// The close frame is queued exactly once; repeated calls only flush.
    /// Calling this is equivalent to writing `Message::Close(..)`.
    pub async fn close(&mut self, close: Option<CloseFrame>) -> Result<()> {
        if self.state.is_open() {
            self.state = ConnState::SentClose;
            let frame = Frame::close(close);
            self.send_frame(frame).await?;
        }

        self.flush().await
    }

    /// Flushes all queued writes into the transport.
    ///
    /// When the close handshake has completed from our point of view, this
    /// also shuts the transport down and reports [`Error::ConnectionClosed`].
    pub async fn flush(&mut self) -> Result<()> {
        if !self.state.can_read() {
            self.state = ConnState::Closed;
            self.codec.close().await?;
            return Err(Error::ConnectionClosed);
        }

        Sink::<Frame>::flush(&mut self.codec).await?;
        Ok(())
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let res = self.codec.send(frame).await;
        self.check_connection_reset(res)
    }

    /// Pulls one frame and folds it into the session state. Returns the
    /// assembled message, if any, plus a control reply to send back.
    async fn advance(&mut self) -> Result<(Option<Message>, Option<Frame>)> {
        let next = self.codec.next().await.transpose();
        match self.check_connection_reset(next)? {
            Some(frame) => {
                if !self.state.can_read() {
                    return Err(Error::Protocol(ProtocolError::ReceivedAfterClosing));
                }

                self.handle_frame(frame)
            }

            // EOF from the peer.
            None => match std::mem::replace(&mut self.state, ConnState::Closed) {
                ConnState::ReceivedClose | ConnState::CloseAcked => Err(Error::ConnectionClosed),
                _ => Err(Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)),
            },
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(Option<Message>, Option<Frame>)> {
        match frame.header().opcode {
            OpCode::Control(control) => self.handle_control_frame(control, frame),
            OpCode::Data(data) => Ok((self.handle_data_frame(data, frame)?, None)),
        }
    }

    fn handle_control_frame(
        &mut self,
        control: Control,
        frame: Frame,
    ) -> Result<(Option<Message>, Option<Frame>)> {
        // All control frames MUST have a payload length of 125 bytes or less
        // and MUST NOT be fragmented. (RFC 6455)
        if !frame.header().is_final {
            return Err(Error::Protocol(ProtocolError::FragmentedControlFrame));
        }
        if frame.payload().len() > 125 {
            return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
        }

        match control {
            Control::Close => {
                let (message, reply) = self.handle_close(frame.into_close()?);
                Ok((message.map(Message::Close), reply))
            }

            Control::Ping => {
                let data = frame.into_payload();
                // No ping processing once we are closing.
                let reply = self.state.is_open().then(|| Frame::pong(data.clone()));
                Ok((Some(Message::Ping(data)), reply))
            }

            Control::Pong => Ok((Some(Message::Pong(frame.into_payload())), None)),

            Control::Reserved(code) => Err(Error::Protocol(
                ProtocolError::UnknownControlFrameType(code),
            )),
        }
    }

    fn handle_data_frame(&mut self, data: Data, frame: Frame) -> Result<Option<Message>> {
        let fin = frame.header().is_final;

        match data {
            Data::Continue => {
                let Some(buffer) = self.fragments.as_mut() else {
                    return Err(Error::Protocol(ProtocolError::UnexpectedContinueFrame));
                };
                buffer.push(frame.into_payload(), self.config.max_message_size)?;

                if fin {
                    // The take cannot miss: writes above went through as_mut.
                    self.fragments.take().unwrap().complete().map(Some)
                } else {
                    Ok(None)
                }
            }

            _ if self.fragments.is_some() => {
                Err(Error::Protocol(ProtocolError::ExpectedFragment(data)))
            }

            Data::Text | Data::Binary if fin => {
                self.check_message_size(frame.payload().len())?;
                match data {
                    Data::Text => Ok(Some(Message::Text(frame.into_text()?))),
                    _ => Ok(Some(Message::Binary(frame.into_payload()))),
                }
            }

            Data::Text | Data::Binary => {
                let mut buffer = if data == Data::Text {
                    FragmentBuffer::text()
                } else {
                    FragmentBuffer::binary()
                };
                buffer.push(frame.into_payload(), self.config.max_message_size)?;
                self.fragments = Some(buffer);
                Ok(None)
            }

            Data::Reserved(code) => Err(Error::Protocol(ProtocolError::UnknownDataFrameType(code))),
        }
    }

    /// Folds a received close frame into the state machine.
    ///
    /// Returns the close message to surface to the caller, if any, and the
    /// echo frame to send back to the peer, if one is still owed.
    fn handle_close(
        &mut self,
        close: Option<CloseFrame>,
    ) -> (Option<Option<CloseFrame>>, Option<Frame>) {
        match self.state {
            ConnState::Open => {
                self.state = ConnState::ReceivedClose;

                // Echo the peer's code; an absent code is answered with an
                // explicit normal closure. Disallowed codes become 1002.
                let close = Some(match close.clone() {
                    Some(frame) if !frame.code.is_allowed() => CloseFrame {
                        code: CloseCode::Protocol,
                        reason: Utf8Bytes::from_static("Protocol violation"),
                    },
                    Some(frame) => frame,
                    None => CloseFrame {
                        code: CloseCode::Normal,
                        reason: Utf8Bytes::default(),
                    },
                });

                let reply = Frame::close(close.clone());
                (Some(close), Some(reply))
            }

            ConnState::SentClose => {
                // The peer acknowledged our close.
                self.state = ConnState::CloseAcked;
                (Some(close), None)
            }

            ConnState::ReceivedClose | ConnState::CloseAcked => (None, None),

            ConnState::Closed => unreachable!("read past termination"),
        }
    }

    fn check_message_size(&self, size: usize) -> Result<()> {
        match self.config.max_message_size {
            Some(max_size) if size > max_size => {
                Err(Error::Capacity(CapacityError::MessageTooLong {
                    size,
                    max_size,
                }))
            }
            _ => Ok(()),
        }
    }

    /// Translates "connection reset by peer" into `ConnectionClosed` once the
    /// close handshake has made reading impossible anyway.
    fn check_connection_reset<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(Error::Io(err))
                if !self.state.can_read()
                    && err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                Err(Error::ConnectionClosed)
            }
            other => other,
        }
    }
}

impl<S> Stream for Connection<S>
where
    S: AsyncWriteRent + AsyncReadRent,
{
    type Item = Result<Message>;

    #[inline]
    async fn next(&mut self) -> Option<Self::Item> {
        match self.read().await {
            Ok(message) => Some(Ok(message)),
            Err(Error::AlreadyClosed | Error::ConnectionClosed) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl<S> Sink<Message> for Connection<S>
where
    S: AsyncWriteRent + AsyncReadRent,
{
    type Error = Error;

    async fn send(&mut self, item: Message) -> Result<(), Self::Error> {
        self.write(item).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        match Connection::flush(self).await {
            Ok(()) | Err(Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        match Connection::close(self, None).await {
            Ok(()) | Err(Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Where one connection stands in its lifecycle.
///
/// A connection only exists once the 101 response is on the wire, so the
/// machine starts at `Open` and moves strictly forward to `Closed`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ConnState {
    /// Both directions are live.
    Open,
    /// We initiated the close handshake and wait for the acknowledgment.
    SentClose,
    /// The peer initiated the close handshake and we echoed it.
    ReceivedClose,
    /// The peer acknowledged the close we initiated.
    CloseAcked,
    /// The connection does not exist anymore.
    Closed,
}

impl ConnState {
    /// Tells if we're allowed to send normal messages.
    fn is_open(self) -> bool {
        matches!(self, ConnState::Open)
    }

    /// Tells if we should keep processing incoming data. After we sent a
    /// close the peer may still deliver messages that were in flight, so
    /// `SentClose` still reads.
    fn can_read(self) -> bool {
        matches!(self, ConnState::Open | ConnState::SentClose)
    }

    fn check_not_terminated(self) -> Result<()> {
        match self {
            ConnState::Closed => Err(Error::AlreadyClosed),
            _ => Ok(()),
        }
    }
}
