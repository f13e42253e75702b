//! Per-connection session tasks.
//!
//! [`spawn`] moves an upgraded [`Connection`] into its own task and hands
//! back two halves: a cloneable [`SessionHandle`] for outgoing traffic and a
//! [`MessageStream`] yielding everything the peer sends. Each session owns
//! its transport exclusively, so a failure in one session never touches
//! another.

use std::time::Duration;

use local_sync::mpsc::bounded::{self, Rx, Tx};
use monoio::io::{stream::Stream, AsyncReadRent, AsyncWriteRent};

use crate::{
    error::{Error, Result},
    protocol::{
        frame::{coding::CloseCode, CloseFrame, Utf8Bytes},
        Connection, Message,
    },
};

/// Tunables for one session task.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Capacity of the outgoing command queue. [`SessionHandle::send`]
    /// blocks once this many commands are waiting, so a slow socket slows
    /// its producers down instead of growing memory without bound.
    pub outgoing_queue_depth: usize,
    /// How long to wait for the peer's close reply after starting the close
    /// handshake before dropping the transport.
    pub linger_timeout: Duration,
    /// Closes the session when nothing has been received for this long.
    /// `None` disables the idle check.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outgoing_queue_depth: 32,
            linger_timeout: Duration::from_secs(5),
            idle_timeout: None,
        }
    }
}

enum Command {
    Send(Message),
    Close(Option<CloseFrame>),
}

/// Sending half of a session.
///
/// Cheap to clone; all clones feed the same bounded queue. Every method
/// reports [`Error::ConnectionClosed`] once the session task has finished.
pub struct SessionHandle {
    commands: Tx<Command>,
}

impl Clone for SessionHandle {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl SessionHandle {
    /// Queues a message for delivery, waiting for queue space if the session
    /// is backed up.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.commands
            .send(Command::Send(message))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Starts the close handshake with the given code and reason.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        self.commands
            .send(Command::Close(Some(CloseFrame {
                code,
                reason: reason.to_owned().into(),
            })))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Receiving half of a session. Yields `None` once the session has finished,
/// cleanly or otherwise.
pub struct MessageStream {
    incoming: Rx<Message>,
}

impl Stream for MessageStream {
    type Item = Message;

    async fn next(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }
}

/// Moves `connection` into its own task and returns the two session halves.
///
/// The task runs until the close handshake completes, the peer misbehaves,
/// the idle deadline passes, or every [`SessionHandle`] clone is dropped.
/// Whichever way it ends, the task attempts an orderly close and then lets
/// the transport drop.
pub fn spawn<S>(connection: Connection<S>, config: SessionConfig) -> (SessionHandle, MessageStream)
where
    S: AsyncReadRent + AsyncWriteRent + 'static,
{
    let (command_tx, command_rx) = bounded::channel(config.outgoing_queue_depth);
    let (message_tx, message_rx) = bounded::channel(config.outgoing_queue_depth);

    monoio::spawn(drive(connection, command_rx, message_tx, config));

    (
        SessionHandle {
            commands: command_tx,
        },
        MessageStream {
            incoming: message_rx,
        },
    )
}

enum ReadEvent {
    Message(Message),
    Idle,
    Finished,
    Failed(Error),
}

async fn read_next<S>(connection: &mut Connection<S>, idle: Option<Duration>) -> ReadEvent
where
    S: AsyncReadRent + AsyncWriteRent,
{
    let result = match idle {
        Some(limit) => match monoio::time::timeout(limit, connection.read()).await {
            Ok(result) => result,
            Err(_) => return ReadEvent::Idle,
        },
        None => connection.read().await,
    };

    match result {
        Ok(message) => ReadEvent::Message(message),
        Err(Error::ConnectionClosed) => ReadEvent::Finished,
        Err(err) => ReadEvent::Failed(err),
    }
}

/// The close frame sent when the session itself decided to stop.
fn shutdown_frame(error: &Error, reason: &'static str) -> Option<CloseFrame> {
    let code = match error {
        Error::Capacity(_) => CloseCode::Size,
        Error::Utf8(_) => CloseCode::Invalid,
        Error::Protocol(_) => CloseCode::Protocol,
        _ => return None,
    };
    Some(CloseFrame {
        code,
        reason: reason.into(),
    })
}

async fn drive<S>(
    mut connection: Connection<S>,
    mut commands: Rx<Command>,
    messages: Tx<Message>,
    config: SessionConfig,
) where
    S: AsyncReadRent + AsyncWriteRent,
{
    let close = loop {
        monoio::select! {
            event = read_next(&mut connection, config.idle_timeout) => match event {
                ReadEvent::Message(message) => {
                    if messages.send(message).await.is_err() {
                        // The consumer went away; nothing left to deliver to.
                        break Some(CloseFrame {
                            code: CloseCode::Away,
                            reason: "server going away".into(),
                        });
                    }
                }
                ReadEvent::Idle => {
                    log::debug!("closing idle session");
                    break Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: "idle timeout".into(),
                    });
                }
                ReadEvent::Finished => return,
                ReadEvent::Failed(err) => {
                    log::warn!("session failed: {err}");
                    break shutdown_frame(&err, "protocol violation");
                }
            },

            command = commands.recv() => match command {
                Some(Command::Send(message)) => {
                    if let Err(err) = send(&mut connection, message).await {
                        log::warn!("session write failed: {err}");
                        return;
                    }
                }
                Some(Command::Close(frame)) => break frame,
                // Every handle is gone; close the connection normally.
                None => break Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::default(),
                }),
            },
        }
    };

    shutdown(connection, close, config.linger_timeout).await;
}

async fn send<S>(connection: &mut Connection<S>, message: Message) -> Result<()>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    connection.write(message).await?;
    connection.flush().await
}

/// Sends our close frame, then keeps reading until the peer echoes it or the
/// linger deadline passes, then drops the transport.
async fn shutdown<S>(
    mut connection: Connection<S>,
    close: Option<CloseFrame>,
    linger: Duration,
) where
    S: AsyncReadRent + AsyncWriteRent,
{
    if let Err(err) = connection.close(close).await {
        if !matches!(err, Error::ConnectionClosed) {
            log::debug!("close failed: {err}");
        }
        return;
    }

    let drain = async {
        loop {
            match connection.read().await {
                Ok(_) => continue,
                Err(Error::ConnectionClosed) => return,
                Err(err) => {
                    log::debug!("error while closing: {err}");
                    return;
                }
            }
        }
    };

    if monoio::time::timeout(linger, drain).await.is_err() {
        log::debug!("peer did not finish the close handshake in time");
    }
}
