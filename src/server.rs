//! Accepting incoming upgrade requests.

use monoio::{
    io::{AsyncReadRent, AsyncWriteRent},
    net::TcpListener,
};

use crate::{
    config::ServerConfig,
    error::{Error, ProtocolError, Result},
    handshake::server::{server_handshake, AcceptPolicy},
    protocol::{Connection, ConnectionConfig},
    session::{self, MessageStream, SessionHandle},
};

/// Accepts the given stream as a WebSocket connection with default settings.
pub async fn accept<S>(stream: S) -> Result<Connection<S>>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    accept_with_config(stream, &AcceptPolicy::permissive(), None).await
}

/// The same as [`accept`] but the caller controls validation and frame
/// limits.
pub async fn accept_with_config<S>(
    stream: S,
    policy: &AcceptPolicy,
    config: Option<ConnectionConfig>,
) -> Result<Connection<S>>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    server_handshake(stream, policy, config).await
}

/// Turns accepted sockets into running sessions according to a
/// [`ServerConfig`].
///
/// One acceptor serves any number of sockets; each successful upgrade gets
/// its own session task.
#[derive(Debug, Clone)]
pub struct Acceptor {
    config: ServerConfig,
    policy: AcceptPolicy,
}

impl Acceptor {
    /// Builds an acceptor from a server configuration.
    pub fn new(config: ServerConfig) -> Self {
        let policy = config.accept_policy();
        Self { config, policy }
    }

    /// Runs the upgrade handshake on `stream` under the handshake deadline.
    ///
    /// A client that does not complete the exchange in time gets its socket
    /// dropped without a response and
    /// [`ProtocolError::HandshakeTimedOut`] is reported.
    pub async fn accept<S>(&self, stream: S) -> Result<Connection<S>>
    where
        S: AsyncReadRent + AsyncWriteRent,
    {
        let handshake = server_handshake(
            stream,
            &self.policy,
            Some(self.config.connection_config()),
        );

        match monoio::time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("handshake timed out");
                Err(Error::Protocol(ProtocolError::HandshakeTimedOut))
            }
        }
    }

    /// Upgrades `stream` and spawns a session task for it.
    pub async fn serve<S>(&self, stream: S) -> Result<(SessionHandle, MessageStream)>
    where
        S: AsyncReadRent + AsyncWriteRent + 'static,
    {
        let connection = self.accept(stream).await?;
        Ok(session::spawn(connection, self.config.session_config()))
    }

    /// Accepts sockets from `listener` forever, spawning a session for each
    /// and handing both session halves to `on_session`.
    ///
    /// Handshake failures are logged and the offending socket dropped; they
    /// never affect other sessions or the accept loop itself.
    pub async fn listen<F>(&self, listener: TcpListener, mut on_session: F) -> Result<()>
    where
        F: FnMut(SessionHandle, MessageStream),
    {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("incoming connection from {addr}");

            match self.serve(stream).await {
                Ok((handle, messages)) => on_session(handle, messages),
                Err(err) => log::warn!("connection from {addr} not upgraded: {err}"),
            }
        }
    }
}
