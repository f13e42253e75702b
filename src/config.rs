//! Server-wide configuration.

use std::time::Duration;

use crate::{
    handshake::server::AcceptPolicy,
    protocol::ConnectionConfig,
    session::SessionConfig,
};

/// Configuration for a listening server and the sessions it spawns.
///
/// The defaults accept any `Host` and any `Origin` and cap payloads at one
/// megabyte. Timeouts of zero disable the corresponding deadline.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The `host:port` incoming requests must carry in `Host`. `None`
    /// disables the check.
    pub bind_host: Option<String>,
    /// Origins accepted during the handshake. `None` disables origin
    /// checking entirely.
    pub allowed_origins: Option<Vec<String>>,
    /// Upper bound for a single frame payload and for a reassembled
    /// fragmented message.
    pub max_payload_size: usize,
    /// How long a client may take to deliver a complete upgrade request.
    pub handshake_timeout: Duration,
    /// How long to wait for the peer's close reply before dropping the
    /// transport.
    pub linger_timeout: Duration,
    /// Closes a session that has not received anything for this long.
    /// `None` keeps idle sessions open indefinitely.
    pub idle_timeout: Option<Duration>,
    /// Capacity of each session's outgoing queue. Senders block once the
    /// queue is full.
    pub outgoing_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: None,
            allowed_origins: None,
            max_payload_size: 1 << 20,
            handshake_timeout: Duration::from_secs(10),
            linger_timeout: Duration::from_secs(5),
            idle_timeout: None,
            outgoing_queue_depth: 32,
        }
    }
}

impl ServerConfig {
    /// Pins the `Host` header to `host`.
    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = Some(host.into());
        self
    }

    /// Enables origin checking against the given set.
    pub fn allowed_origins<I, T>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.allowed_origins = Some(origins.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the payload cap for frames and reassembled messages.
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Sets the handshake deadline.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets how long a closing session waits for the peer's close reply.
    pub fn linger_timeout(mut self, timeout: Duration) -> Self {
        self.linger_timeout = timeout;
        self
    }

    /// Sets the receive-idle deadline.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the outgoing queue capacity per session.
    pub fn outgoing_queue_depth(mut self, depth: usize) -> Self {
        self.outgoing_queue_depth = depth;
        self
    }

    /// The handshake validation policy this configuration describes.
    pub fn accept_policy(&self) -> AcceptPolicy {
        let policy = match &self.bind_host {
            Some(host) => AcceptPolicy::new(host.clone()),
            None => AcceptPolicy::permissive(),
        };
        match &self.allowed_origins {
            Some(origins) => policy.allow_origins(origins.iter().cloned()),
            None => policy,
        }
    }

    /// The frame-layer configuration this configuration describes.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::default()
            .max_frame_size(Some(self.max_payload_size))
            .max_message_size(Some(self.max_payload_size))
    }

    /// The session-task configuration this configuration describes.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            outgoing_queue_depth: self.outgoing_queue_depth,
            linger_timeout: self.linger_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}
